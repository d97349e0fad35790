//! Moderation store capability.
//!
//! Durable moderation decisions live with an external collaborator; the core
//! consults them through this narrow surface. The in-memory implementation
//! backs tests and standalone runs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

/// Moderation decisions the core consults.
#[async_trait]
pub trait ModerationStore: Send + Sync {
    async fn remote_address_banned_from_enqueuing(&self, remote_address: &str) -> bool;

    async fn address_banned_from_enqueuing(&self, address: &str) -> bool;

    /// Explicit exemption from IP reputation checks for this reward address.
    async fn address_skips_ip_reputation_checks(&self, address: &str) -> bool;

    async fn address_banned_from_chat(&self, address: &str) -> bool;
}

/// In-memory moderation state with setters for each decision.
#[derive(Default)]
pub struct InMemoryModerationStore {
    banned_remote_addresses: Mutex<HashSet<String>>,
    banned_addresses: Mutex<HashSet<String>>,
    reputation_exempt: Mutex<HashSet<String>>,
    chat_banned: Mutex<HashSet<String>>,
}

impl InMemoryModerationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ban_remote_address_from_enqueuing(&self, remote_address: &str) {
        self.banned_remote_addresses
            .lock()
            .expect("moderation store poisoned")
            .insert(remote_address.to_string());
    }

    pub fn ban_address_from_enqueuing(&self, address: &str) {
        self.banned_addresses
            .lock()
            .expect("moderation store poisoned")
            .insert(address.to_string());
    }

    pub fn exempt_address_from_reputation_checks(&self, address: &str) {
        self.reputation_exempt
            .lock()
            .expect("moderation store poisoned")
            .insert(address.to_string());
    }

    pub fn ban_address_from_chat(&self, address: &str) {
        self.chat_banned
            .lock()
            .expect("moderation store poisoned")
            .insert(address.to_string());
    }
}

#[async_trait]
impl ModerationStore for InMemoryModerationStore {
    async fn remote_address_banned_from_enqueuing(&self, remote_address: &str) -> bool {
        self.banned_remote_addresses
            .lock()
            .expect("moderation store poisoned")
            .contains(remote_address)
    }

    async fn address_banned_from_enqueuing(&self, address: &str) -> bool {
        self.banned_addresses
            .lock()
            .expect("moderation store poisoned")
            .contains(address)
    }

    async fn address_skips_ip_reputation_checks(&self, address: &str) -> bool {
        self.reputation_exempt
            .lock()
            .expect("moderation store poisoned")
            .contains(address)
    }

    async fn address_banned_from_chat(&self, address: &str) -> bool {
        self.chat_banned
            .lock()
            .expect("moderation store poisoned")
            .contains(address)
    }
}
