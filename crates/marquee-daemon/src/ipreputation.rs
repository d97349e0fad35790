//! IP reputation capability.
//!
//! The actual reputation provider is an external collaborator; the core asks
//! one question (may this address receive rewards?) and feeds it addresses
//! to check in the background.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Checker capability consumed by the rewards handler.
pub trait IpReputationChecker: Send + Sync {
    /// `None` when the address has not been checked yet.
    fn can_receive_rewards(&self, remote_address: &str) -> Option<bool>;

    /// Queue an address for (asynchronous) checking.
    fn enqueue_address_for_checking(&self, remote_address: &str);
}

/// Treats every address as fine; the standalone default.
pub struct PermissiveIpReputationChecker;

impl IpReputationChecker for PermissiveIpReputationChecker {
    fn can_receive_rewards(&self, _remote_address: &str) -> Option<bool> {
        Some(true)
    }

    fn enqueue_address_for_checking(&self, _remote_address: &str) {}
}

/// Fixed verdict list, for tests and manual denylisting.
#[derive(Default)]
pub struct StaticIpReputationChecker {
    bad: Mutex<HashSet<String>>,
}

impl StaticIpReputationChecker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_bad(&self, remote_address: &str) {
        self.bad
            .lock()
            .expect("reputation set poisoned")
            .insert(remote_address.to_string());
    }
}

impl IpReputationChecker for StaticIpReputationChecker {
    fn can_receive_rewards(&self, remote_address: &str) -> Option<bool> {
        Some(
            !self
                .bad
                .lock()
                .expect("reputation set poisoned")
                .contains(remote_address),
        )
    }

    fn enqueue_address_for_checking(&self, _remote_address: &str) {}
}
