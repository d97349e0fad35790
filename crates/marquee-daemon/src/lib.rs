//! Marquee Daemon Library
//!
//! Runtime-coordination core for the Marquee shared-playback service:
//! - Media queue and ticketed enqueue protocol with payment confirmation
//! - Points ledger with overdraw protection
//! - Rewards handler: spectator registry, activity challenges, distribution
//! - Application sandbox for untrusted scripts with capability modules
//! - SQLite storage for balances, applications and moderation state

pub mod apprunner;
pub mod chat;
pub mod configuration;
pub mod enqueue;
pub mod gatekeeper;
pub mod ipreputation;
pub mod media;
pub mod moderation;
pub mod payment;
pub mod points;
pub mod queue;
pub mod rewards;
pub mod storage;
