//! Configuration for Marquee components.
//!
//! Serde-backed config structs with built-in defaults, optionally overlaid
//! from a JSON settings file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete Marquee configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub enqueue: EnqueueConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Daemon-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "marquee_daemon=info".to_string(),
            log_json: false,
        }
    }
}

/// Media queue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub skipping_enabled: bool,
    pub removal_of_own_entries_allowed: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            skipping_enabled: true,
            removal_of_own_entries_allowed: true,
        }
    }
}

/// Enqueue protocol knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueConfig {
    /// Lifetime of an unpaid ticket (seconds).
    pub ticket_lifetime_secs: u64,
    /// Short-term per-address bucket: `short_term_burst` requests per
    /// `short_term_period_secs`.
    pub short_term_burst: u64,
    pub short_term_period_secs: u64,
    /// Long-term per-address bucket.
    pub long_term_burst: u64,
    pub long_term_period_secs: u64,
    /// Enqueuing-password attempts allowed per address per hour.
    pub password_attempt_burst: u64,
    /// Points charged for enqueuing with hidden media information.
    pub concealed_entry_points_cost: i64,
    /// Base request price, in centiraw.
    pub base_price_centi: u64,
    /// Additional price per full minute of media length, in centiraw.
    pub price_per_minute_centi: u64,
    /// Maximum allowed media length (seconds).
    pub max_media_length_secs: u64,
    /// Window during which recently played media may not be re-enqueued
    /// (seconds).
    pub replay_cooldown_secs: u64,
}

impl Default for EnqueueConfig {
    fn default() -> Self {
        Self {
            ticket_lifetime_secs: 600,
            short_term_burst: 5,
            short_term_period_secs: 60,
            long_term_burst: 20,
            long_term_period_secs: 3600,
            password_attempt_burst: 10,
            concealed_entry_points_cost: 690,
            base_price_centi: 25,
            price_per_minute_centi: 19,
            max_media_length_secs: 35 * 60,
            replay_cooldown_secs: 2 * 3600,
        }
    }
}

/// Rewards handler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsConfig {
    /// Disconnected spectators are purged after this many seconds.
    pub spectator_purge_after_secs: u64,
    /// Purge sweep cadence (seconds).
    pub purge_interval_secs: u64,
    /// Grace period after disconnect during which a spectator still counts
    /// as present for distribution (seconds).
    pub disconnect_grace_secs: u64,
    /// Activity challenge tolerance (seconds); zero under no-tolerance.
    pub challenge_tolerance_secs: u64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            spectator_purge_after_secs: 15 * 60,
            purge_interval_secs: 10 * 60,
            disconnect_grace_secs: 60,
            challenge_tolerance_secs: 60,
        }
    }
}

/// Application sandbox knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// How long the event loop may go without servicing tasks before the
    /// watchdog force-terminates the instance (seconds).
    pub event_loop_stuck_tolerance_secs: u64,
    /// Retention of logs for stopped applications (seconds).
    pub recent_log_retention_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            event_loop_stuck_tolerance_secs: 30,
            recent_log_retention_secs: 3600,
        }
    }
}

/// Load configuration, overlaying the given settings file (if any) on the
/// defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        None => Ok(Config::default()),
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
            serde_json::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.enqueue.ticket_lifetime_secs, 600);
        assert_eq!(config.sandbox.event_loop_stuck_tolerance_secs, 30);
        assert_eq!(config.rewards.spectator_purge_after_secs, 900);
    }

    #[test]
    fn partial_file_overlays_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"enqueue": {"ticket_lifetime_secs": 60, "short_term_burst": 2, "short_term_period_secs": 10, "long_term_burst": 5, "long_term_period_secs": 100, "password_attempt_burst": 1, "concealed_entry_points_cost": 1, "base_price_centi": 1, "price_per_minute_centi": 1, "max_media_length_secs": 60, "replay_cooldown_secs": 60}}"#)
                .unwrap();
        assert_eq!(config.enqueue.ticket_lifetime_secs, 60);
        // untouched sections keep defaults
        assert!(config.queue.skipping_enabled);
    }
}
