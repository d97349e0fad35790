//! Spectators and their in-memory state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marquee_core::db::unix_timestamp;
use marquee_core::event::{Event, NoArgEvent};
use marquee_core::shutdown::ShutdownController;
use marquee_core::user::User;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

/// A liveness proof type a spectator may be asked to satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityChallengeType {
    Button,
    Segcha,
    Turnstile,
    Moderating,
}

impl ActivityChallengeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Button => "button",
            Self::Segcha => "segcha",
            Self::Turnstile => "turnstile",
            Self::Moderating => "moderating",
        }
    }
}

/// A one-shot liveness proof requested from a spectator. At most one is in
/// flight per spectator.
#[derive(Debug, Clone)]
pub struct ActivityChallenge {
    pub id: String,
    pub challenged_at: i64,
    pub types: Vec<ActivityChallengeType>,
    pub tolerance: Duration,
}

pub(crate) struct SpectatorInner {
    pub user: User,
    pub remote_address: String,
    pub remote_addresses: HashSet<String>,
    pub connection_count: u32,
    pub started_watching: i64,
    /// `None` while connected.
    pub stopped_watching: Option<i64>,
    pub legitimate: bool,
    pub legitimacy_failures: u32,
    pub stopped_being_legitimate_at: Option<i64>,
    pub next_activity_check: Instant,
    pub activity_challenge: Option<ActivityChallenge>,
    pub last_hard_challenge_solved_at: Option<i64>,
    pub no_tolerance_on_next_challenge: bool,
}

/// A connected user tracked for reward eligibility.
///
/// Dummy spectators (allocated for reserved-country registrations) satisfy
/// the same interface but never earn and are never registered.
pub struct Spectator {
    pub(crate) is_dummy: bool,
    pub(crate) inner: Mutex<SpectatorInner>,
    pub(crate) on_activity_challenge: Event<ActivityChallenge>,
    pub(crate) on_disconnected: NoArgEvent,
    pub(crate) on_reconnected: NoArgEvent,
    /// Wakes the activity watchdog when the schedule changes.
    pub(crate) reschedule: Notify,
    /// Cancels the activity watchdog when the spectator is purged.
    pub(crate) watchdog: ShutdownController,
}

impl Spectator {
    pub(crate) fn new(
        user: User,
        remote_address: String,
        first_check_in: Duration,
    ) -> Arc<Self> {
        let now = unix_timestamp();
        Arc::new(Self {
            is_dummy: false,
            inner: Mutex::new(SpectatorInner {
                user,
                remote_addresses: HashSet::from([remote_address.clone()]),
                remote_address,
                connection_count: 0,
                started_watching: now,
                stopped_watching: None,
                // everyone starts in good standing
                legitimate: true,
                legitimacy_failures: 0,
                stopped_being_legitimate_at: None,
                next_activity_check: Instant::now() + first_check_in,
                activity_challenge: None,
                last_hard_challenge_solved_at: None,
                no_tolerance_on_next_challenge: false,
            }),
            on_activity_challenge: Event::new(),
            on_disconnected: NoArgEvent::new(),
            on_reconnected: NoArgEvent::new(),
            reschedule: Notify::new(),
            watchdog: ShutdownController::new(),
        })
    }

    pub(crate) fn dummy(user: User) -> Arc<Self> {
        let now = unix_timestamp();
        Arc::new(Self {
            is_dummy: true,
            inner: Mutex::new(SpectatorInner {
                user,
                remote_address: String::new(),
                remote_addresses: HashSet::new(),
                connection_count: 0,
                started_watching: now,
                stopped_watching: None,
                legitimate: false,
                legitimacy_failures: 0,
                stopped_being_legitimate_at: None,
                next_activity_check: Instant::now(),
                activity_challenge: None,
                last_hard_challenge_solved_at: None,
                no_tolerance_on_next_challenge: false,
            }),
            on_activity_challenge: Event::new(),
            on_disconnected: NoArgEvent::new(),
            on_reconnected: NoArgEvent::new(),
            reschedule: Notify::new(),
            watchdog: ShutdownController::new(),
        })
    }

    pub fn on_activity_challenge(&self) -> &Event<ActivityChallenge> {
        &self.on_activity_challenge
    }

    pub fn on_disconnected(&self) -> &NoArgEvent {
        &self.on_disconnected
    }

    pub fn on_reconnected(&self) -> &NoArgEvent {
        &self.on_reconnected
    }

    pub fn user(&self) -> User {
        self.inner.lock().expect("spectator poisoned").user.clone()
    }

    pub fn current_remote_address(&self) -> String {
        self.inner
            .lock()
            .expect("spectator poisoned")
            .remote_address
            .clone()
    }

    pub fn connection_count(&self) -> u32 {
        self.inner.lock().expect("spectator poisoned").connection_count
    }

    /// Legitimacy flag and, when false, since when.
    pub fn legitimate(&self) -> (bool, Option<i64>) {
        let inner = self.inner.lock().expect("spectator poisoned");
        (inner.legitimate, inner.stopped_being_legitimate_at)
    }

    pub fn watching_since(&self) -> i64 {
        self.inner.lock().expect("spectator poisoned").started_watching
    }

    /// Whether the spectator disconnected and, if so, when.
    pub fn stopped_watching(&self) -> Option<i64> {
        self.inner.lock().expect("spectator poisoned").stopped_watching
    }

    pub fn current_activity_challenge(&self) -> Option<ActivityChallenge> {
        self.inner
            .lock()
            .expect("spectator poisoned")
            .activity_challenge
            .clone()
    }

    pub fn last_hard_challenge_solved_at(&self) -> Option<i64> {
        self.inner
            .lock()
            .expect("spectator poisoned")
            .last_hard_challenge_solved_at
    }
}

/// Simple moving average over a fixed window.
pub(crate) struct MovingAverage {
    window: usize,
    values: Vec<f64>,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            values: Vec::new(),
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.values.len() == self.window {
            self.values.remove(0);
        }
        self.values.push(value);
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn average(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

/// A set whose members expire after a fixed TTL.
pub(crate) struct TtlSet {
    ttl: Duration,
    entries: std::collections::HashMap<String, Instant>,
}

impl TtlSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: std::collections::HashMap::new(),
        }
    }

    pub fn contains(&mut self, key: &str) -> bool {
        let now = Instant::now();
        self.entries.retain(|_, inserted| now - *inserted < self.ttl);
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: &str) {
        self.entries.insert(key.to_string(), Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_window() {
        let mut avg = MovingAverage::new(3);
        assert_eq!(avg.count(), 0);
        for v in [1.0, 2.0, 3.0, 4.0] {
            avg.add(v);
        }
        assert_eq!(avg.count(), 3);
        assert!((avg.average() - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_set_expires() {
        let mut set = TtlSet::new(Duration::from_secs(10));
        set.insert("a");
        assert!(set.contains("a"));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!set.contains("a"));
    }
}
