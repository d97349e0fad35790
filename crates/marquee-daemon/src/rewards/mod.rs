//! Rewards handler: spectator registry, activity tracking and reward
//! distribution.
//!
//! Spectators register per connection and are tracked for presence and
//! legitimacy. When the playing media changes, the outgoing entry's request
//! cost is split equally among the eligible spectators; requesters earn
//! points when their entry is admitted and give them back (or part of the
//! money) when it is removed before playing.

mod activity;
mod spectator;

pub use activity::{
    default_challenge_checkers, default_challenge_interval, AcceptingCaptchaVerifier,
    CaptchaVerifier, ChallengeCheckFunction, ChallengeIntervalFunction,
};
pub use spectator::{ActivityChallenge, ActivityChallengeType, Spectator};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marquee_core::amount::Amount;
use marquee_core::config::RewardsConfig;
use marquee_core::db::unix_timestamp;
use marquee_core::event::{BufferingGuarantee, Event};
use marquee_core::netutil::uniquified_ip;
use marquee_core::shutdown::ShutdownToken;
use marquee_core::user::{PermissionLevel, User};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::{ChatManager, ChatMessage};
use crate::ipreputation::IpReputationChecker;
use crate::media::QueueEntry;
use crate::moderation::ModerationStore;
use crate::payment::{PaymentError, RewardsBackend};
use crate::points::{tx_extra, PointsError, PointsManager};
use crate::queue::MediaQueue;
use crate::storage::PointsTxType;

use activity::{spectator_activity_watchdog, ChallengeSubmission};
use spectator::{MovingAverage, TtlSet};

/// The opaque country code reserved for anonymizing infrastructure;
/// registrations from it get an inert spectator.
const RESERVED_COUNTRY: &str = "T1";

/// A hard challenge solved longer ago than this is considered stale for
/// escalation purposes.
const HARD_CHALLENGE_STALENESS: i64 = 3600;

/// Errors from the rewards subsystem.
#[derive(Debug, thiserror::Error)]
pub enum RewardsError {
    #[error("activity challenge not found")]
    ChallengeNotFound,

    #[error("activity challenge already answered")]
    ChallengeAlreadyAnswered,

    #[error("challenge type not part of this challenge")]
    UnknownChallengeType,

    #[error("captcha verification failed: {0}")]
    Captcha(String),

    #[error(transparent)]
    Points(#[from] PointsError),

    #[error(transparent)]
    Payment(#[from] PaymentError),
}

/// Connection context for a spectator registration, as established by the
/// transport layer.
#[derive(Debug, Clone)]
pub struct SpectatorContext {
    pub remote_address: String,
    pub ip_country: String,
}

/// Fired after each distribution with per-recipient amounts.
#[derive(Debug, Clone)]
pub struct RewardsDistributedEventArgs {
    pub performance_id: String,
    pub total: Amount,
    pub eligible_count: usize,
    /// On-chain payouts.
    pub recipients: Vec<(String, Amount)>,
    /// Alien-chain recipients, rewarded in points.
    pub points_recipients: Vec<(String, i64)>,
    /// Whatever the integer split left over stays with the collector.
    pub collector_remainder: Amount,
}

/// A withdrawal created by the (external) withdrawal handler.
#[derive(Debug, Clone)]
pub struct PendingWithdrawal {
    pub rewards_address: String,
    pub amount: Amount,
}

/// Balance-update notification emitted for affected users.
#[derive(Debug, Clone)]
pub struct BalanceUpdatedNotification {
    pub rewards_address: String,
    pub balance_decrease: Amount,
}

struct Registry {
    by_reward_address: HashMap<String, Arc<Spectator>>,
    by_remote_address: HashMap<String, Vec<Arc<Spectator>>>,
    by_activity_challenge: HashMap<String, Arc<Spectator>>,
    last_media: Option<QueueEntry>,
}

/// Handles reward distribution among spectators.
pub struct RewardsHandler {
    config: RewardsConfig,
    queue: Arc<MediaQueue>,
    points: Arc<PointsManager>,
    backend: Arc<dyn RewardsBackend>,
    ip_checker: Arc<dyn IpReputationChecker>,
    moderation: Arc<dyn ModerationStore>,
    chat: Arc<ChatManager>,
    checkers: HashMap<ActivityChallengeType, ChallengeCheckFunction>,
    challenge_interval: ChallengeIntervalFunction,
    registry: Mutex<Registry>,
    challenge_waiters: Mutex<HashMap<String, mpsc::Sender<ChallengeSubmission>>>,
    eligible_moving_average: Mutex<MovingAverage>,
    chat_participation: Mutex<TtlSet>,
    chat_less_frequent_participation: Mutex<TtlSet>,
    on_rewards_distributed: Event<RewardsDistributedEventArgs>,
    on_balance_updated: Event<BalanceUpdatedNotification>,
    shutdown: ShutdownToken,
}

/// Optional knobs for the handler; tests replace the schedule and checkers.
pub struct RewardsHandlerOptions {
    pub checkers: HashMap<ActivityChallengeType, ChallengeCheckFunction>,
    pub challenge_interval: ChallengeIntervalFunction,
}

impl Default for RewardsHandlerOptions {
    fn default() -> Self {
        Self {
            checkers: default_challenge_checkers(Arc::new(AcceptingCaptchaVerifier)),
            challenge_interval: default_challenge_interval(),
        }
    }
}

impl RewardsHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RewardsConfig,
        queue: Arc<MediaQueue>,
        points: Arc<PointsManager>,
        backend: Arc<dyn RewardsBackend>,
        ip_checker: Arc<dyn IpReputationChecker>,
        moderation: Arc<dyn ModerationStore>,
        chat: Arc<ChatManager>,
        options: RewardsHandlerOptions,
        shutdown: ShutdownToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            points,
            backend,
            ip_checker,
            moderation,
            chat,
            checkers: options.checkers,
            challenge_interval: options.challenge_interval,
            registry: Mutex::new(Registry {
                by_reward_address: HashMap::new(),
                by_remote_address: HashMap::new(),
                by_activity_challenge: HashMap::new(),
                last_media: None,
            }),
            challenge_waiters: Mutex::new(HashMap::new()),
            eligible_moving_average: Mutex::new(MovingAverage::new(3)),
            chat_participation: Mutex::new(TtlSet::new(Duration::from_secs(2 * 60 + 45))),
            chat_less_frequent_participation: Mutex::new(TtlSet::new(Duration::from_secs(15 * 60))),
            on_rewards_distributed: Event::new(),
            on_balance_updated: Event::new(),
            shutdown,
        })
    }

    pub fn on_rewards_distributed(&self) -> &Event<RewardsDistributedEventArgs> {
        &self.on_rewards_distributed
    }

    pub fn on_balance_updated(&self) -> &Event<BalanceUpdatedNotification> {
        &self.on_balance_updated
    }

    pub(crate) fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register one connection of a spectator. Registrations from the
    /// reserved country get an inert dummy spectator that never earns.
    pub fn register_spectator(self: &Arc<Self>, ctx: &SpectatorContext, user: User) -> Arc<Spectator> {
        if ctx.ip_country == RESERVED_COUNTRY {
            return Spectator::dummy(user);
        }

        self.ip_checker.enqueue_address_for_checking(&ctx.remote_address);

        let mut registry = self.registry.lock().expect("spectator registry poisoned");
        let existing = registry.by_reward_address.get(user.address()).cloned();

        let (spectator, newly_created, pending_challenge) = match existing {
            Some(spectator) => {
                let pending = {
                    let mut inner = spectator.inner.lock().expect("spectator poisoned");
                    // refresh user (e.g. to pick up permission level changes)
                    inner.user = user.clone();
                    inner.stopped_watching = None;
                    if inner.remote_address != ctx.remote_address {
                        // changing IPs loses human-verification status
                        let d = (self.challenge_interval)(&user, true);
                        inner.next_activity_check = Instant::now() + d;
                        inner.last_hard_challenge_solved_at = None;
                        inner.no_tolerance_on_next_challenge = true;
                        inner.remote_addresses.insert(ctx.remote_address.clone());
                    }
                    inner.connection_count += 1;
                    inner.activity_challenge.clone()
                };
                spectator.reschedule.notify_one();
                spectator.on_reconnected.notify();
                (spectator, false, pending)
            }
            None => {
                let d = (self.challenge_interval)(&user, true);
                let spectator = Spectator::new(user.clone(), ctx.remote_address.clone(), d);
                spectator
                    .inner
                    .lock()
                    .expect("spectator poisoned")
                    .connection_count = 1;
                registry
                    .by_reward_address
                    .insert(user.address().to_string(), Arc::clone(&spectator));
                registry
                    .by_remote_address
                    .entry(ctx.remote_address.clone())
                    .or_default()
                    .push(Arc::clone(&spectator));
                (spectator, true, None)
            }
        };
        drop(registry);

        if let Some(challenge) = pending_challenge {
            // the previous connection may have consumed the notification
            spectator.on_activity_challenge.notify(challenge);
        }

        info!(
            reward_address = user.address(),
            remote_address = ctx.remote_address,
            connections = spectator.connection_count(),
            reconnection = !newly_created,
            "Registered spectator"
        );

        if newly_created {
            let handler = Arc::clone(self);
            let watched = Arc::clone(&spectator);
            tokio::spawn(async move {
                spectator_activity_watchdog(handler, watched).await;
            });
        }

        spectator
    }

    /// Unregister one connection; the last disconnect stamps
    /// stopped-watching and fires the disconnect event.
    pub fn unregister_spectator(&self, spectator: &Arc<Spectator>) {
        if spectator.is_dummy {
            return;
        }
        let (address, remaining) = {
            let mut inner = spectator.inner.lock().expect("spectator poisoned");
            inner.connection_count = inner.connection_count.saturating_sub(1);
            if inner.connection_count == 0 {
                inner.stopped_watching = Some(unix_timestamp());
            }
            (inner.user.address().to_string(), inner.connection_count)
        };
        if remaining == 0 {
            spectator.on_disconnected.notify();
        }
        info!(
            reward_address = address,
            connections_remaining = remaining,
            "Unregistered spectator"
        );
    }

    pub fn get_spectator(&self, address: &str) -> Option<Arc<Spectator>> {
        self.registry
            .lock()
            .expect("spectator registry poisoned")
            .by_reward_address
            .get(address)
            .cloned()
    }

    /// Remote addresses ever seen for a reward address.
    pub fn remote_addresses_for_reward_address(&self, address: &str) -> HashSet<String> {
        self.registry
            .lock()
            .expect("spectator registry poisoned")
            .by_reward_address
            .get(address)
            .map(|s| {
                s.inner
                    .lock()
                    .expect("spectator poisoned")
                    .remote_addresses
                    .clone()
            })
            .unwrap_or_default()
    }

    /// Connected spectators sharing this uniquified remote address.
    pub fn count_connected_spectators_on_remote_address(&self, remote_address: &str) -> usize {
        let needle = uniquified_ip(remote_address);
        let registry = self.registry.lock().expect("spectator registry poisoned");
        registry
            .by_remote_address
            .iter()
            .filter(|(addr, _)| uniquified_ip(addr) == needle)
            .flat_map(|(_, spectators)| spectators.iter())
            .filter(|s| s.connection_count() > 0)
            .count()
    }

    /// Moving-average estimate of eligible spectators, if any distribution
    /// has happened yet.
    pub fn estimate_eligible_spectators(&self) -> Option<usize> {
        let avg = self
            .eligible_moving_average
            .lock()
            .expect("moving average poisoned");
        (avg.count() > 0).then(|| avg.average() as usize)
    }

    fn purge_old_disconnected_spectators(&self) {
        let cutoff = unix_timestamp() - self.config.spectator_purge_after_secs as i64;
        let mut registry = self.registry.lock().expect("spectator registry poisoned");
        let purgeable: Vec<Arc<Spectator>> = registry
            .by_reward_address
            .values()
            .filter(|s| {
                s.inner
                    .lock()
                    .expect("spectator poisoned")
                    .stopped_watching
                    .is_some_and(|stopped| stopped < cutoff)
            })
            .cloned()
            .collect();

        for spectator in purgeable {
            let (address, remote, challenge) = {
                let inner = spectator.inner.lock().expect("spectator poisoned");
                (
                    inner.user.address().to_string(),
                    inner.remote_address.clone(),
                    inner.activity_challenge.clone(),
                )
            };
            registry.by_reward_address.remove(&address);
            if let Some(list) = registry.by_remote_address.get_mut(&remote) {
                list.retain(|s| !Arc::ptr_eq(s, &spectator));
                if list.is_empty() {
                    registry.by_remote_address.remove(&remote);
                }
            }
            if let Some(challenge) = challenge {
                registry.by_activity_challenge.remove(&challenge.id);
                self.challenge_waiters
                    .lock()
                    .expect("challenge waiters poisoned")
                    .remove(&challenge.id);
            }
            spectator.watchdog.shutdown();
            info!(reward_address = address, remote_address = remote, "Purged spectator");
        }
    }

    // =========================================================================
    // Activity challenges
    // =========================================================================

    /// Push the next activity check out for a spectator that just performed
    /// a rewarded action while unchallenged.
    pub fn mark_address_as_active_if_not_challenged(&self, address: &str) {
        let Some(spectator) = self.get_spectator(address) else {
            return;
        };
        let rescheduled = {
            let mut inner = spectator.inner.lock().expect("spectator poisoned");
            if inner.activity_challenge.is_some() {
                false
            } else {
                let d = (self.challenge_interval)(&inner.user, false);
                inner.next_activity_check = Instant::now() + d;
                true
            }
        };
        if rescheduled {
            spectator.reschedule.notify_one();
        }
    }

    pub(crate) fn issue_activity_challenge(
        &self,
        spectator: &Arc<Spectator>,
    ) -> Option<(ActivityChallenge, mpsc::Receiver<ChallengeSubmission>)> {
        let others_on_ip =
            self.count_connected_spectators_on_remote_address(&spectator.current_remote_address());

        let challenge = {
            let mut inner = spectator.inner.lock().expect("spectator poisoned");
            if inner.activity_challenge.is_some() {
                return None;
            }
            let is_moderator = inner
                .user
                .permission_level_is_at_least(PermissionLevel::Moderator);
            let hard_stale = inner
                .last_hard_challenge_solved_at
                .is_none_or(|t| unix_timestamp() - t > HARD_CHALLENGE_STALENESS)
                && others_on_ip > 1;
            let types = activity::draw_challenge_types(
                is_moderator,
                inner.legitimacy_failures,
                hard_stale,
            );
            let tolerance = if inner.no_tolerance_on_next_challenge {
                Duration::ZERO
            } else {
                Duration::from_secs(self.config.challenge_tolerance_secs)
            };
            inner.no_tolerance_on_next_challenge = false;
            let challenge = ActivityChallenge {
                id: Uuid::new_v4().to_string(),
                challenged_at: unix_timestamp(),
                types,
                tolerance,
            };
            inner.activity_challenge = Some(challenge.clone());
            challenge
        };

        let (tx, rx) = mpsc::channel(1);
        self.registry
            .lock()
            .expect("spectator registry poisoned")
            .by_activity_challenge
            .insert(challenge.id.clone(), Arc::clone(spectator));
        self.challenge_waiters
            .lock()
            .expect("challenge waiters poisoned")
            .insert(challenge.id.clone(), tx);

        debug!(
            challenge_id = challenge.id,
            types = ?challenge.types,
            "Activity challenge issued"
        );
        spectator.on_activity_challenge.notify(challenge.clone());
        Some((challenge, rx))
    }

    /// Validate and submit a challenge response. Challenges are one-shot:
    /// the first submission consumes them regardless of correctness.
    pub async fn submit_activity_challenge(
        &self,
        challenge_id: &str,
        challenge_type: ActivityChallengeType,
        response: &str,
    ) -> Result<bool, RewardsError> {
        let spectator = self
            .registry
            .lock()
            .expect("spectator registry poisoned")
            .by_activity_challenge
            .get(challenge_id)
            .cloned()
            .ok_or(RewardsError::ChallengeNotFound)?;
        let challenge = spectator
            .current_activity_challenge()
            .filter(|c| c.id == challenge_id)
            .ok_or(RewardsError::ChallengeNotFound)?;
        if !challenge.types.contains(&challenge_type) {
            return Err(RewardsError::UnknownChallengeType);
        }
        let checker = self
            .checkers
            .get(&challenge_type)
            .cloned()
            .ok_or(RewardsError::UnknownChallengeType)?;

        let correct = checker(challenge, response.to_string()).await?;

        let sender = self
            .challenge_waiters
            .lock()
            .expect("challenge waiters poisoned")
            .remove(challenge_id)
            .ok_or(RewardsError::ChallengeAlreadyAnswered)?;
        let _ = sender
            .send(ChallengeSubmission {
                correct,
                challenge_type,
            })
            .await;
        Ok(correct)
    }

    pub(crate) fn record_challenge_expiry(&self, spectator: &Arc<Spectator>) {
        let mut inner = spectator.inner.lock().expect("spectator poisoned");
        inner.legitimacy_failures += 1;
        inner.legitimate = false;
        inner.stopped_being_legitimate_at = Some(unix_timestamp());
        debug!(
            reward_address = inner.user.address(),
            "Activity challenge expired"
        );
    }

    pub(crate) fn apply_challenge_outcome(
        &self,
        spectator: &Arc<Spectator>,
        challenge: &ActivityChallenge,
        submission: ChallengeSubmission,
        was_expired: bool,
    ) {
        {
            let mut inner = spectator.inner.lock().expect("spectator poisoned");
            inner.activity_challenge = None;
            if submission.correct {
                inner.legitimate = true;
                inner.stopped_being_legitimate_at = None;
                if matches!(
                    submission.challenge_type,
                    ActivityChallengeType::Segcha | ActivityChallengeType::Turnstile
                ) {
                    inner.last_hard_challenge_solved_at = Some(unix_timestamp());
                }
                let d = (self.challenge_interval)(&inner.user, false);
                inner.next_activity_check = Instant::now() + d;
            } else {
                if !was_expired {
                    inner.legitimacy_failures += 1;
                }
                inner.legitimate = false;
                inner.stopped_being_legitimate_at = Some(unix_timestamp());
                // failed spectators are rechecked sooner
                let d = (self.challenge_interval)(&inner.user, false) / 4;
                inner.next_activity_check = Instant::now() + d;
            }
        }
        self.remove_challenge_records(&challenge.id);
        spectator.reschedule.notify_one();
    }

    pub(crate) fn clear_challenge(&self, spectator: &Arc<Spectator>, challenge: &ActivityChallenge) {
        spectator
            .inner
            .lock()
            .expect("spectator poisoned")
            .activity_challenge = None;
        self.remove_challenge_records(&challenge.id);
    }

    fn remove_challenge_records(&self, challenge_id: &str) {
        self.registry
            .lock()
            .expect("spectator registry poisoned")
            .by_activity_challenge
            .remove(challenge_id);
        self.challenge_waiters
            .lock()
            .expect("challenge waiters poisoned")
            .remove(challenge_id);
    }

    // =========================================================================
    // Worker
    // =========================================================================

    /// Subscribe to queue and chat events and react to them until shutdown.
    pub fn start(self: &Arc<Self>) {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let mut entry_added = handler
                .queue
                .entry_added()
                .subscribe(BufferingGuarantee::BufferFirst);
            let mut media_changed = handler
                .queue
                .media_changed()
                .subscribe(BufferingGuarantee::BufferAll);
            let mut entry_removed = handler
                .queue
                .entry_removed()
                .subscribe(BufferingGuarantee::BufferAll);
            let mut chat_messages = handler
                .chat
                .on_message_created()
                .subscribe(BufferingGuarantee::BufferFirst);
            let mut purge_tick =
                tokio::time::interval(Duration::from_secs(handler.config.purge_interval_secs));
            purge_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            // the handler might start while something is already playing
            if let Some((entry, _)) = handler.queue.currently_playing() {
                handler
                    .registry
                    .lock()
                    .expect("spectator registry poisoned")
                    .last_media = Some(entry);
            }

            loop {
                tokio::select! {
                    () = handler.shutdown.cancelled() => return,
                    new_media = media_changed.recv() => {
                        let Some(new_media) = new_media else { return };
                        handler.on_media_changed(new_media).await;
                    }
                    args = entry_removed.recv() => {
                        let Some(args) = args else { return };
                        if args.index != 0 {
                            if let Err(e) = handler.on_media_removed(&args.entry).await {
                                warn!(error = %e, "Reward reversal failed");
                            }
                        }
                    }
                    args = entry_added.recv() => {
                        let Some(args) = args else { return };
                        if let Err(e) = handler.handle_queue_entry_added(&args.entry).await {
                            warn!(error = %e, "Enqueue reward failed");
                        }
                    }
                    message = chat_messages.recv() => {
                        let Some(message) = message else { return };
                        if let Err(e) = handler.handle_new_chat_message(&message).await {
                            warn!(error = %e, "Chat activity reward failed");
                        }
                    }
                    _ = purge_tick.tick() => handler.purge_old_disconnected_spectators(),
                }
            }
        });
    }

    async fn on_media_changed(self: &Arc<Self>, new_media: Option<QueueEntry>) {
        let outgoing = {
            let mut registry = self.registry.lock().expect("spectator registry poisoned");
            let same = match (&registry.last_media, &new_media) {
                (Some(last), Some(new)) => last.performance_id() == new.performance_id(),
                (None, None) => true,
                _ => false,
            };
            if same {
                return;
            }
            std::mem::replace(&mut registry.last_media, new_media)
        };

        if let Some(outgoing) = outgoing {
            let handler = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = handler.reward_users(&outgoing).await {
                    warn!(
                        performance_id = outgoing.performance_id(),
                        error = %e,
                        "Error rewarding users"
                    );
                }
            });
        }
    }

    // =========================================================================
    // Distribution
    // =========================================================================

    async fn good_remote_address_reputation(&self, remote_address: &str, address: &str) -> bool {
        match self.ip_checker.can_receive_rewards(remote_address) {
            None => false,
            Some(true) => true,
            Some(false) => {
                self.moderation
                    .address_skips_ip_reputation_checks(address)
                    .await
            }
        }
    }

    /// Distribute the outgoing entry's request cost among eligible
    /// spectators.
    async fn reward_users(&self, entry: &QueueEntry) -> Result<(), RewardsError> {
        let total = entry.request_cost();
        if total.is_zero() {
            debug!(
                performance_id = entry.performance_id(),
                "Request cost was 0, nothing to distribute"
            );
            return Ok(());
        }
        let requester_address = entry.requested_by().address().to_string();

        let candidates: Vec<(String, String, bool)> = {
            let registry = self.registry.lock().expect("spectator registry poisoned");
            let grace = self.config.disconnect_grace_secs as i64;
            let now = unix_timestamp();
            registry
                .by_reward_address
                .values()
                .filter_map(|spectator| {
                    let inner = spectator.inner.lock().expect("spectator poisoned");
                    let present = inner.connection_count > 0
                        || inner.stopped_watching.is_some_and(|s| now - s <= grace);
                    let eligible = present
                        && inner.legitimate
                        && inner.user.address() != requester_address
                        && !inner.user.address().is_empty();
                    eligible.then(|| {
                        (
                            inner.user.address().to_string(),
                            inner.remote_address.clone(),
                            inner.user.is_from_alien_chain(),
                        )
                    })
                })
                .collect()
        };

        // reputation is rechecked each distribution, outside the registry lock
        let mut eligible = Vec::new();
        let mut seen_ips = HashSet::new();
        for (address, remote, alien) in candidates {
            if !self.good_remote_address_reputation(&remote, &address).await {
                continue;
            }
            if !seen_ips.insert(uniquified_ip(&remote)) {
                continue;
            }
            eligible.push((address, alien));
        }

        let n = eligible.len();
        self.eligible_moving_average
            .lock()
            .expect("moving average poisoned")
            .add(n as f64);

        let mut recipients = Vec::new();
        let mut points_recipients = Vec::new();
        let mut collector_remainder;

        if n == 0 {
            collector_remainder = total;
        } else {
            let share = total.div_floor(n as u128);
            collector_remainder = total.saturating_sub(share.saturating_mul(n as u128));

            for (address, alien) in eligible {
                if alien {
                    // alien-chain users are rewarded in points at the fixed
                    // exchange ratio; the sub-point residue stays with the
                    // collector
                    let points = (share.raw() / Amount::CENTI.raw()) as i64;
                    let equivalent = Amount::CENTI.saturating_mul(points as u128);
                    collector_remainder += share.saturating_sub(equivalent);
                    if points > 0 {
                        match self
                            .points
                            .create_transaction(
                                &User::address_only(&address),
                                PointsTxType::AlienChainDistribution,
                                points,
                                tx_extra([("media", entry.performance_id())]),
                            )
                            .await
                        {
                            Ok(_) => points_recipients.push((address, points)),
                            Err(e) => {
                                warn!(address, error = %e, "Alien-chain points payout failed");
                                collector_remainder += equivalent;
                            }
                        }
                    }
                } else {
                    match self.backend.send(&address, share).await {
                        Ok(_) => recipients.push((address, share)),
                        Err(e) => {
                            warn!(address, error = %e, "Reward payout failed");
                            collector_remainder += share;
                        }
                    }
                }
            }
        }

        info!(
            performance_id = entry.performance_id(),
            total = %total,
            eligible = n,
            remainder = %collector_remainder,
            "Rewards distributed"
        );
        self.on_rewards_distributed.notify(RewardsDistributedEventArgs {
            performance_id: entry.performance_id().to_string(),
            total,
            eligible_count: n,
            recipients,
            points_recipients,
            collector_remainder,
        });
        Ok(())
    }

    // =========================================================================
    // Enqueue-side rewards
    // =========================================================================

    fn points_reward_for_media(entry: &QueueEntry) -> i64 {
        match entry.length() {
            None => 0,
            Some(length) => length.as_secs() as i64 / 10 + 1,
        }
    }

    async fn handle_queue_entry_added(&self, entry: &QueueEntry) -> Result<(), RewardsError> {
        let requested_by = entry.requested_by();
        if requested_by.is_unknown()
            || requested_by.is_from_alien_chain()
            || requested_by.application_id().is_some()
        {
            return Ok(());
        }
        self.mark_address_as_active_if_not_challenged(requested_by.address());

        let reward = Self::points_reward_for_media(entry);
        if reward == 0 {
            return Ok(());
        }
        self.points
            .create_transaction(
                requested_by,
                PointsTxType::MediaEnqueuedReward,
                reward,
                tx_extra([("media", entry.performance_id())]),
            )
            .await?;
        Ok(())
    }

    /// Reimburse the requester of an entry removed before playing. When the
    /// enqueue reward was already spent the reversal falls back to keeping
    /// its monetary equivalent from the refund.
    async fn on_media_removed(&self, removed: &QueueEntry) -> Result<(), RewardsError> {
        info!(
            performance_id = removed.performance_id(),
            "Media removed from queue"
        );
        let mut amount_to_reimburse = removed.request_cost();
        if amount_to_reimburse.is_zero() {
            debug!("Request cost was 0, nothing to reimburse");
            return Ok(());
        }
        let requested_by = removed.requested_by();
        if requested_by.is_unknown() {
            return Ok(());
        }

        let points_reward = Self::points_reward_for_media(removed);
        if points_reward > 0 && requested_by.application_id().is_none() {
            let reversal = self
                .points
                .create_transaction(
                    requested_by,
                    PointsTxType::MediaEnqueuedRewardReversal,
                    -points_reward,
                    tx_extra([("media", removed.performance_id())]),
                )
                .await;
            match reversal {
                Ok(_) => {}
                Err(PointsError::InsufficientBalance) => {
                    // the reward was already spent; deduct its monetary
                    // equivalent as if this were a points purchase
                    let amount_to_keep = Amount::CENTI.saturating_mul(points_reward as u128);
                    amount_to_reimburse = amount_to_reimburse.saturating_sub(amount_to_keep);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !amount_to_reimburse.is_zero() && !requested_by.is_from_alien_chain() {
            self.backend
                .send(requested_by.address(), amount_to_reimburse)
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Chat activity rewards
    // =========================================================================

    async fn handle_new_chat_message(&self, message: &ChatMessage) -> Result<(), RewardsError> {
        let Some(author) = &message.author else {
            return Ok(());
        };
        if author.is_unknown() || author.application_id().is_some() || message.shadowbanned {
            return Ok(());
        }
        if message.content.len() < 10 && message.reference.is_none() && message.attachments.is_empty()
        {
            return Ok(());
        }

        self.mark_address_as_active_if_not_challenged(author.address());

        let (present, present_in_less_frequent) = {
            let mut short = self.chat_participation.lock().expect("chat cache poisoned");
            let mut long = self
                .chat_less_frequent_participation
                .lock()
                .expect("chat cache poisoned");
            let present = short.contains(author.address());
            let less = long.contains(author.address());
            if !present {
                short.insert(author.address());
                long.insert(author.address());
            }
            (present, less)
        };

        if !present {
            let points = if present_in_less_frequent { 3 } else { 6 };
            self.points
                .create_transaction(author, PointsTxType::ChatActivityReward, points, Default::default())
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Withdrawal side effects
    // =========================================================================

    /// Called by the (external) withdrawal handler when withdrawals are
    /// created; emits a balance-update notification per affected user.
    pub fn on_pending_withdrawals_created(&self, pending: &[PendingWithdrawal]) {
        for withdrawal in pending {
            self.on_balance_updated.notify(BalanceUpdatedNotification {
                rewards_address: withdrawal.rewards_address.clone(),
                balance_decrease: withdrawal.amount,
            });
        }
    }
}

#[cfg(test)]
mod tests;
