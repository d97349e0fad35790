use std::sync::Arc;
use std::time::Duration;

use marquee_core::amount::Amount;
use marquee_core::config::{QueueConfig, RewardsConfig};
use marquee_core::event::BufferingGuarantee;
use marquee_core::shutdown::ShutdownController;
use marquee_core::user::User;

use super::*;
use crate::chat::ChatManager;
use crate::ipreputation::{PermissiveIpReputationChecker, StaticIpReputationChecker};
use crate::media::{MediaPayload, QueueEntry};
use crate::moderation::InMemoryModerationStore;
use crate::payment::RecordingRewardsBackend;
use crate::points::PointsManager;
use crate::queue::MediaQueue;
use crate::storage::Database;

fn addr(c: char) -> String {
    format!("ban_{}", c.to_string().repeat(60))
}

/// Polls until the condition holds; yields between attempts so background
/// database work can complete under the paused clock.
async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met: {what}");
}

async fn eventually_balance(points: &Arc<PointsManager>, address: &str, expected: i64) {
    let points = Arc::clone(points);
    let address = address.to_string();
    eventually("points balance reached expected value", move || {
        let points = Arc::clone(&points);
        let address = address.clone();
        async move { points.balance(&address).await.unwrap() == expected }
    })
    .await;
}

fn alien_addr(c: char) -> String {
    format!("nano_{}", c.to_string().repeat(60))
}

fn ctx(remote: &str) -> SpectatorContext {
    SpectatorContext {
        remote_address: remote.to_string(),
        ip_country: "US".to_string(),
    }
}

fn entry(id: &str, length_secs: u64, cost: Amount, requested_by: &User) -> QueueEntry {
    QueueEntry::new(
        id,
        MediaPayload::Track {
            id: format!("media-{id}"),
            title: format!("Title {id}"),
            uploader: "uploader".into(),
            artist: "artist".into(),
            permalink: format!("https://tracks.example/{id}"),
            thumbnail_url: String::new(),
        },
        Some(Duration::from_secs(length_secs)),
        Duration::ZERO,
        requested_by.clone(),
        cost,
        false,
        false,
    )
}

struct Fixture {
    handler: Arc<RewardsHandler>,
    queue: Arc<MediaQueue>,
    points: Arc<PointsManager>,
    backend: Arc<RecordingRewardsBackend>,
    chat: Arc<ChatManager>,
    _controller: ShutdownController,
}

async fn fixture_with(
    config: RewardsConfig,
    interval: ChallengeIntervalFunction,
    bad_ip: Option<&str>,
) -> Fixture {
    let db = Database::open_in_memory().await.unwrap();
    let queue = MediaQueue::new(QueueConfig::default());
    let points = PointsManager::new(db);
    let backend = RecordingRewardsBackend::new();
    let moderation = InMemoryModerationStore::new();
    let chat = ChatManager::new(Arc::clone(&moderation) as _);
    let controller = ShutdownController::new();

    let ip_checker: Arc<dyn IpReputationChecker> = match bad_ip {
        Some(bad) => {
            let checker = StaticIpReputationChecker::new();
            checker.mark_bad(bad);
            checker
        }
        None => Arc::new(PermissiveIpReputationChecker),
    };

    let handler = RewardsHandler::new(
        config,
        Arc::clone(&queue),
        Arc::clone(&points),
        Arc::clone(&backend) as _,
        ip_checker,
        moderation,
        Arc::clone(&chat),
        RewardsHandlerOptions {
            challenge_interval: interval,
            ..Default::default()
        },
        controller.token(),
    );
    handler.start();

    Fixture {
        handler,
        queue,
        points,
        backend,
        chat,
        _controller: controller,
    }
}

fn quiet_interval() -> ChallengeIntervalFunction {
    Arc::new(|_, _| Duration::from_secs(100_000))
}

async fn fixture() -> Fixture {
    fixture_with(RewardsConfig::default(), quiet_interval(), None).await
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test]
async fn reserved_country_gets_dummy_spectator() {
    let f = fixture().await;
    let user = User::address_only(addr('1'));
    let spectator = f.handler.register_spectator(
        &SpectatorContext {
            remote_address: "203.0.113.9".into(),
            ip_country: "T1".into(),
        },
        user.clone(),
    );
    assert!(!spectator.legitimate().0);
    // dummies are never registered
    assert!(f.handler.get_spectator(user.address()).is_none());
}

#[tokio::test]
async fn reconnection_reuses_the_spectator() {
    let f = fixture().await;
    let user = User::address_only(addr('1'));

    let first = f.handler.register_spectator(&ctx("203.0.113.9"), user.clone());
    assert_eq!(first.connection_count(), 1);
    let second = f.handler.register_spectator(&ctx("203.0.113.9"), user.clone());
    assert_eq!(second.connection_count(), 2);
    assert!(Arc::ptr_eq(&first, &second));

    f.handler.unregister_spectator(&second);
    assert_eq!(first.connection_count(), 1);
    assert!(first.stopped_watching().is_none());

    f.handler.unregister_spectator(&first);
    assert_eq!(first.connection_count(), 0);
    assert!(first.stopped_watching().is_some());
}

#[tokio::test]
async fn ip_change_arms_no_tolerance_and_resets_verification() {
    let f = fixture().await;
    let user = User::address_only(addr('1'));

    let spectator = f.handler.register_spectator(&ctx("203.0.113.9"), user.clone());
    {
        let mut inner = spectator.inner.lock().unwrap();
        inner.last_hard_challenge_solved_at = Some(1);
    }
    f.handler.register_spectator(&ctx("198.51.100.20"), user.clone());

    let inner = spectator.inner.lock().unwrap();
    assert!(inner.no_tolerance_on_next_challenge);
    assert_eq!(inner.last_hard_challenge_solved_at, None);
    assert_eq!(inner.remote_addresses.len(), 2);
}

// =============================================================================
// Activity challenges
// =============================================================================

#[tokio::test]
async fn challenge_pass_keeps_spectator_legitimate() {
    let interval: ChallengeIntervalFunction = Arc::new(|_, initial| {
        if initial {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(100_000)
        }
    });
    let f = fixture_with(RewardsConfig::default(), interval, None).await;
    tokio::time::pause();
    let user = User::address_only(addr('1'));
    let spectator = f.handler.register_spectator(&ctx("203.0.113.9"), user);
    let mut challenges = spectator
        .on_activity_challenge()
        .subscribe(BufferingGuarantee::BufferAll);

    let challenge = challenges.recv().await.unwrap();
    assert!(challenge.types.contains(&ActivityChallengeType::Button));

    let correct = f
        .handler
        .submit_activity_challenge(&challenge.id, ActivityChallengeType::Button, "clicked")
        .await
        .unwrap();
    assert!(correct);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(spectator.legitimate().0);
    assert!(spectator.current_activity_challenge().is_none());

    // one-shot: a second submission is rejected
    let err = f
        .handler
        .submit_activity_challenge(&challenge.id, ActivityChallengeType::Button, "again")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RewardsError::ChallengeNotFound | RewardsError::ChallengeAlreadyAnswered
    ));
}

#[tokio::test]
async fn challenge_expiry_marks_illegitimate() {
    let interval: ChallengeIntervalFunction = Arc::new(|_, initial| {
        if initial {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(100_000)
        }
    });
    let config = RewardsConfig {
        challenge_tolerance_secs: 5,
        ..RewardsConfig::default()
    };
    let f = fixture_with(config, interval, None).await;
    tokio::time::pause();
    let user = User::address_only(addr('1'));
    let spectator = f.handler.register_spectator(&ctx("203.0.113.9"), user);
    let mut challenges = spectator
        .on_activity_challenge()
        .subscribe(BufferingGuarantee::BufferAll);

    let challenge = challenges.recv().await.unwrap();
    tokio::time::sleep(challenge.tolerance + Duration::from_secs(1)).await;

    let (legitimate, since) = spectator.legitimate();
    assert!(!legitimate);
    assert!(since.is_some());

    // a late correct answer restores legitimacy
    f.handler
        .submit_activity_challenge(&challenge.id, ActivityChallengeType::Button, "late")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(spectator.legitimate().0);
}

// =============================================================================
// Distribution
// =============================================================================

async fn register_legit(f: &Fixture, address: String, remote: &str) -> Arc<Spectator> {
    f.handler
        .register_spectator(&ctx(remote), User::address_only(address))
}

#[tokio::test]
async fn distribution_conserves_and_excludes_requester() {
    let f = fixture().await;
    tokio::time::pause();
    let requester = User::address_only(addr('9'));

    register_legit(&f, addr('9'), "203.0.113.1").await;
    register_legit(&f, addr('1'), "203.0.113.2").await;
    register_legit(&f, addr('3'), "203.0.113.3").await;
    register_legit(&f, alien_addr('4'), "203.0.113.4").await;

    let mut distributed = f
        .handler
        .on_rewards_distributed()
        .subscribe(BufferingGuarantee::BufferAll);

    let total = Amount::from_raw(Amount::CENTI.raw() * 10 + 7);
    f.queue.enqueue(entry("paid", 120, total, &requester));
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.queue
        .enqueue(entry("next", 60, Amount::zero(), &requester));
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.queue.skip_current();

    let args = distributed.recv().await.unwrap();
    assert_eq!(args.performance_id, "paid");
    assert_eq!(args.total, total);
    assert_eq!(args.eligible_count, 3);

    // requester never rewards themselves
    assert!(args.recipients.iter().all(|(a, _)| a != &addr('9')));

    // conservation: on-chain + points-equivalent + remainder = total
    let on_chain: Amount = args.recipients.iter().map(|(_, a)| *a).sum();
    let points_equivalent: Amount = args
        .points_recipients
        .iter()
        .map(|(_, p)| Amount::CENTI.saturating_mul(*p as u128))
        .sum();
    assert_eq!(
        on_chain + points_equivalent + args.collector_remainder,
        total
    );

    // the alien-chain spectator was paid in points
    assert_eq!(args.points_recipients.len(), 1);
    let (alien, points) = &args.points_recipients[0];
    assert_eq!(alien, &alien_addr('4'));
    assert_eq!(f.points.balance(alien).await.unwrap(), *points);

    // the native spectators got on-chain payouts
    assert_eq!(args.recipients.len(), 2);
    for (address, amount) in &args.recipients {
        assert_eq!(f.backend.total_sent_to(address), *amount);
    }
}

#[tokio::test]
async fn shared_ip_counts_once_and_bad_reputation_excludes() {
    let f = fixture_with(
        RewardsConfig::default(),
        quiet_interval(),
        Some("203.0.113.66"),
    )
    .await;
    tokio::time::pause();
    let requester = User::address_only(addr('9'));

    // two spectators behind one address, one spectator with bad reputation
    register_legit(&f, addr('1'), "203.0.113.2").await;
    register_legit(&f, addr('3'), "203.0.113.2").await;
    register_legit(&f, addr('4'), "203.0.113.66").await;

    let mut distributed = f
        .handler
        .on_rewards_distributed()
        .subscribe(BufferingGuarantee::BufferAll);

    f.queue
        .enqueue(entry("paid", 120, Amount::from_raw(1000), &requester));
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.queue.skip_current();

    let args = distributed.recv().await.unwrap();
    assert_eq!(args.eligible_count, 1);
    assert_eq!(args.recipients.len(), 1);
    assert_eq!(args.recipients[0].1, Amount::from_raw(1000));
}

#[tokio::test]
async fn illegitimate_spectators_do_not_earn() {
    let f = fixture().await;
    tokio::time::pause();
    let requester = User::address_only(addr('9'));

    let spectator = register_legit(&f, addr('1'), "203.0.113.2").await;
    spectator.inner.lock().unwrap().legitimate = false;

    let mut distributed = f
        .handler
        .on_rewards_distributed()
        .subscribe(BufferingGuarantee::BufferAll);

    f.queue
        .enqueue(entry("paid", 120, Amount::from_raw(100), &requester));
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.queue.skip_current();

    let args = distributed.recv().await.unwrap();
    assert_eq!(args.eligible_count, 0);
    assert_eq!(args.collector_remainder, Amount::from_raw(100));
}

// =============================================================================
// Enqueue-side rewards
// =============================================================================

#[tokio::test]
async fn enqueue_grants_points_by_length() {
    let f = fixture().await;
    tokio::time::pause();
    let requester = User::address_only(addr('1'));

    f.queue
        .enqueue(entry("a", 120, Amount::from_raw(100), &requester));

    // 120/10 + 1
    eventually_balance(&f.points, requester.address(), 13).await;
}

#[tokio::test]
async fn reversal_refunds_partially_when_reward_was_spent() {
    let f = fixture().await;
    tokio::time::pause();
    let requester = User::address_only(addr('1'));
    let cost = Amount::from_raw(Amount::CENTI.raw() * 100);

    f.queue
        .enqueue(entry("head", 300, Amount::zero(), &User::unknown()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // a 60-second entry grants 60/10 + 1 = 7 points
    f.queue.enqueue(entry("mine", 60, cost, &requester));
    eventually_balance(&f.points, requester.address(), 7).await;

    // spend the reward before the entry plays
    f.points
        .create_transaction(
            &requester,
            crate::storage::PointsTxType::ApplicationDefined,
            -7,
            Default::default(),
        )
        .await
        .unwrap();

    // remove the non-head entry: points reversal fails, refund is partial
    let moderator = User::with_permission_level(addr('3'), marquee_core::user::PermissionLevel::Moderator);
    f.queue.remove_entry("mine", &moderator).unwrap();

    let expected_refund = cost.saturating_sub(Amount::CENTI.saturating_mul(7));
    let backend = Arc::clone(&f.backend);
    let address = requester.address().to_string();
    eventually("partial refund was sent", move || {
        let backend = Arc::clone(&backend);
        let address = address.clone();
        async move { backend.total_sent_to(&address) == expected_refund }
    })
    .await;
}

#[tokio::test]
async fn reversal_refunds_fully_when_points_still_held() {
    let f = fixture().await;
    tokio::time::pause();
    let requester = User::address_only(addr('1'));
    let cost = Amount::from_raw(Amount::CENTI.raw() * 100);

    f.queue
        .enqueue(entry("head", 300, Amount::zero(), &User::unknown()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    f.queue.enqueue(entry("mine", 60, cost, &requester));
    eventually_balance(&f.points, requester.address(), 7).await;

    let moderator = User::with_permission_level(addr('3'), marquee_core::user::PermissionLevel::Moderator);
    f.queue.remove_entry("mine", &moderator).unwrap();

    let backend = Arc::clone(&f.backend);
    let address = requester.address().to_string();
    eventually("full refund was sent", move || {
        let backend = Arc::clone(&backend);
        let address = address.clone();
        async move { backend.total_sent_to(&address) == cost }
    })
    .await;
    // the enqueue reward was reversed
    assert_eq!(f.points.balance(requester.address()).await.unwrap(), 0);
}

// =============================================================================
// Chat activity rewards
// =============================================================================

#[tokio::test]
async fn chat_activity_rewards_with_windows() {
    let f = fixture().await;
    tokio::time::pause();
    let author = User::address_only(addr('1'));

    f.chat
        .create_message(author.clone(), "a sufficiently long message".into(), None, Vec::new())
        .await
        .unwrap();
    // absent from both windows: 6 points
    eventually_balance(&f.points, author.address(), 6).await;

    f.chat
        .create_message(author.clone(), "another long enough message".into(), None, Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // still in the short window: nothing
    assert_eq!(f.points.balance(author.address()).await.unwrap(), 6);

    // past the short window but within the long one: 3 points
    tokio::time::sleep(Duration::from_secs(3 * 60)).await;
    f.chat
        .create_message(author.clone(), "yet another long message".into(), None, Vec::new())
        .await
        .unwrap();
    eventually_balance(&f.points, author.address(), 9).await;
}

#[tokio::test]
async fn short_messages_earn_nothing() {
    let f = fixture().await;
    tokio::time::pause();
    let author = User::address_only(addr('1'));

    f.chat
        .create_message(author.clone(), "short".into(), None, Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.points.balance(author.address()).await.unwrap(), 0);
}

// =============================================================================
// Withdrawal side effects
// =============================================================================

#[tokio::test]
async fn pending_withdrawals_emit_balance_updates() {
    let f = fixture().await;
    let mut updates = f
        .handler
        .on_balance_updated()
        .subscribe(BufferingGuarantee::BufferAll);

    f.handler.on_pending_withdrawals_created(&[PendingWithdrawal {
        rewards_address: addr('1'),
        amount: Amount::from_raw(500),
    }]);

    let update = updates.recv().await.unwrap();
    assert_eq!(update.rewards_address, addr('1'));
    assert_eq!(update.balance_decrease, Amount::from_raw(500));
}
