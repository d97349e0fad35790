//! End-to-end flow: enqueue with payment, play out, distribute rewards.

use std::sync::Arc;
use std::time::Duration;

use marquee_core::amount::Amount;
use marquee_core::config::{EnqueueConfig, QueueConfig, RewardsConfig};
use marquee_core::event::BufferingGuarantee;
use marquee_core::shutdown::ShutdownController;
use marquee_core::user::User;

use marquee_daemon::chat::ChatManager;
use marquee_daemon::enqueue::{
    EnqueueManager, EnqueueMediaParams, EnqueueMediaResult, RequestContext, TicketStatus,
};
use marquee_daemon::gatekeeper::Gatekeeper;
use marquee_daemon::ipreputation::PermissiveIpReputationChecker;
use marquee_daemon::media::{MediaRequestInfo, TrackProvider};
use marquee_daemon::media::{MediaError, TrackCatalog, TrackInfo};
use marquee_daemon::moderation::InMemoryModerationStore;
use marquee_daemon::payment::{InMemoryPaymentPool, RecordingRewardsBackend};
use marquee_daemon::points::PointsManager;
use marquee_daemon::queue::MediaQueue;
use marquee_daemon::rewards::{RewardsHandler, RewardsHandlerOptions, SpectatorContext};
use marquee_daemon::storage::Database;

struct StaticCatalog(TrackInfo);

#[async_trait::async_trait]
impl TrackCatalog for StaticCatalog {
    async fn track_info(&self, permalink: &str) -> Result<Option<TrackInfo>, MediaError> {
        Ok((permalink == self.0.permalink).then(|| self.0.clone()))
    }
}

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

#[tokio::test(start_paused = true)]
async fn happy_enqueue_play_distribute() {
    let db = Database::open_in_memory().await.unwrap();
    let queue = MediaQueue::new(QueueConfig::default());
    let points = PointsManager::new(db.clone());
    let backend = RecordingRewardsBackend::new();
    let pool = InMemoryPaymentPool::new();
    let moderation = InMemoryModerationStore::new();
    let chat = ChatManager::new(Arc::clone(&moderation) as _);
    let gatekeeper = Gatekeeper::new();
    let controller = ShutdownController::new();

    queue.start(controller.token(), Some(db.clone()));

    let enqueue_config = EnqueueConfig::default();
    let catalog = StaticCatalog(TrackInfo {
        id: "track-1".into(),
        kind: "track".into(),
        title: "Two Minutes of Calm".into(),
        uploader: "uploader".into(),
        artist: "artist".into(),
        permalink: "https://tracks.example/calm".into(),
        thumbnail_url: String::new(),
        duration: Some(Duration::from_secs(120)),
        embeddable: true,
        age_restricted: false,
        upcoming_live: false,
    });
    let provider = TrackProvider::new(
        Arc::new(catalog),
        db.clone(),
        Arc::clone(&queue),
        enqueue_config.clone(),
    );

    let manager = EnqueueManager::new(
        enqueue_config,
        db.clone(),
        Arc::clone(&queue),
        Arc::clone(&points),
        pool.clone(),
        Arc::clone(&moderation) as _,
        gatekeeper,
        vec![Arc::new(provider)],
        controller.token(),
    );

    let rewards = RewardsHandler::new(
        RewardsConfig::default(),
        Arc::clone(&queue),
        Arc::clone(&points),
        Arc::clone(&backend) as _,
        Arc::new(PermissiveIpReputationChecker),
        moderation,
        chat,
        RewardsHandlerOptions {
            // keep challenges out of this scenario
            challenge_interval: Arc::new(|_, _| Duration::from_secs(1_000_000)),
            ..Default::default()
        },
        controller.token(),
    );
    rewards.start();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // one connected, legitimate spectator who is not the requester
    let spectator_address = addr('7');
    rewards.register_spectator(
        &SpectatorContext {
            remote_address: "203.0.113.2".into(),
            ip_country: "US".into(),
        },
        User::address_only(spectator_address.clone()),
    );

    // the requester enqueues a 120-second track
    let requester = User::address_only(addr('1'));
    let ctx = RequestContext {
        remote_address: "198.51.100.7".into(),
        user: Some(requester.clone()),
    };
    let result = manager
        .enqueue_media(
            &ctx,
            EnqueueMediaParams {
                info: MediaRequestInfo::Track {
                    permalink: "https://tracks.example/calm".into(),
                    start_offset_ms: None,
                },
                unskippable: false,
                concealed: false,
                anonymous: false,
                password: None,
            },
        )
        .await
        .unwrap();
    let EnqueueMediaResult::Ticket(ticket) = result else {
        panic!("expected a ticket");
    };
    let cost = ticket.request_cost();
    assert!(!cost.is_zero());

    let mut status = ticket
        .status_changed()
        .subscribe(BufferingGuarantee::BufferAll);
    let mut distributed = rewards
        .on_rewards_distributed()
        .subscribe(BufferingGuarantee::BufferAll);

    // payment of exactly the cost arrives
    assert!(pool.simulate_payment(ticket.payment_address(), cost, "ban_payer"));
    assert_eq!(status.recv().await, Some(TicketStatus::Paid));
    assert_eq!(queue.len(), 1);

    // the requester earns the enqueue reward: 120/10 + 1
    let points_for_balance = Arc::clone(&points);
    let requester_address = requester.address().to_string();
    eventually("requester earned the enqueue reward", move || {
        let points = Arc::clone(&points_for_balance);
        let address = requester_address.clone();
        async move { points.balance(&address).await.unwrap() == 13 }
    })
    .await;

    // the entry plays out
    tokio::time::sleep(Duration::from_secs(121)).await;
    let queue_for_empty = Arc::clone(&queue);
    eventually("queue drained after playback", move || {
        let queue = Arc::clone(&queue_for_empty);
        async move { queue.is_empty() }
    })
    .await;

    // the single eligible spectator receives the full cost
    let args = distributed.recv().await.unwrap();
    assert_eq!(args.total, cost);
    assert_eq!(args.eligible_count, 1);
    assert_eq!(args.recipients, vec![(spectator_address.clone(), cost)]);
    assert_eq!(args.collector_remainder, Amount::zero());
    assert_eq!(backend.total_sent_to(&spectator_address), cost);

    // playback history records the performance
    let (history,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM played_media")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(history, 1);
}
