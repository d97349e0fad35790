//! Marquee daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use marquee_core::config::load_config;
use marquee_core::shutdown::ShutdownController;
use marquee_core::tracing_init::init_tracing;

use marquee_daemon::apprunner::{AppRunner, ModuleDependencies};
use marquee_daemon::chat::ChatManager;
use marquee_daemon::configuration::ConfigurationManager;
use marquee_daemon::enqueue::EnqueueManager;
use marquee_daemon::gatekeeper::Gatekeeper;
use marquee_daemon::ipreputation::PermissiveIpReputationChecker;
use marquee_daemon::media::{MediaError, TrackCatalog, TrackInfo, TrackProvider};
use marquee_daemon::moderation::InMemoryModerationStore;
use marquee_daemon::payment::{InMemoryPaymentPool, RecordingRewardsBackend};
use marquee_daemon::points::PointsManager;
use marquee_daemon::queue::MediaQueue;
use marquee_daemon::rewards::{RewardsHandler, RewardsHandlerOptions};
use marquee_daemon::storage::Database;

#[derive(Parser)]
#[command(name = "marquee-daemon", about = "Marquee runtime-coordination daemon")]
struct Args {
    /// Path to a JSON settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file path (overrides the settings file).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

/// Catalog used when no external track source is wired up; every lookup
/// misses.
struct OfflineCatalog;

#[async_trait::async_trait]
impl TrackCatalog for OfflineCatalog {
    async fn track_info(&self, _permalink: &str) -> Result<Option<TrackInfo>, MediaError> {
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref()).context("loading configuration")?;
    init_tracing(
        &config.daemon.log_level,
        args.log_json || config.daemon.log_json,
    );

    let database_path = args
        .database
        .or_else(|| config.daemon.database_path.clone())
        .unwrap_or_else(|| PathBuf::from("marquee.db"));
    let db = Database::open(&database_path)
        .await
        .context("opening database")?;

    let controller = ShutdownController::new();
    let token = controller.token();

    let queue = MediaQueue::new(config.queue.clone());
    queue.start(token.clone(), Some(db.clone()));

    let points = PointsManager::new(db.clone());
    let moderation = InMemoryModerationStore::new();
    let chat = ChatManager::new(moderation.clone());
    let gatekeeper = Gatekeeper::new();
    let configuration = ConfigurationManager::new();

    // external collaborators; replaced by real integrations in deployment
    let payment_pool = InMemoryPaymentPool::new();
    let rewards_backend = RecordingRewardsBackend::new();
    let ip_checker = Arc::new(PermissiveIpReputationChecker);

    let track_provider = TrackProvider::new(
        Arc::new(OfflineCatalog),
        db.clone(),
        Arc::clone(&queue),
        config.enqueue.clone(),
    );

    let _enqueue_manager = EnqueueManager::new(
        config.enqueue.clone(),
        db.clone(),
        Arc::clone(&queue),
        Arc::clone(&points),
        payment_pool,
        moderation.clone(),
        Arc::clone(&gatekeeper),
        vec![Arc::new(track_provider)],
        token.clone(),
    );

    let rewards = RewardsHandler::new(
        config.rewards.clone(),
        Arc::clone(&queue),
        Arc::clone(&points),
        rewards_backend,
        ip_checker,
        moderation,
        Arc::clone(&chat),
        RewardsHandlerOptions::default(),
        token.clone(),
    );
    rewards.start();

    let runner = AppRunner::new(
        token.clone(),
        config.sandbox.clone(),
        ModuleDependencies {
            db: db.clone(),
            points,
            chat,
            configuration,
            runtime: tokio::runtime::Handle::current(),
        },
    );

    for application in db.autorun_applications().await? {
        if let Err(e) = runner.launch_application(&application.id).await {
            warn!(application_id = application.id, error = %e, "Autorun launch failed");
        }
    }

    info!(database = %database_path.display(), "Marquee daemon running");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    controller.shutdown();
    // give workers a moment to observe the shutdown
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    Ok(())
}
