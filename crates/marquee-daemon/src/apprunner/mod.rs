//! Application runtime: a sandbox for untrusted, user-authored scripts.
//!
//! Each application runs in exactly one instance with a cooperative
//! single-threaded script loop, watched by a stuck-loop watchdog, and sees
//! the host only through capability modules.

mod instance;
mod logger;
pub mod modules;
mod vm;

pub use instance::{AppInstance, MAIN_FILE_NAME, RUNTIME_VERSION};
pub use logger::{AppLogEntry, AppLogLevel, AppLogger};
pub use modules::rpc::{ClientEventData, InvocationResult, RpcModule};
pub use modules::{ApplicationContext, ModuleDependencies, PageInfo};
pub use vm::DeferredOutcome;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marquee_core::config::SandboxConfig;
use marquee_core::event::Event;
use marquee_core::shutdown::ShutdownToken;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

use crate::storage::DatabaseError;

/// Errors from the application runtime.
#[derive(Debug, thiserror::Error)]
pub enum AppRunnerError {
    #[error("application not found")]
    ApplicationNotFound,

    #[error("application not enabled")]
    ApplicationNotEnabled,

    #[error("application not instantiated")]
    ApplicationNotInstantiated,

    #[error("an instance of this application already exists")]
    InstanceAlreadyExists,

    #[error("application instance already running")]
    InstanceAlreadyRunning,

    #[error("application instance already paused")]
    InstanceAlreadyPaused,

    #[error("application instance terminated")]
    InstanceTerminated,

    #[error("application instance not running")]
    InstanceNotRunning,

    #[error("application file not found")]
    ApplicationFileNotFound,

    #[error("unexpected type for application file")]
    ApplicationFileTypeMismatch,

    #[error("application log not found")]
    ApplicationLogNotFound,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Information about a running application.
#[derive(Debug, Clone)]
pub struct RunningApplication {
    pub application_id: String,
    pub application_version: i64,
    pub started_at: i64,
}

/// Launches applications and manages their lifecycle.
pub struct AppRunner {
    worker_ctx: ShutdownToken,
    sandbox_config: SandboxConfig,
    deps: ModuleDependencies,
    instances: RwLock<HashMap<String, Arc<AppInstance>>>,
    recent_logs: Mutex<HashMap<String, (Arc<AppLogger>, Instant)>>,
    on_running_applications_updated: Event<Vec<RunningApplication>>,
    on_application_launched: Event<RunningApplication>,
    on_application_stopped: Event<RunningApplication>,
}

impl AppRunner {
    pub fn new(
        worker_ctx: ShutdownToken,
        sandbox_config: SandboxConfig,
        deps: ModuleDependencies,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker_ctx,
            sandbox_config,
            deps,
            instances: RwLock::new(HashMap::new()),
            recent_logs: Mutex::new(HashMap::new()),
            on_running_applications_updated: Event::new(),
            on_application_launched: Event::new(),
            on_application_stopped: Event::new(),
        })
    }

    /// Fired when the list of running applications changes.
    pub fn on_running_applications_updated(&self) -> &Event<Vec<RunningApplication>> {
        &self.on_running_applications_updated
    }

    pub fn on_application_launched(&self) -> &Event<RunningApplication> {
        &self.on_application_launched
    }

    pub fn on_application_stopped(&self) -> &Event<RunningApplication> {
        &self.on_application_stopped
    }

    /// Launch the current version of an application.
    pub async fn launch_application(self: &Arc<Self>, application_id: &str) -> Result<(), AppRunnerError> {
        self.launch_application_at_version(application_id, 0).await
    }

    /// Launch a specific version (0 = current).
    pub async fn launch_application_at_version(
        self: &Arc<Self>,
        application_id: &str,
        version: i64,
    ) -> Result<(), AppRunnerError> {
        let application = self
            .deps
            .db
            .application(application_id)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound(_) => AppRunnerError::ApplicationNotFound,
                other => AppRunnerError::Database(other),
            })?;
        if application.allow_launching == 0 {
            return Err(AppRunnerError::ApplicationNotEnabled);
        }
        let version = if version == 0 {
            application.updated_at
        } else {
            version
        };

        let mut instances = self.instances.write().await;
        if instances.contains_key(application_id) {
            return Err(AppRunnerError::InstanceAlreadyExists);
        }

        let instance = AppInstance::new(
            application_id.to_string(),
            version,
            self.sandbox_config.clone(),
            self.deps.clone(),
        );
        if let Err(e) = instance.start_or_resume(&self.worker_ctx).await {
            return Err(e);
        }
        instances.insert(application_id.to_string(), Arc::clone(&instance));
        let running_list = Self::running_applications_of(&instances).await;
        drop(instances);

        info!(application_id, version, "Application launched");
        let (_, started_at) = instance.running().await;
        self.on_application_launched.notify(RunningApplication {
            application_id: application_id.to_string(),
            application_version: version,
            started_at,
        });
        self.on_running_applications_updated.notify(running_list);
        Ok(())
    }

    /// Stop and destroy an application instance, retaining its log for a
    /// while.
    pub async fn stop_application(self: &Arc<Self>, application_id: &str) -> Result<(), AppRunnerError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .remove(application_id)
            .ok_or(AppRunnerError::ApplicationNotInstantiated)?;
        let running_list = Self::running_applications_of(&instances).await;
        drop(instances);

        let (_, started_at) = instance.running().await;
        match instance.terminate(true, Duration::from_secs(10), true).await {
            Ok(()) | Err(AppRunnerError::InstanceTerminated) => {}
            Err(e) => return Err(e),
        }

        self.retain_recent_log(application_id, Arc::clone(instance.logger()));
        info!(application_id, "Application stopped");
        self.on_application_stopped.notify(RunningApplication {
            application_id: application_id.to_string(),
            application_version: instance.application_version(),
            started_at,
        });
        self.on_running_applications_updated.notify(running_list);
        Ok(())
    }

    pub async fn get_instance(&self, application_id: &str) -> Option<Arc<AppInstance>> {
        self.instances.read().await.get(application_id).cloned()
    }

    /// Whether the application is running and, if so, its version and state
    /// timestamp.
    pub async fn is_running(&self, application_id: &str) -> Option<(i64, i64)> {
        let instance = self.get_instance(application_id).await?;
        let (running, since) = instance.running().await;
        running.then(|| (instance.application_version(), since))
    }

    pub async fn running_applications(&self) -> Vec<RunningApplication> {
        let instances = self.instances.read().await;
        Self::running_applications_of(&instances).await
    }

    async fn running_applications_of(
        instances: &HashMap<String, Arc<AppInstance>>,
    ) -> Vec<RunningApplication> {
        let mut list = Vec::new();
        for instance in instances.values() {
            let (running, started_at) = instance.running().await;
            if running {
                list.push(RunningApplication {
                    application_id: instance.application_id().to_string(),
                    application_version: instance.application_version(),
                    started_at,
                });
            }
        }
        list.sort_by(|a, b| a.application_id.cmp(&b.application_id));
        list
    }

    /// The log of a running or recently stopped application.
    pub async fn application_log(&self, application_id: &str) -> Result<Arc<AppLogger>, AppRunnerError> {
        if let Some(instance) = self.get_instance(application_id).await {
            return Ok(Arc::clone(instance.logger()));
        }
        let retention = Duration::from_secs(self.sandbox_config.recent_log_retention_secs);
        let mut recent = self.recent_logs.lock().expect("recent logs poisoned");
        recent.retain(|_, (_, stored)| stored.elapsed() < retention);
        recent
            .get(application_id)
            .map(|(logger, _)| Arc::clone(logger))
            .ok_or(AppRunnerError::ApplicationLogNotFound)
    }

    fn retain_recent_log(&self, application_id: &str, logger: Arc<AppLogger>) {
        let retention = Duration::from_secs(self.sandbox_config.recent_log_retention_secs);
        let mut recent = self.recent_logs.lock().expect("recent logs poisoned");
        recent.retain(|_, (_, stored)| stored.elapsed() < retention);
        recent.insert(application_id.to_string(), (logger, Instant::now()));
    }

    /// Evaluate an expression in the context of a running application.
    pub async fn evaluate_expression_on_application(
        &self,
        application_id: &str,
        expression: &str,
    ) -> Result<(bool, String, Duration), AppRunnerError> {
        let instance = self
            .get_instance(application_id)
            .await
            .ok_or(AppRunnerError::ApplicationNotInstantiated)?;
        instance
            .evaluate_expression(&self.worker_ctx, expression)
            .await
    }

    /// Resolve a published page of a running application.
    pub async fn resolve_page(&self, application_id: &str, page_id: &str) -> Option<PageInfo> {
        let instance = self.get_instance(application_id).await?;
        instance.resolve_page(page_id)
    }
}
