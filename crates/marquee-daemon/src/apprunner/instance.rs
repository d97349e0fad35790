//! One application instance: a script loop plus lifecycle management.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use marquee_core::config::SandboxConfig;
use marquee_core::db::unix_timestamp;
use marquee_core::event::{BufferingGuarantee, NoArgEvent};
use marquee_core::shutdown::{ShutdownController, ShutdownToken};
use marquee_core::user::User;
use tokio::sync::{oneshot, RwLock};

use crate::storage::Database;

use super::logger::AppLogger;
use super::modules::chat::ChatModule;
use super::modules::configuration::ConfigurationModule;
use super::modules::db::DbModule;
use super::modules::keyvalue::KeyValueModule;
use super::modules::pages::{PageInfo, PagesModule};
use super::modules::points::PointsModule;
use super::modules::process::ProcessModule;
use super::modules::rpc::{InvocationResult, RpcModule};
use super::modules::{ApplicationContext, ModuleCollection, ModuleDependencies};
use super::vm::{format_result, DeferredRegistry, ScriptVm, VmStarter, VmState};
use super::AppRunnerError;

/// The application file containing the entry point.
pub const MAIN_FILE_NAME: &str = "main.rhai";

/// The version of the application runtime.
pub const RUNTIME_VERSION: u32 = 1;

const VALID_SCRIPT_MIME_TYPES: [&str; 3] = ["text/x-rhai", "application/x-rhai", "text/plain"];

struct LifecycleState {
    running: bool,
    started_once: bool,
    terminated: bool,
    started_or_stopped_at: i64,
    execution: Option<ShutdownController>,
    watchdog: Option<ShutdownController>,
}

/// A running (or paused, or terminated) application instance. Exactly one
/// exists per application id at any time.
pub struct AppInstance {
    application_id: String,
    application_version: i64,
    sandbox_config: SandboxConfig,
    db: Database,
    state: RwLock<LifecycleState>,
    logger: Arc<AppLogger>,
    modules: ModuleCollection,
    rpc: Arc<RpcModule>,
    pages: Arc<PagesModule>,
    vm: ScriptVm,
    deferreds: Arc<Mutex<DeferredRegistry>>,
    sources: Arc<Mutex<HashMap<String, String>>>,
    on_paused: NoArgEvent,
    on_terminated: NoArgEvent,
    exit_code: AtomicI32,
}

struct InstanceContext {
    instance: Weak<AppInstance>,
    application_id: String,
    application_version: i64,
    runtime: tokio::runtime::Handle,
}

impl ApplicationContext for InstanceContext {
    fn application_id(&self) -> String {
        self.application_id.clone()
    }

    fn application_version(&self) -> i64 {
        self.application_version
    }

    fn runtime_version(&self) -> u32 {
        RUNTIME_VERSION
    }

    fn abort_process(&self) {
        if let Some(instance) = self.instance.upgrade() {
            self.runtime.spawn(async move {
                let _ = instance.terminate(true, Duration::ZERO, false).await;
            });
        }
    }

    fn exit_process(&self, code: i32) {
        if let Some(instance) = self.instance.upgrade() {
            instance.exit_code.store(code, Ordering::SeqCst);
            self.runtime.spawn(async move {
                let _ = instance.terminate(true, Duration::ZERO, false).await;
            });
        }
    }

    fn resolve_page(&self, page_id: &str) -> Option<PageInfo> {
        self.instance
            .upgrade()
            .and_then(|instance| instance.pages.resolve_page(page_id))
    }
}

/// Resolves `import` paths against the version-pinned source cache loaded at
/// start.
struct SourceCacheResolver {
    sources: Arc<Mutex<HashMap<String, String>>>,
}

impl rhai::ModuleResolver for SourceCacheResolver {
    fn resolve(
        &self,
        engine: &rhai::Engine,
        _source: Option<&str>,
        path: &str,
        pos: rhai::Position,
    ) -> Result<rhai::Shared<rhai::Module>, Box<rhai::EvalAltResult>> {
        let name = if path.ends_with(".rhai") {
            path.to_string()
        } else {
            format!("{path}.rhai")
        };
        let source_text = self
            .sources
            .lock()
            .expect("source cache poisoned")
            .get(&name)
            .cloned()
            .ok_or_else(|| {
                Box::new(rhai::EvalAltResult::ErrorModuleNotFound(
                    path.to_string(),
                    pos,
                ))
            })?;
        let ast: rhai::AST = engine
            .compile(&source_text)
            .map_err(|e| -> Box<rhai::EvalAltResult> { e.into() })?;
        let module = rhai::Module::eval_ast_as_new(rhai::Scope::new(), &ast, engine)?;
        Ok(rhai::Shared::new(module))
    }
}

impl AppInstance {
    pub(crate) fn new(
        application_id: String,
        application_version: i64,
        sandbox_config: SandboxConfig,
        deps: ModuleDependencies,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<AppInstance>| {
            let logger = AppLogger::new();
            let deferreds = Arc::new(Mutex::new(DeferredRegistry::default()));
            let sources: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
            let interrupt = Arc::new(AtomicBool::new(false));

            let context: Arc<dyn ApplicationContext> = Arc::new(InstanceContext {
                instance: weak.clone(),
                application_id: application_id.clone(),
                application_version,
                runtime: deps.runtime.clone(),
            });

            let (vm, vm_starter): (ScriptVm, VmStarter) =
                ScriptVm::create(Arc::clone(&interrupt));
            let scheduler = vm.scheduler();

            let rpc = RpcModule::new(Arc::clone(&deferreds));
            let pages = PagesModule::new(application_id.clone(), application_version, deps.clone());

            let mut modules = ModuleCollection::default();
            modules.register(Arc::clone(&rpc) as _);
            modules.register(Arc::clone(&pages) as _);
            modules.register(ProcessModule::new(Arc::clone(&context)));
            modules.register(KeyValueModule::new(application_id.clone(), deps.clone()));
            modules.register(DbModule::new(application_id.clone(), deps.clone()));
            modules.register(PointsModule::new(
                Arc::clone(&context),
                deps.clone(),
                scheduler.clone(),
            ));
            modules.register(ChatModule::new(
                Arc::clone(&context),
                deps.clone(),
                scheduler,
            ));
            modules.register(ConfigurationModule::new(
                Arc::clone(&context),
                Arc::clone(&pages),
                deps.clone(),
            ));

            let mut engine = rhai::Engine::new();
            let flag = Arc::clone(&interrupt);
            engine.on_progress(move |_| {
                flag.load(Ordering::SeqCst)
                    .then(|| rhai::Dynamic::from("interrupted"))
            });
            let print_logger = Arc::clone(&logger);
            engine.on_print(move |message| print_logger.log(message));
            let debug_logger = Arc::clone(&logger);
            engine.on_debug(move |message, _source, _pos| debug_logger.warn(message));
            engine.set_module_resolver(SourceCacheResolver {
                sources: Arc::clone(&sources),
            });
            modules.enable_modules(&mut engine);

            vm_starter.start(VmState {
                engine,
                scope: rhai::Scope::new(),
                main_ast: None,
                logger: Arc::clone(&logger),
            });

            logger.runtime_log("application instance created");

            Self {
                application_id,
                application_version,
                sandbox_config,
                db: deps.db.clone(),
                state: RwLock::new(LifecycleState {
                    running: false,
                    started_once: false,
                    terminated: false,
                    started_or_stopped_at: unix_timestamp(),
                    execution: None,
                    watchdog: None,
                }),
                logger,
                modules,
                rpc,
                pages,
                vm,
                deferreds,
                sources,
                on_paused: NoArgEvent::new(),
                on_terminated: NoArgEvent::new(),
                exit_code: AtomicI32::new(0),
            }
        })
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub const fn application_version(&self) -> i64 {
        self.application_version
    }

    pub fn logger(&self) -> &Arc<AppLogger> {
        &self.logger
    }

    pub fn rpc(&self) -> &Arc<RpcModule> {
        &self.rpc
    }

    pub fn resolve_page(&self, page_id: &str) -> Option<PageInfo> {
        self.pages.resolve_page(page_id)
    }

    /// Fired when the instance is terminated.
    pub fn on_terminated(&self) -> &NoArgEvent {
        &self.on_terminated
    }

    /// Fired on every pause, including the one preceding termination.
    pub fn on_paused(&self) -> &NoArgEvent {
        &self.on_paused
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    /// Whether the instance is running, and since when it has been in its
    /// current state.
    pub async fn running(&self) -> (bool, i64) {
        let state = self.state.read().await;
        (state.running, state.started_or_stopped_at)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the instance, or resume it after a pause. The first start runs
    /// the main script.
    pub async fn start_or_resume(self: &Arc<Self>, ctx: &ShutdownToken) -> Result<(), AppRunnerError> {
        let mut state = self.state.write().await;
        if state.terminated {
            return Err(AppRunnerError::InstanceTerminated);
        }
        if state.running {
            return Err(AppRunnerError::InstanceAlreadyRunning);
        }

        let files = self
            .db
            .application_files(&self.application_id, self.application_version)
            .await?;
        {
            let mut sources = self.sources.lock().expect("source cache poisoned");
            sources.clear();
            for file in &files {
                if VALID_SCRIPT_MIME_TYPES.contains(&file.file_type.as_str()) {
                    sources.insert(
                        file.name.clone(),
                        String::from_utf8_lossy(&file.content).into_owned(),
                    );
                }
            }
        }
        let main_source = {
            let file = files
                .iter()
                .find(|f| f.name == MAIN_FILE_NAME)
                .ok_or(AppRunnerError::ApplicationFileNotFound)?;
            if !VALID_SCRIPT_MIME_TYPES.contains(&file.file_type.as_str()) {
                return Err(AppRunnerError::ApplicationFileTypeMismatch);
            }
            String::from_utf8_lossy(&file.content).into_owned()
        };

        let execution = ShutdownController::child_of(ctx);
        let execution_token = execution.token();

        self.vm.resume().await;
        state.running = true;
        state.started_or_stopped_at = unix_timestamp();
        state.watchdog = Some(self.start_watchdog(Duration::from_secs(
            self.sandbox_config.event_loop_stuck_tolerance_secs,
        )));
        state.execution = Some(execution);

        self.modules.execution_resumed(&execution_token);

        if !state.started_once {
            state.started_once = true;
            let logger = Arc::clone(&self.logger);
            self.run_on_loop_with_interruption(execution_token, move |vm_state| {
                match vm_state.engine.compile(&main_source) {
                    Ok(ast) => {
                        let result = vm_state
                            .engine
                            .eval_ast_with_scope::<rhai::Dynamic>(&mut vm_state.scope, &ast);
                        vm_state.main_ast = Some(ast);
                        logger.runtime_log("application instance started");
                        if let Err(e) = result {
                            // user code; no host stack needed
                            logger.runtime_error(e.to_string());
                        }
                    }
                    Err(e) => logger.runtime_error(format!("main script failed to compile: {e}")),
                }
            });
        }

        Ok(())
    }

    /// Pause the instance. With `force`, the running script is interrupted
    /// after `after`.
    pub async fn pause(
        self: &Arc<Self>,
        force: bool,
        after: Duration,
        wait_until_stopped: bool,
    ) -> Result<(), AppRunnerError> {
        let this = Arc::clone(self);
        let work = async move {
            let mut state = this.state.write().await;
            this.pause_locked(&mut state, force, after, false).await
        };
        if wait_until_stopped {
            work.await
        } else {
            tokio::spawn(work);
            Ok(())
        }
    }

    /// Permanently stop the instance. Terminated is terminal: the loop
    /// thread ends and the instance can never run again.
    pub async fn terminate(
        self: &Arc<Self>,
        force: bool,
        after: Duration,
        wait_until_terminated: bool,
    ) -> Result<(), AppRunnerError> {
        let this = Arc::clone(self);
        let work = async move {
            {
                let mut state = this.state.write().await;
                if state.terminated {
                    return Err(AppRunnerError::InstanceTerminated);
                }
                match this.pause_locked(&mut state, force, after, true).await {
                    Ok(()) | Err(AppRunnerError::InstanceAlreadyPaused) => {}
                    Err(e) => return Err(e),
                }
                state.terminated = true;
            }
            this.on_terminated.notify();
            this.vm.shutdown().await;
            Ok(())
        };
        if wait_until_terminated {
            work.await
        } else {
            tokio::spawn(work);
            Ok(())
        }
    }

    /// Shared pause path; must run under the state write lock.
    async fn pause_locked(
        &self,
        state: &mut LifecycleState,
        force: bool,
        after: Duration,
        to_terminate: bool,
    ) -> Result<(), AppRunnerError> {
        if !state.running {
            return Err(AppRunnerError::InstanceAlreadyPaused);
        }

        if let Some(watchdog) = state.watchdog.take() {
            watchdog.shutdown();
        }

        let (verb_present, verb_past) = if to_terminate {
            ("terminating", "terminated")
        } else {
            ("pausing", "paused")
        };
        if force {
            self.logger.runtime_log(format!(
                "{verb_present} application instance, interrupting after {after:?}"
            ));
        } else {
            self.logger
                .runtime_log(format!("{verb_present} application instance"));
        }

        let mut interrupt_timer = None;
        if force {
            if after.is_zero() {
                self.vm.interrupt();
                self.logger.runtime_log("execution interrupted");
            } else {
                let flag = self.vm.interrupt_flag();
                let logger = Arc::clone(&self.logger);
                interrupt_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    logger.runtime_log(format!(
                        "interrupting execution after waiting {after:?}"
                    ));
                    flag.store(true, Ordering::SeqCst);
                }));
            }
        }

        let jobs = self.vm.pause().await;
        if let Some(timer) = interrupt_timer {
            timer.abort();
        }

        self.modules.execution_paused();
        if let Some(execution) = state.execution.take() {
            execution.shutdown();
        }
        state.running = false;
        state.started_or_stopped_at = unix_timestamp();

        let exit_code_msg = if to_terminate {
            format!(" and exit code {}", self.exit_code())
        } else {
            String::new()
        };
        self.logger.runtime_log(format!(
            "application instance {verb_past} with {jobs} job(s) remaining{exit_code_msg}"
        ));
        self.on_paused.notify();
        Ok(())
    }

    // =========================================================================
    // Watchdog
    // =========================================================================

    /// Arm the event-loop-stuck monitor: a one-second probe on the loop
    /// resets the timer and reports unobserved deferred rejections; if the
    /// timer ever runs past the tolerance the instance is force-terminated
    /// from outside the loop.
    fn start_watchdog(self: &Arc<Self>, tolerance: Duration) -> ShutdownController {
        let stop = ShutdownController::new();
        let token = stop.token();
        let last_reset = Arc::new(Mutex::new(tokio::time::Instant::now()));
        let probe_in_flight = Arc::new(AtomicBool::new(false));

        {
            let token = token.clone();
            let last_reset = Arc::clone(&last_reset);
            let probe_in_flight = Arc::clone(&probe_in_flight);
            let instance = Arc::downgrade(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => return,
                        () = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    let Some(instance) = instance.upgrade() else {
                        return;
                    };
                    if probe_in_flight.swap(true, Ordering::SeqCst) {
                        continue;
                    }
                    let last_reset = Arc::clone(&last_reset);
                    let probe_in_flight = Arc::clone(&probe_in_flight);
                    let deferreds = Arc::clone(&instance.deferreds);
                    let logger = Arc::clone(&instance.logger);
                    instance.vm.schedule(move |_state| {
                        *last_reset.lock().expect("watchdog timer poisoned") =
                            tokio::time::Instant::now();
                        let unhandled = deferreds
                            .lock()
                            .expect("deferred registry poisoned")
                            .drain_unhandled();
                        for value in unhandled {
                            logger.runtime_error(format!("Uncaught (in deferred) {value}"));
                        }
                        probe_in_flight.store(false, Ordering::SeqCst);
                    });
                }
            });
        }

        {
            let token = token.clone();
            let last_reset = Arc::clone(&last_reset);
            let instance = Arc::downgrade(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => return,
                        () = tokio::time::sleep(Duration::from_millis(500)) => {}
                    }
                    let stale = last_reset
                        .lock()
                        .expect("watchdog timer poisoned")
                        .elapsed()
                        > tolerance;
                    if stale {
                        let Some(instance) = instance.upgrade() else {
                            return;
                        };
                        instance.logger.runtime_error(format!(
                            "application event loop stuck for at least {tolerance:?}, terminating"
                        ));
                        let _ = instance.terminate(true, Duration::ZERO, false).await;
                        return;
                    }
                }
            });
        }

        stop
    }

    // =========================================================================
    // Running code on the loop safely
    // =========================================================================

    /// Schedule `f` on the loop while racing the execution context: if it
    /// cancels before `f` finishes, the running script is interrupted.
    pub fn run_on_loop_with_interruption(
        &self,
        ctx: ShutdownToken,
        f: impl FnOnce(&mut VmState) + Send + 'static,
    ) {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let flag = self.vm.interrupt_flag();
        let logger = Arc::clone(&self.logger);
        tokio::spawn(async move {
            tokio::select! {
                () = ctx.cancelled() => {
                    logger.runtime_log("interrupting execution due to cancelled context");
                    flag.store(true, Ordering::SeqCst);
                }
                _ = done_rx => {}
            }
        });
        self.vm.schedule(move |state| {
            f(state);
            let _ = done_tx.send(());
        });
    }

    /// Evaluate an expression on the loop. Returns (successful, result,
    /// execution time). The instance lock is not held while waiting, so a
    /// pause can still win the race; in that case the evaluation reports the
    /// instance as not running.
    pub async fn evaluate_expression(
        self: &Arc<Self>,
        ctx: &ShutdownToken,
        expression: &str,
    ) -> Result<(bool, String, Duration), AppRunnerError> {
        {
            let state = self.state.read().await;
            if !state.running {
                return Err(AppRunnerError::InstanceNotRunning);
            }
        }

        let (result_tx, mut result_rx) =
            oneshot::channel::<(Result<String, String>, Duration)>();
        let could_have_paused = Arc::new(AtomicBool::new(true));
        let could_have_paused_loop = Arc::clone(&could_have_paused);
        let expression = expression.to_string();

        let mut on_paused = self.on_paused.subscribe(BufferingGuarantee::BufferFirst);

        self.run_on_loop_with_interruption(ctx.clone(), move |state| {
            could_have_paused_loop.store(false, Ordering::SeqCst);
            let start = std::time::Instant::now();
            let result = state
                .engine
                .eval_with_scope::<rhai::Dynamic>(&mut state.scope, &expression);
            let elapsed = start.elapsed();
            let _ = result_tx.send((
                result
                    .map(|v| format_result(&v, 0))
                    .map_err(|e| e.to_string()),
                elapsed,
            ));
        });

        loop {
            tokio::select! {
                result = &mut result_rx => {
                    return match result {
                        Ok((Ok(value), elapsed)) => Ok((true, value, elapsed)),
                        Ok((Err(error), elapsed)) => Ok((false, error, elapsed)),
                        Err(_) => Err(AppRunnerError::InstanceNotRunning),
                    };
                }
                _ = on_paused.recv() => {
                    if could_have_paused.load(Ordering::SeqCst) {
                        // paused before our closure could run
                        return Err(AppRunnerError::InstanceNotRunning);
                    }
                    // otherwise a result (possibly an interrupt error) is
                    // still on its way
                }
            }
        }
    }

    // =========================================================================
    // RPC dispatch
    // =========================================================================

    /// Invoke an application-registered method on the loop.
    pub async fn invoke_rpc_method(
        &self,
        user: Option<User>,
        page_id: String,
        method: String,
        args: Vec<String>,
    ) -> Result<InvocationResult, AppRunnerError> {
        {
            let state = self.state.read().await;
            if !state.running {
                return Err(AppRunnerError::InstanceNotRunning);
            }
        }
        let rpc = Arc::clone(&self.rpc);
        let (tx, rx) = oneshot::channel();
        let scheduled = self.vm.schedule(move |state| {
            let result = rpc.dispatch_invocation(state, user.as_ref(), &page_id, &method, &args);
            let _ = tx.send(result);
        });
        if !scheduled {
            return Err(AppRunnerError::InstanceTerminated);
        }
        rx.await.map_err(|_| AppRunnerError::InstanceNotRunning)
    }

    /// Deliver a client event to the application's listeners on the loop.
    pub async fn dispatch_client_event(
        &self,
        user: Option<User>,
        trusted: bool,
        page_id: String,
        event: String,
        args: Vec<String>,
    ) -> Result<(), AppRunnerError> {
        {
            let state = self.state.read().await;
            if !state.running {
                return Err(AppRunnerError::InstanceNotRunning);
            }
        }
        let rpc = Arc::clone(&self.rpc);
        let scheduled = self.vm.schedule(move |state| {
            rpc.dispatch_event(state, user.as_ref(), trusted, &page_id, &event, &args);
        });
        if !scheduled {
            return Err(AppRunnerError::InstanceTerminated);
        }
        Ok(())
    }
}
