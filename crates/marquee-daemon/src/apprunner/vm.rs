//! The cooperative script loop.
//!
//! Each application instance owns one loop: a dedicated thread holding the
//! script engine and consuming task closures from a channel, so at most one
//! script runs at any instant. Host code from other threads only touches the
//! engine by scheduling closures here; the single legitimate cross-thread
//! exception is the interrupt flag, which the engine checks at safe points
//! through its progress callback and which aborts the running script.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::logger::AppLogger;

/// A closure scheduled onto the loop.
pub type VmTask = Box<dyn FnOnce(&mut VmState) + Send>;

/// State owned by the loop thread.
pub struct VmState {
    pub engine: rhai::Engine,
    pub scope: rhai::Scope<'static>,
    /// The compiled main script; function pointers resolve against it.
    pub main_ast: Option<rhai::AST>,
    pub logger: Arc<AppLogger>,
}

/// Outcome of a deferred computation, as observed by the host.
#[derive(Debug, Clone)]
pub struct DeferredOutcome {
    pub rejected: bool,
    /// JSON-serialized settlement value.
    pub value: String,
}

enum DeferredEntry {
    Pending {
        waiter: Option<oneshot::Sender<DeferredOutcome>>,
    },
    Completed {
        rejected: bool,
        value: String,
        observed: bool,
    },
}

/// Registry of deferred results. A rejected deferred nobody observes is the
/// analog of an unhandled promise rejection: it is held for the watchdog to
/// report, until (if ever) an observer turns up.
#[derive(Default)]
pub struct DeferredRegistry {
    next_id: i64,
    entries: HashMap<i64, DeferredEntry>,
    unhandled: Vec<i64>,
}

impl DeferredRegistry {
    pub fn create(&mut self) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(id, DeferredEntry::Pending { waiter: None });
        id
    }

    /// Settle a deferred. Returns false for unknown or already settled ids.
    pub fn settle(&mut self, id: i64, rejected: bool, value: String) -> bool {
        match self.entries.get_mut(&id) {
            Some(DeferredEntry::Pending { waiter }) => {
                match waiter.take() {
                    Some(waiter) => {
                        let _ = waiter.send(DeferredOutcome {
                            rejected,
                            value: value.clone(),
                        });
                        self.entries.insert(
                            id,
                            DeferredEntry::Completed {
                                rejected,
                                value,
                                observed: true,
                            },
                        );
                    }
                    None => {
                        if rejected {
                            self.unhandled.push(id);
                        }
                        self.entries.insert(
                            id,
                            DeferredEntry::Completed {
                                rejected,
                                value,
                                observed: false,
                            },
                        );
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Attach an observer. `None` when the id is unknown or already has one.
    pub fn attach(&mut self, id: i64) -> Option<oneshot::Receiver<DeferredOutcome>> {
        match self.entries.get_mut(&id)? {
            DeferredEntry::Pending { waiter } => {
                if waiter.is_some() {
                    return None;
                }
                let (tx, rx) = oneshot::channel();
                *waiter = Some(tx);
                Some(rx)
            }
            DeferredEntry::Completed {
                rejected,
                value,
                observed,
            } => {
                *observed = true;
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(DeferredOutcome {
                    rejected: *rejected,
                    value: value.clone(),
                });
                self.unhandled.retain(|u| u != &id);
                Some(rx)
            }
        }
    }

    /// Rejected settlements that still have no observer; cleared on return.
    pub fn drain_unhandled(&mut self) -> Vec<String> {
        let ids = std::mem::take(&mut self.unhandled);
        ids.into_iter()
            .filter_map(|id| match self.entries.get(&id) {
                Some(DeferredEntry::Completed {
                    rejected: true,
                    value,
                    observed: false,
                }) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }
}

enum VmControl {
    Run(VmTask),
    Pause { ack: oneshot::Sender<usize> },
    Resume { ack: oneshot::Sender<()> },
    Shutdown { ack: oneshot::Sender<()> },
}

/// Handle to a loop thread.
pub struct ScriptVm {
    control_tx: mpsc::UnboundedSender<VmControl>,
    interrupt: Arc<AtomicBool>,
}

/// Scheduling-only capability handed to modules; they may enqueue work on
/// the loop but cannot pause or terminate it.
#[derive(Clone)]
pub struct LoopScheduler {
    control_tx: mpsc::UnboundedSender<VmControl>,
}

impl LoopScheduler {
    /// Schedule a task onto the loop. Returns false once the loop has shut
    /// down.
    pub fn schedule(&self, task: impl FnOnce(&mut VmState) + Send + 'static) -> bool {
        self.control_tx.send(VmControl::Run(Box::new(task))).is_ok()
    }
}

/// The receiving half of a created loop, waiting for its state.
pub struct VmStarter {
    control_rx: mpsc::UnboundedReceiver<VmControl>,
    interrupt: Arc<AtomicBool>,
}

impl VmStarter {
    /// Spawn the loop thread around the given state. The loop starts
    /// paused; `resume` begins task processing.
    pub fn start(self, state: VmState) {
        std::thread::Builder::new()
            .name("app-script-loop".to_string())
            .spawn(move || vm_thread(state, self.control_rx, self.interrupt))
            .expect("failed to spawn script loop thread");
    }
}

impl ScriptVm {
    /// Create the control channel; the thread itself starts once the state
    /// is handed to the returned starter. This split lets schedulers be
    /// handed out before the engine exists.
    pub fn create(interrupt: Arc<AtomicBool>) -> (Self, VmStarter) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            Self {
                control_tx,
                interrupt: Arc::clone(&interrupt),
            },
            VmStarter {
                control_rx,
                interrupt,
            },
        )
    }

    /// Create and immediately start the loop thread.
    pub fn spawn(state: VmState, interrupt: Arc<AtomicBool>) -> Self {
        let (vm, starter) = Self::create(interrupt);
        starter.start(state);
        vm
    }

    pub fn scheduler(&self) -> LoopScheduler {
        LoopScheduler {
            control_tx: self.control_tx.clone(),
        }
    }

    /// Schedule a task onto the loop. Returns false once the loop has shut
    /// down. While paused, tasks queue up and run on resume.
    pub fn schedule(&self, task: impl FnOnce(&mut VmState) + Send + 'static) -> bool {
        self.control_tx.send(VmControl::Run(Box::new(task))).is_ok()
    }

    /// Stop processing tasks; resolves with the backlog size once the
    /// current task (if any) has finished.
    pub async fn pause(&self) -> usize {
        let (ack, rx) = oneshot::channel();
        if self.control_tx.send(VmControl::Pause { ack }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn resume(&self) {
        let (ack, rx) = oneshot::channel();
        if self.control_tx.send(VmControl::Resume { ack }).is_ok() {
            let _ = rx.await;
        }
    }

    /// End the loop thread permanently.
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.control_tx.send(VmControl::Shutdown { ack }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Abort the currently running script. Safe to call from any thread; the
    /// flag is cleared after the interrupted task returns.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }
}

fn vm_thread(
    mut state: VmState,
    mut control_rx: mpsc::UnboundedReceiver<VmControl>,
    interrupt: Arc<AtomicBool>,
) {
    let mut paused = true;
    let mut backlog: std::collections::VecDeque<VmTask> = std::collections::VecDeque::new();

    while let Some(control) = control_rx.blocking_recv() {
        match control {
            VmControl::Run(task) => {
                if paused {
                    backlog.push_back(task);
                } else {
                    run_task(&mut state, task, &interrupt);
                }
            }
            VmControl::Pause { ack } => {
                paused = true;
                let _ = ack.send(backlog.len());
            }
            VmControl::Resume { ack } => {
                paused = false;
                let _ = ack.send(());
                while !paused {
                    let Some(task) = backlog.pop_front() else {
                        break;
                    };
                    run_task(&mut state, task, &interrupt);
                }
            }
            VmControl::Shutdown { ack } => {
                let _ = ack.send(());
                break;
            }
        }
    }
    debug!("script loop thread ended");
}

fn run_task(state: &mut VmState, task: VmTask, interrupt: &AtomicBool) {
    let logger = Arc::clone(&state.logger);
    let result = catch_unwind(AssertUnwindSafe(|| task(state)));
    interrupt.store(false, Ordering::SeqCst);
    if let Err(panic) = result {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        logger.runtime_error(format!("runtime panic occurred: {message}"));
    }
}

/// Truncated display form of a script value, for the expression console.
pub fn format_result(value: &rhai::Dynamic, depth: usize) -> String {
    const MAX_DEPTH: usize = 1;
    const MAX_ITEMS: usize = 10;

    if value.is_unit() {
        return String::new();
    }
    if value.is_string() {
        let s = value.clone().into_immutable_string().unwrap_or_default();
        return serde_json::Value::String(s.to_string()).to_string();
    }
    if let Some(array) = value.read_lock::<rhai::Array>() {
        if depth == MAX_DEPTH {
            return if array.is_empty() { "[]".into() } else { "[...]".into() };
        }
        let mut parts: Vec<String> = array
            .iter()
            .take(MAX_ITEMS)
            .map(|v| format_result(v, depth + 1))
            .collect();
        if array.len() > MAX_ITEMS {
            parts.push("...".to_string());
        }
        return format!("[{}]", parts.join(", "));
    }
    if let Some(map) = value.read_lock::<rhai::Map>() {
        if depth == MAX_DEPTH {
            return "#{...}".to_string();
        }
        let mut parts: Vec<String> = map
            .iter()
            .take(MAX_ITEMS)
            .map(|(k, v)| format!("{}: {}", k, format_result(v, depth + 1)))
            .collect();
        if map.len() > MAX_ITEMS {
            parts.push("...".to_string());
        }
        return format!("#{{{}}}", parts.join(", "));
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> VmState {
        VmState {
            engine: rhai::Engine::new(),
            scope: rhai::Scope::new(),
            main_ast: None,
            logger: AppLogger::new(),
        }
    }

    #[tokio::test]
    async fn tasks_run_in_order_after_resume() {
        let vm = ScriptVm::spawn(test_state(), Arc::new(AtomicBool::new(false)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..3 {
            let tx = tx.clone();
            vm.schedule(move |_| {
                let _ = tx.send(i);
            });
        }
        // the loop starts paused; nothing runs yet
        assert!(rx.try_recv().is_err());

        vm.resume().await;
        for expected in 0..3 {
            assert_eq!(rx.recv().await, Some(expected));
        }
        vm.shutdown().await;
    }

    #[tokio::test]
    async fn pause_reports_backlog() {
        let vm = ScriptVm::spawn(test_state(), Arc::new(AtomicBool::new(false)));
        vm.schedule(|_| {});
        vm.schedule(|_| {});
        assert_eq!(vm.pause().await, 2);
        vm.shutdown().await;
    }

    #[tokio::test]
    async fn panics_become_runtime_errors() {
        let state = test_state();
        let logger = Arc::clone(&state.logger);
        let vm = ScriptVm::spawn(state, Arc::new(AtomicBool::new(false)));
        vm.resume().await;

        vm.schedule(|_| panic!("boom"));
        let (tx, rx) = oneshot::channel();
        vm.schedule(move |_| {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert!(logger.contains(super::super::logger::AppLogLevel::RuntimeError, "boom"));
        vm.shutdown().await;
    }

    #[tokio::test]
    async fn interrupt_aborts_running_script() {
        let mut state = test_state();
        let flag = Arc::new(AtomicBool::new(false));
        let progress_flag = Arc::clone(&flag);
        state.engine.on_progress(move |_| {
            if progress_flag.load(Ordering::SeqCst) {
                Some(rhai::Dynamic::from("interrupted"))
            } else {
                None
            }
        });
        let vm = ScriptVm::spawn(state, flag);
        vm.resume().await;

        let (tx, rx) = oneshot::channel();
        vm.schedule(move |state| {
            let result = state.engine.eval::<rhai::Dynamic>("loop { }");
            let _ = tx.send(result.is_err());
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        vm.interrupt();
        assert!(rx.await.unwrap());
        vm.shutdown().await;
    }

    #[test]
    fn deferred_registry_tracks_unhandled_rejections() {
        let mut registry = DeferredRegistry::default();
        let id = registry.create();
        assert!(registry.settle(id, true, "{\"code\":1}".to_string()));
        // nobody observed: it is unhandled
        assert_eq!(registry.drain_unhandled(), vec!["{\"code\":1}".to_string()]);
        // draining clears
        assert!(registry.drain_unhandled().is_empty());

        // observing before the drain suppresses the report
        let id2 = registry.create();
        registry.settle(id2, true, "\"x\"".to_string());
        let rx = registry.attach(id2).unwrap();
        assert!(registry.drain_unhandled().is_empty());
        drop(rx);
    }

    #[test]
    fn deferred_observer_receives_settlement() {
        let mut registry = DeferredRegistry::default();
        let id = registry.create();
        let mut rx = registry.attach(id).unwrap();
        assert!(rx.try_recv().is_err());

        registry.settle(id, false, "42".to_string());
        let outcome = rx.try_recv().unwrap();
        assert!(!outcome.rejected);
        assert_eq!(outcome.value, "42");

        // settling twice is refused
        assert!(!registry.settle(id, false, "43".to_string()));
    }
}
