//! Adapts host events into script-visible event listeners.
//!
//! Modules register adaptations before the script runs; when execution
//! resumes the adapter subscribes to the host events, and each notification
//! is dispatched to the registered listeners on the script loop. Pausing
//! drops the subscriptions so no callbacks fire into a stopped loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use marquee_core::event::{BufferingGuarantee, Event, SubscriptionHandle};

use super::super::vm::LoopScheduler;

type ListenerMap = Arc<Mutex<HashMap<String, Vec<rhai::FnPtr>>>>;

pub struct EventAdapter {
    scheduler: LoopScheduler,
    listeners: ListenerMap,
    sources: Mutex<Vec<Box<dyn Fn() -> SubscriptionHandle + Send + Sync>>>,
    active: Mutex<Vec<SubscriptionHandle>>,
}

impl EventAdapter {
    pub fn new(scheduler: LoopScheduler) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            sources: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
        })
    }

    pub fn add_listener(&self, name: &str, listener: rhai::FnPtr) {
        self.listeners
            .lock()
            .expect("event listeners poisoned")
            .entry(name.to_string())
            .or_default()
            .push(listener);
    }

    pub fn remove_listener(&self, name: &str, listener: &rhai::FnPtr) {
        if let Some(listeners) = self
            .listeners
            .lock()
            .expect("event listeners poisoned")
            .get_mut(name)
        {
            if let Some(index) = listeners
                .iter()
                .position(|l| l.fn_name() == listener.fn_name())
            {
                listeners.remove(index);
            }
        }
    }

    /// Subscribe every adaptation to its host event. Idempotent while
    /// already started.
    pub fn start_or_resume(&self) {
        let mut active = self.active.lock().expect("active subscriptions poisoned");
        if !active.is_empty() {
            return;
        }
        for source in self.sources.lock().expect("event sources poisoned").iter() {
            active.push(source());
        }
    }

    /// Drop the host subscriptions; listeners stay registered for the next
    /// resume.
    pub fn pause(&self) {
        self.active
            .lock()
            .expect("active subscriptions poisoned")
            .clear();
    }
}

/// Register an adaptation: while execution is running, each notification of
/// `event` is serialized and dispatched to the `name` listeners on the loop.
pub fn adapt_event<T>(
    adapter: &Arc<EventAdapter>,
    event: &Event<T>,
    name: &'static str,
    serialize: impl Fn(&T) -> rhai::Dynamic + Send + Sync + 'static,
) where
    T: Clone + Send + 'static,
{
    let event = event.clone();
    let scheduler = adapter.scheduler.clone();
    let listeners = Arc::clone(&adapter.listeners);
    let serialize = Arc::new(serialize);

    adapter
        .sources
        .lock()
        .expect("event sources poisoned")
        .push(Box::new(move || {
            let scheduler = scheduler.clone();
            let listeners = Arc::clone(&listeners);
            let serialize = Arc::clone(&serialize);
            event.subscribe_using_callback(BufferingGuarantee::BufferAll, move |value: T| {
                let payload = serialize(&value);
                let listeners = Arc::clone(&listeners);
                scheduler.schedule(move |state| {
                    let Some(ast) = state.main_ast.clone() else {
                        return;
                    };
                    let current: Vec<rhai::FnPtr> = listeners
                        .lock()
                        .expect("event listeners poisoned")
                        .get(name)
                        .cloned()
                        .unwrap_or_default();
                    for listener in current {
                        if let Err(e) =
                            listener.call::<rhai::Dynamic>(&state.engine, &ast, (payload.clone(),))
                        {
                            state
                                .logger
                                .error(format!("error in event listener for {name}: {e}"));
                        }
                    }
                });
            })
        }));
}
