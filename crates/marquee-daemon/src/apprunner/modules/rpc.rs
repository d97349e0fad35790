//! `rpc` module: client-initiated method invocations and bidirectional
//! events.
//!
//! Applications register named methods with a minimum permission level and
//! listen for named events; clients invoke methods through the host, which
//! dispatches them on the script loop. Handlers return a value directly or a
//! deferred handle whose settlement the host observes through a one-shot
//! channel. Outbound events target global, page, user or (page, user)
//! scopes, each on its own keyed event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use marquee_core::event::{Event, Keyed};
use marquee_core::user::{PermissionLevel, User};
use tokio::sync::oneshot;

use super::super::vm::{DeferredOutcome, DeferredRegistry, VmState};
use super::{script_error, NativeModule, RhaiResult};

const DEFERRED_KEY: &str = "__deferred";

/// An event emitted by the application towards clients.
#[derive(Debug, Clone)]
pub struct ClientEventData {
    pub event_name: String,
    /// JSON-serialized event arguments.
    pub event_args: Vec<String>,
}

struct MethodHandler {
    fn_ptr: rhai::FnPtr,
    min_permission_level: PermissionLevel,
}

#[derive(Default)]
struct RpcRegistry {
    methods: HashMap<String, MethodHandler>,
    listeners: HashMap<String, Vec<rhai::FnPtr>>,
}

/// Result of one client invocation.
#[derive(Debug)]
pub enum InvocationResult {
    /// The handler returned a plain value, JSON-serialized.
    Sync(String),
    /// The handler returned a deferred; its settlement arrives on the
    /// channel as `{rejected, value}`.
    Deferred(oneshot::Receiver<DeferredOutcome>),
    /// The handler (or the dispatch itself) raised; JSON-serialized value.
    Error(String),
}

pub struct RpcModule {
    registry: Arc<Mutex<RpcRegistry>>,
    deferreds: Arc<Mutex<DeferredRegistry>>,
    on_global_event: Event<ClientEventData>,
    on_page_event: Keyed<String, ClientEventData>,
    on_user_event: Keyed<String, ClientEventData>,
    on_page_user_event: Keyed<(String, String), ClientEventData>,
}

impl RpcModule {
    pub fn new(deferreds: Arc<Mutex<DeferredRegistry>>) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(Mutex::new(RpcRegistry::default())),
            deferreds,
            on_global_event: Event::new(),
            on_page_event: Keyed::new(),
            on_user_event: Keyed::new(),
            on_page_user_event: Keyed::new(),
        })
    }

    pub fn global_event_emitted(&self) -> &Event<ClientEventData> {
        &self.on_global_event
    }

    pub fn page_event_emitted(&self) -> &Keyed<String, ClientEventData> {
        &self.on_page_event
    }

    pub fn user_event_emitted(&self) -> &Keyed<String, ClientEventData> {
        &self.on_user_event
    }

    pub fn page_user_event_emitted(&self) -> &Keyed<(String, String), ClientEventData> {
        &self.on_page_user_event
    }

    /// Dispatch a client invocation. Must run on the script loop.
    pub fn dispatch_invocation(
        &self,
        state: &mut VmState,
        user: Option<&User>,
        page_id: &str,
        method: &str,
        args: &[String],
    ) -> InvocationResult {
        let (fn_ptr, min_level) = {
            let registry = self.registry.lock().expect("rpc registry poisoned");
            match registry.methods.get(method) {
                Some(handler) => (handler.fn_ptr.clone(), handler.min_permission_level),
                None => return InvocationResult::Error(json_string("Unknown method")),
            }
        };

        let level = user.map_or(PermissionLevel::Unauthenticated, User::permission_level);
        if level < min_level {
            return InvocationResult::Error(json_string("Insufficient permissions"));
        }

        let Some(ast) = state.main_ast.clone() else {
            return InvocationResult::Error(json_string("Application not initialized"));
        };

        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(rhai::Dynamic::from(invocation_context(user, page_id, false)));
        for arg in args {
            match json_to_dynamic(arg) {
                Ok(value) => call_args.push(value),
                Err(e) => return InvocationResult::Error(json_string(&e)),
            }
        }

        match fn_ptr.call::<rhai::Dynamic>(&state.engine, &ast, call_args) {
            Ok(value) => {
                if let Some(id) = deferred_id(&value) {
                    match self
                        .deferreds
                        .lock()
                        .expect("deferred registry poisoned")
                        .attach(id)
                    {
                        Some(rx) => InvocationResult::Deferred(rx),
                        None => {
                            InvocationResult::Error(json_string("Deferred already awaited"))
                        }
                    }
                } else {
                    InvocationResult::Sync(dynamic_to_json(&value))
                }
            }
            Err(e) => InvocationResult::Error(error_to_json(&e)),
        }
    }

    /// Dispatch a client event to the registered listeners. Must run on the
    /// script loop. Listener errors are logged, never propagated.
    pub fn dispatch_event(
        &self,
        state: &mut VmState,
        user: Option<&User>,
        trusted: bool,
        page_id: &str,
        event: &str,
        args: &[String],
    ) {
        let listeners: Vec<rhai::FnPtr> = {
            let registry = self.registry.lock().expect("rpc registry poisoned");
            registry.listeners.get(event).cloned().unwrap_or_default()
        };
        let Some(ast) = state.main_ast.clone() else {
            return;
        };

        for listener in listeners {
            let mut call_args = Vec::with_capacity(args.len() + 1);
            call_args.push(rhai::Dynamic::from(invocation_context(user, page_id, trusted)));
            let mut decode_failed = false;
            for arg in args {
                match json_to_dynamic(arg) {
                    Ok(value) => call_args.push(value),
                    Err(_) => {
                        decode_failed = true;
                        break;
                    }
                }
            }
            if decode_failed {
                continue;
            }
            if let Err(e) = listener.call::<rhai::Dynamic>(&state.engine, &ast, call_args) {
                state
                    .logger
                    .error(format!("error in event listener for {event}: {e}"));
            }
        }
    }
}

impl NativeModule for RpcModule {
    fn name(&self) -> &'static str {
        "rpc"
    }

    fn build(&self) -> rhai::Module {
        let mut module = rhai::Module::new();

        let registry = Arc::clone(&self.registry);
        module.set_native_fn(
            "register_method",
            move |method: &str, min_permission_level: &str, callback: rhai::FnPtr| {
                if method.is_empty() {
                    return Err(script_error("Missing argument"));
                }
                let min_permission_level = PermissionLevel::parse(min_permission_level)
                    .map_err(|_| {
                        script_error("Invalid permission level specified as second argument")
                    })?;
                registry.lock().expect("rpc registry poisoned").methods.insert(
                    method.to_string(),
                    MethodHandler {
                        fn_ptr: callback,
                        min_permission_level,
                    },
                );
                Ok(())
            },
        );

        let registry = Arc::clone(&self.registry);
        module.set_native_fn("unregister_method", move |method: &str| -> RhaiResult<()> {
            registry
                .lock()
                .expect("rpc registry poisoned")
                .methods
                .remove(method);
            Ok(())
        });

        let registry = Arc::clone(&self.registry);
        module.set_native_fn(
            "add_event_listener",
            move |event: &str, callback: rhai::FnPtr| -> RhaiResult<()> {
                registry
                    .lock()
                    .expect("rpc registry poisoned")
                    .listeners
                    .entry(event.to_string())
                    .or_default()
                    .push(callback);
                Ok(())
            },
        );

        let registry = Arc::clone(&self.registry);
        module.set_native_fn(
            "remove_event_listener",
            move |event: &str, callback: rhai::FnPtr| -> RhaiResult<()> {
                if let Some(listeners) = registry
                    .lock()
                    .expect("rpc registry poisoned")
                    .listeners
                    .get_mut(event)
                {
                    if let Some(index) = listeners
                        .iter()
                        .position(|l| l.fn_name() == callback.fn_name())
                    {
                        listeners.remove(index);
                    }
                }
                Ok(())
            },
        );

        self.register_emitters(&mut module);
        self.register_deferred_fns(&mut module);

        module
    }
}

impl RpcModule {
    fn register_emitters(&self, module: &mut rhai::Module) {
        self.register_emit_to_all(module);
        self.register_emit_to_page(module);
        self.register_emit_to_user(module);
        self.register_emit_to_page_user(module);
    }

    fn register_emit_to_all(&self, module: &mut rhai::Module) {
        for arity in 0..=3usize {
            let event = self.on_global_event.clone();
            match arity {
                0 => {
                    module.set_native_fn("emit_to_all", move |name: &str| -> RhaiResult<()> {
                        event.notify(event_data(name, &[]));
                        Ok(())
                    });
                }
                1 => {
                    module.set_native_fn("emit_to_all", move |name: &str, a: rhai::Dynamic| -> RhaiResult<()> {
                        event.notify(event_data(name, &[a]));
                        Ok(())
                    });
                }
                2 => {
                    module.set_native_fn(
                        "emit_to_all",
                        move |name: &str, a: rhai::Dynamic, b: rhai::Dynamic| -> RhaiResult<()> {
                            event.notify(event_data(name, &[a, b]));
                            Ok(())
                        },
                    );
                }
                _ => {
                    module.set_native_fn(
                        "emit_to_all",
                        move |name: &str, a: rhai::Dynamic, b: rhai::Dynamic, c: rhai::Dynamic| -> RhaiResult<()> {
                            event.notify(event_data(name, &[a, b, c]));
                            Ok(())
                        },
                    );
                }
            }
        }
    }

    fn register_emit_to_page(&self, module: &mut rhai::Module) {
        for arity in 0..=2usize {
            let event = self.on_page_event.clone();
            match arity {
                0 => {
                    module.set_native_fn("emit_to_page", move |page: &str, name: &str| -> RhaiResult<()> {
                        event.notify(&page.to_string(), event_data(name, &[]));
                        Ok(())
                    });
                }
                1 => {
                    module.set_native_fn(
                        "emit_to_page",
                        move |page: &str, name: &str, a: rhai::Dynamic| -> RhaiResult<()> {
                            event.notify(&page.to_string(), event_data(name, &[a]));
                            Ok(())
                        },
                    );
                }
                _ => {
                    module.set_native_fn(
                        "emit_to_page",
                        move |page: &str, name: &str, a: rhai::Dynamic, b: rhai::Dynamic| -> RhaiResult<()> {
                            event.notify(&page.to_string(), event_data(name, &[a, b]));
                            Ok(())
                        },
                    );
                }
            }
        }
    }

    fn register_emit_to_user(&self, module: &mut rhai::Module) {
        for arity in 0..=2usize {
            let event = self.on_user_event.clone();
            match arity {
                0 => {
                    module.set_native_fn("emit_to_user", move |user: rhai::Dynamic, name: &str| -> RhaiResult<()> {
                        event.notify(&user_key(&user), event_data(name, &[]));
                        Ok(())
                    });
                }
                1 => {
                    module.set_native_fn(
                        "emit_to_user",
                        move |user: rhai::Dynamic, name: &str, a: rhai::Dynamic| -> RhaiResult<()> {
                            event.notify(&user_key(&user), event_data(name, &[a]));
                            Ok(())
                        },
                    );
                }
                _ => {
                    module.set_native_fn(
                        "emit_to_user",
                        move |user: rhai::Dynamic, name: &str, a: rhai::Dynamic, b: rhai::Dynamic| -> RhaiResult<()> {
                            event.notify(&user_key(&user), event_data(name, &[a, b]));
                            Ok(())
                        },
                    );
                }
            }
        }
    }

    fn register_emit_to_page_user(&self, module: &mut rhai::Module) {
        for arity in 0..=1usize {
            let event = self.on_page_user_event.clone();
            match arity {
                0 => {
                    module.set_native_fn(
                        "emit_to_page_user",
                        move |page: &str, user: rhai::Dynamic, name: &str| -> RhaiResult<()> {
                            event.notify(&(page.to_string(), user_key(&user)), event_data(name, &[]));
                            Ok(())
                        },
                    );
                }
                _ => {
                    module.set_native_fn(
                        "emit_to_page_user",
                        move |page: &str, user: rhai::Dynamic, name: &str, a: rhai::Dynamic| -> RhaiResult<()> {
                            event.notify(
                                &(page.to_string(), user_key(&user)),
                                event_data(name, &[a]),
                            );
                            Ok(())
                        },
                    );
                }
            }
        }
    }

    fn register_deferred_fns(&self, module: &mut rhai::Module) {
        let deferreds = Arc::clone(&self.deferreds);
        module.set_native_fn("deferred", move || -> RhaiResult<rhai::Map> {
            let id = deferreds
                .lock()
                .expect("deferred registry poisoned")
                .create();
            let mut map = rhai::Map::new();
            map.insert(DEFERRED_KEY.into(), rhai::Dynamic::from(id));
            Ok(map)
        });

        let deferreds = Arc::clone(&self.deferreds);
        module.set_native_fn(
            "resolve",
            move |handle: rhai::Map, value: rhai::Dynamic| {
                settle(&deferreds, &handle, false, &value)
            },
        );

        let deferreds = Arc::clone(&self.deferreds);
        module.set_native_fn(
            "reject",
            move |handle: rhai::Map, value: rhai::Dynamic| settle(&deferreds, &handle, true, &value),
        );
    }
}

fn settle(
    deferreds: &Arc<Mutex<DeferredRegistry>>,
    handle: &rhai::Map,
    rejected: bool,
    value: &rhai::Dynamic,
) -> Result<(), Box<rhai::EvalAltResult>> {
    let id = handle
        .get(DEFERRED_KEY)
        .and_then(|v| v.as_int().ok())
        .ok_or_else(|| script_error("First argument must be a deferred handle"))?;
    let settled = deferreds
        .lock()
        .expect("deferred registry poisoned")
        .settle(id, rejected, dynamic_to_json(value));
    if !settled {
        return Err(script_error("Deferred already settled"));
    }
    Ok(())
}

fn deferred_id(value: &rhai::Dynamic) -> Option<i64> {
    let map = value.read_lock::<rhai::Map>()?;
    map.get(DEFERRED_KEY).and_then(|v| v.as_int().ok())
}

fn user_key(user: &rhai::Dynamic) -> String {
    // unit/empty targets unauthenticated users
    if user.is_unit() {
        return String::new();
    }
    user.to_string()
}

fn event_data(name: &str, args: &[rhai::Dynamic]) -> ClientEventData {
    ClientEventData {
        event_name: name.to_string(),
        event_args: args.iter().map(dynamic_to_json).collect(),
    }
}

fn invocation_context(user: Option<&User>, page_id: &str, trusted: bool) -> rhai::Map {
    let mut sender = rhai::Map::new();
    if let Some(user) = user {
        sender.insert(
            "address".into(),
            rhai::Dynamic::from(user.address().to_string()),
        );
        if let Some(nickname) = user.nickname() {
            sender.insert("nickname".into(), rhai::Dynamic::from(nickname.to_string()));
        }
        sender.insert(
            "permission_level".into(),
            rhai::Dynamic::from(user.permission_level().as_str().to_string()),
        );
    }
    let mut context = rhai::Map::new();
    context.insert("page".into(), rhai::Dynamic::from(page_id.to_string()));
    context.insert(
        "sender".into(),
        if user.is_some() {
            rhai::Dynamic::from(sender)
        } else {
            rhai::Dynamic::UNIT
        },
    );
    context.insert("trusted".into(), rhai::Dynamic::from(trusted));
    context
}

/// JSON-serialize a script value; non-JSON values fall back to their display
/// form as a JSON string.
pub(crate) fn dynamic_to_json(value: &rhai::Dynamic) -> String {
    match rhai::serde::from_dynamic::<serde_json::Value>(value) {
        Ok(json) => json.to_string(),
        Err(_) => serde_json::Value::String(value.to_string()).to_string(),
    }
}

/// Decode a JSON argument into a script value, dropping `__proto__` keys
/// anywhere in the tree.
pub(crate) fn json_to_dynamic(json: &str) -> Result<rhai::Dynamic, String> {
    let mut value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("Invalid argument: {e}"))?;
    strip_proto(&mut value);
    rhai::serde::to_dynamic(value).map_err(|e| e.to_string())
}

fn strip_proto(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.remove("__proto__");
            for (_, v) in map.iter_mut() {
                strip_proto(v);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                strip_proto(item);
            }
        }
        _ => {}
    }
}

fn error_to_json(error: &rhai::EvalAltResult) -> String {
    if let rhai::EvalAltResult::ErrorRuntime(value, _) = error {
        return dynamic_to_json(value);
    }
    json_string(&error.to_string())
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_keys_are_stripped() {
        let value = json_to_dynamic(r#"{"a": 1, "__proto__": {"polluted": true}, "b": {"__proto__": 2}}"#)
            .unwrap();
        let map = value.read_lock::<rhai::Map>().unwrap();
        assert!(map.contains_key("a"));
        assert!(!map.contains_key("__proto__"));
        let b = map.get("b").unwrap().read_lock::<rhai::Map>().unwrap();
        assert!(b.is_empty());
    }

    #[test]
    fn json_round_trip_of_dynamics() {
        let value = json_to_dynamic(r#"{"code": 1}"#).unwrap();
        assert_eq!(dynamic_to_json(&value), r#"{"code":1}"#);
    }
}
