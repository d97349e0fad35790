//! Application modules: the capability surfaces scripts can import.
//!
//! A module is registered before the script engine starts; its loader
//! populates a namespace the script imports by name. Modules never own the
//! instance; they see it only through the [`ApplicationContext`] capability.

pub mod adapter;
pub mod chat;
pub mod configuration;
pub mod db;
pub mod keyvalue;
pub mod pages;
pub mod points;
pub mod process;
pub mod rpc;

use std::sync::Arc;

use marquee_core::shutdown::ShutdownToken;

pub use pages::PageInfo;

/// Weak back-reference capability handed to modules instead of the instance.
pub trait ApplicationContext: Send + Sync {
    fn application_id(&self) -> String;
    fn application_version(&self) -> i64;
    fn runtime_version(&self) -> u32;
    fn abort_process(&self);
    fn exit_process(&self, code: i32);
    fn resolve_page(&self, page_id: &str) -> Option<PageInfo>;
}

/// Singleton dependencies injected into modules.
#[derive(Clone)]
pub struct ModuleDependencies {
    pub db: crate::storage::Database,
    pub points: Arc<crate::points::PointsManager>,
    pub chat: Arc<crate::chat::ChatManager>,
    pub configuration: Arc<crate::configuration::ConfigurationManager>,
    /// Handle for blocking on async work from the loop thread.
    pub runtime: tokio::runtime::Handle,
}

/// A host-provided module.
pub trait NativeModule: Send + Sync {
    /// The name scripts import this module by.
    fn name(&self) -> &'static str;

    /// Build the namespace of exported functions.
    fn build(&self) -> rhai::Module;

    /// Called when the instance (re)starts execution, with the execution
    /// context token.
    fn execution_resumed(&self, _execution: &ShutdownToken) {}

    /// Called when the instance pauses (including before termination).
    fn execution_paused(&self) {}
}

/// The modules of one application instance.
#[derive(Default)]
pub struct ModuleCollection {
    modules: Vec<Arc<dyn NativeModule>>,
}

impl ModuleCollection {
    pub fn register(&mut self, module: Arc<dyn NativeModule>) {
        self.modules.push(module);
    }

    /// Register every module's namespace on the engine.
    pub fn enable_modules(&self, engine: &mut rhai::Engine) {
        for module in &self.modules {
            engine.register_static_module(module.name(), rhai::Shared::new(module.build()));
        }
    }

    pub fn execution_resumed(&self, execution: &ShutdownToken) {
        for module in &self.modules {
            module.execution_resumed(execution);
        }
    }

    pub fn execution_paused(&self) {
        for module in &self.modules {
            module.execution_paused();
        }
    }
}

/// Result type of native module functions.
pub(crate) type RhaiResult<T> = Result<T, Box<rhai::EvalAltResult>>;

/// Shorthand for a script-visible runtime error.
pub(crate) fn script_error(message: impl Into<String>) -> Box<rhai::EvalAltResult> {
    Box::new(rhai::EvalAltResult::ErrorRuntime(
        rhai::Dynamic::from(message.into()),
        rhai::Position::NONE,
    ))
}
