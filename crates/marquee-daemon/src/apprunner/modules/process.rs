//! `process` module: instance metadata and termination.

use std::sync::Arc;

use super::{ApplicationContext, NativeModule, RhaiResult};

pub struct ProcessModule {
    context: Arc<dyn ApplicationContext>,
}

impl ProcessModule {
    pub fn new(context: Arc<dyn ApplicationContext>) -> Arc<Self> {
        Arc::new(Self { context })
    }
}

impl NativeModule for ProcessModule {
    fn name(&self) -> &'static str {
        "process"
    }

    fn build(&self) -> rhai::Module {
        let mut module = rhai::Module::new();

        let ctx = Arc::clone(&self.context);
        module.set_native_fn("application_id", move || -> RhaiResult<String> {
            Ok(ctx.application_id())
        });

        let ctx = Arc::clone(&self.context);
        module.set_native_fn("application_version", move || -> RhaiResult<i64> {
            Ok(ctx.application_version())
        });

        let ctx = Arc::clone(&self.context);
        module.set_native_fn("runtime_version", move || -> RhaiResult<i64> {
            Ok(i64::from(ctx.runtime_version()))
        });

        let ctx = Arc::clone(&self.context);
        module.set_native_fn("abort", move || -> RhaiResult<()> {
            ctx.abort_process();
            Ok(())
        });

        let ctx = Arc::clone(&self.context);
        module.set_native_fn("exit", move |code: i64| -> RhaiResult<()> {
            ctx.exit_process(code as i32);
            Ok(())
        });

        module
    }
}
