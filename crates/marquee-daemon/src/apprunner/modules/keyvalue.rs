//! `keyvalue` module: a per-application string store, in the shape of web
//! storage.

use std::sync::Arc;

use super::{script_error, ModuleDependencies, NativeModule};

const MAX_KEY_LENGTH: usize = 2048;

pub struct KeyValueModule {
    application_id: String,
    deps: ModuleDependencies,
}

impl KeyValueModule {
    pub fn new(application_id: String, deps: ModuleDependencies) -> Arc<Self> {
        Arc::new(Self {
            application_id,
            deps,
        })
    }
}

impl NativeModule for KeyValueModule {
    fn name(&self) -> &'static str {
        "keyvalue"
    }

    fn build(&self) -> rhai::Module {
        let mut module = rhai::Module::new();

        let (app, deps) = (self.application_id.clone(), self.deps.clone());
        module.set_native_fn("get_item", move |key: &str| {
            let value = deps
                .runtime
                .block_on(deps.db.kv_get(&app, key))
                .map_err(|e| script_error(e.to_string()))?;
            Ok(match value {
                Some(value) => rhai::Dynamic::from(value),
                None => rhai::Dynamic::UNIT,
            })
        });

        let (app, deps) = (self.application_id.clone(), self.deps.clone());
        module.set_native_fn("set_item", move |key: &str, value: &str| {
            if key.len() > MAX_KEY_LENGTH {
                return Err(script_error("Key too long"));
            }
            deps.runtime
                .block_on(deps.db.kv_set(&app, key, value))
                .map_err(|e| script_error(e.to_string()))?;
            Ok(())
        });

        let (app, deps) = (self.application_id.clone(), self.deps.clone());
        module.set_native_fn("remove_item", move |key: &str| {
            deps.runtime
                .block_on(deps.db.kv_delete(&app, key))
                .map_err(|e| script_error(e.to_string()))?;
            Ok(())
        });

        let (app, deps) = (self.application_id.clone(), self.deps.clone());
        module.set_native_fn("clear", move || {
            deps.runtime
                .block_on(deps.db.kv_clear(&app))
                .map_err(|e| script_error(e.to_string()))?;
            Ok(())
        });

        let (app, deps) = (self.application_id.clone(), self.deps.clone());
        module.set_native_fn("keys", move || {
            let keys = deps
                .runtime
                .block_on(deps.db.kv_keys(&app))
                .map_err(|e| script_error(e.to_string()))?;
            Ok(keys
                .into_iter()
                .map(rhai::Dynamic::from)
                .collect::<rhai::Array>())
        });

        module
    }
}
