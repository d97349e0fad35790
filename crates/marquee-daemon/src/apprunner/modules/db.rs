//! `db` module: a per-application JSON document store.

use std::sync::Arc;

use super::{script_error, ModuleDependencies, NativeModule};

pub struct DbModule {
    application_id: String,
    deps: ModuleDependencies,
}

impl DbModule {
    pub fn new(application_id: String, deps: ModuleDependencies) -> Arc<Self> {
        Arc::new(Self {
            application_id,
            deps,
        })
    }
}

impl NativeModule for DbModule {
    fn name(&self) -> &'static str {
        "db"
    }

    fn build(&self) -> rhai::Module {
        let mut module = rhai::Module::new();

        let (app, deps) = (self.application_id.clone(), self.deps.clone());
        module.set_native_fn("put", move |id: &str, content: &str| {
            if id.is_empty() {
                return Err(script_error("Missing document id"));
            }
            if serde_json::from_str::<serde_json::Value>(content).is_err() {
                return Err(script_error("Document content must be valid JSON"));
            }
            deps.runtime
                .block_on(deps.db.put_document(&app, id, false, "json", content))
                .map_err(|e| script_error(e.to_string()))?;
            Ok(())
        });

        let (app, deps) = (self.application_id.clone(), self.deps.clone());
        module.set_native_fn("get", move |id: &str| {
            let document = deps
                .runtime
                .block_on(deps.db.document(&app, id))
                .map_err(|e| script_error(e.to_string()))?;
            Ok(match document {
                Some(document) => rhai::Dynamic::from(document.content),
                None => rhai::Dynamic::UNIT,
            })
        });

        let (app, deps) = (self.application_id.clone(), self.deps.clone());
        module.set_native_fn("delete", move |id: &str| {
            deps.runtime
                .block_on(deps.db.delete_document(&app, id))
                .map_err(|e| script_error(e.to_string()))?;
            Ok(())
        });

        let (app, deps) = (self.application_id.clone(), self.deps.clone());
        module.set_native_fn("list", move || {
            let ids = deps
                .runtime
                .block_on(deps.db.document_ids(&app))
                .map_err(|e| script_error(e.to_string()))?;
            Ok(ids
                .into_iter()
                .map(rhai::Dynamic::from)
                .collect::<rhai::Array>())
        });

        module
    }
}
