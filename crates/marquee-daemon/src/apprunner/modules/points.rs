//! `points` module: ledger access for applications.
//!
//! Transactions created here are application-defined and tagged with the
//! application id and version.

use std::sync::Arc;

use marquee_core::shutdown::ShutdownToken;
use marquee_core::user::{is_valid_reward_address, User};

use crate::points::{tx_extra, PointsError, TransactionUpdatedEventArgs};
use crate::storage::{PointsTxRow, PointsTxType};

use super::adapter::{adapt_event, EventAdapter};
use super::super::vm::LoopScheduler;
use super::{script_error, ApplicationContext, ModuleDependencies, NativeModule, RhaiResult};

pub struct PointsModule {
    context: Arc<dyn ApplicationContext>,
    deps: ModuleDependencies,
    adapter: Arc<EventAdapter>,
}

impl PointsModule {
    pub fn new(
        context: Arc<dyn ApplicationContext>,
        deps: ModuleDependencies,
        scheduler: LoopScheduler,
    ) -> Arc<Self> {
        let adapter = EventAdapter::new(scheduler);
        adapt_event(
            &adapter,
            deps.points.on_transaction_created(),
            "transactioncreated",
            |tx: &PointsTxRow| rhai::Dynamic::from(serialize_transaction(tx)),
        );
        adapt_event(
            &adapter,
            deps.points.on_transaction_updated(),
            "transactionupdated",
            |args: &TransactionUpdatedEventArgs| {
                let mut map = serialize_transaction(&args.transaction);
                map.insert(
                    "adjustment_value".into(),
                    rhai::Dynamic::from(args.adjustment_value),
                );
                rhai::Dynamic::from(map)
            },
        );
        Arc::new(Self {
            context,
            deps,
            adapter,
        })
    }
}

fn serialize_transaction(tx: &PointsTxRow) -> rhai::Map {
    let mut map = rhai::Map::new();
    // script integers are not wide enough for ledger ids in all embeddings,
    // so ids travel as strings
    map.insert("id".into(), rhai::Dynamic::from(tx.id.to_string()));
    map.insert(
        "address".into(),
        rhai::Dynamic::from(tx.rewards_address.clone()),
    );
    map.insert("created_at".into(), rhai::Dynamic::from(tx.created_at));
    map.insert("updated_at".into(), rhai::Dynamic::from(tx.updated_at));
    map.insert("value".into(), rhai::Dynamic::from(tx.value));
    map.insert(
        "transaction_type".into(),
        rhai::Dynamic::from(tx.tx_type.clone()),
    );
    let extra: rhai::Dynamic = serde_json::from_str::<serde_json::Value>(&tx.extra)
        .ok()
        .and_then(|v| rhai::serde::to_dynamic(v).ok())
        .unwrap_or(rhai::Dynamic::UNIT);
    map.insert("extra".into(), extra);
    map
}

impl NativeModule for PointsModule {
    fn name(&self) -> &'static str {
        "points"
    }

    fn build(&self) -> rhai::Module {
        let mut module = rhai::Module::new();

        let (ctx, deps) = (Arc::clone(&self.context), self.deps.clone());
        module.set_native_fn(
            "create_transaction",
            move |address: &str, description: &str, value: i64| {
                if !is_valid_reward_address(address) {
                    return Err(script_error("Invalid user address"));
                }
                if value == 0 {
                    return Err(script_error(
                        "Third argument to create_transaction must be a non-zero integer",
                    ));
                }
                let user = User::address_only(address);
                let extra = tx_extra([
                    ("application_id", serde_json::json!(ctx.application_id())),
                    (
                        "application_version",
                        serde_json::json!(ctx.application_version()),
                    ),
                    ("description", serde_json::json!(description)),
                ]);
                let result = deps.runtime.block_on(deps.points.create_transaction(
                    &user,
                    PointsTxType::ApplicationDefined,
                    value,
                    extra,
                ));
                match result {
                    Ok(tx) => Ok(serialize_transaction(&tx)),
                    Err(PointsError::InsufficientBalance) => {
                        Err(script_error("Insufficient points balance"))
                    }
                    Err(e) => Err(script_error(e.to_string())),
                }
            },
        );

        let deps = self.deps.clone();
        module.set_native_fn("get_balance", move |address: &str| {
            if !is_valid_reward_address(address) {
                return Err(script_error("Invalid user address"));
            }
            deps.runtime
                .block_on(deps.points.balance(address))
                .map_err(|e| script_error(e.to_string()))
        });

        let adapter = Arc::clone(&self.adapter);
        module.set_native_fn(
            "add_event_listener",
            move |event: &str, listener: rhai::FnPtr| -> RhaiResult<()> {
                adapter.add_listener(event, listener);
                Ok(())
            },
        );

        let adapter = Arc::clone(&self.adapter);
        module.set_native_fn(
            "remove_event_listener",
            move |event: &str, listener: rhai::FnPtr| -> RhaiResult<()> {
                adapter.remove_listener(event, &listener);
                Ok(())
            },
        );

        module
    }

    fn execution_resumed(&self, _execution: &ShutdownToken) {
        self.adapter.start_or_resume();
    }

    fn execution_paused(&self) {
        self.adapter.pause();
    }
}
