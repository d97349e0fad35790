//! `chat` module: lets applications post to chat as themselves and react to
//! new messages.

use std::sync::Arc;

use marquee_core::shutdown::ShutdownToken;
use marquee_core::user::User;

use super::adapter::{adapt_event, EventAdapter};
use super::super::vm::LoopScheduler;
use super::{script_error, ApplicationContext, ModuleDependencies, NativeModule, RhaiResult};

pub struct ChatModule {
    context: Arc<dyn ApplicationContext>,
    deps: ModuleDependencies,
    adapter: Arc<EventAdapter>,
}

impl ChatModule {
    pub fn new(
        context: Arc<dyn ApplicationContext>,
        deps: ModuleDependencies,
        scheduler: LoopScheduler,
    ) -> Arc<Self> {
        let adapter = EventAdapter::new(scheduler);
        adapt_event(
            &adapter,
            deps.chat.on_message_created(),
            "messagecreated",
            |message: &crate::chat::ChatMessage| rhai::Dynamic::from(serialize_message(message)),
        );
        Arc::new(Self {
            context,
            deps,
            adapter,
        })
    }
}

fn serialize_message(message: &crate::chat::ChatMessage) -> rhai::Map {
    let mut map = rhai::Map::new();
    map.insert("id".into(), rhai::Dynamic::from(message.id.clone()));
    map.insert(
        "content".into(),
        rhai::Dynamic::from(message.content.clone()),
    );
    map.insert(
        "created_at".into(),
        rhai::Dynamic::from(message.created_at),
    );
    map.insert(
        "shadowbanned".into(),
        rhai::Dynamic::from(message.shadowbanned),
    );
    match &message.author {
        Some(author) => {
            let mut author_map = rhai::Map::new();
            author_map.insert(
                "address".into(),
                rhai::Dynamic::from(author.address().to_string()),
            );
            if let Some(application_id) = author.application_id() {
                author_map.insert(
                    "application_id".into(),
                    rhai::Dynamic::from(application_id.to_string()),
                );
            }
            map.insert("author".into(), rhai::Dynamic::from(author_map));
        }
        None => {
            map.insert("author".into(), rhai::Dynamic::UNIT);
        }
    }
    map
}

impl NativeModule for ChatModule {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn build(&self) -> rhai::Module {
        let mut module = rhai::Module::new();

        let (ctx, deps) = (Arc::clone(&self.context), self.deps.clone());
        module.set_native_fn("create_message", move |content: &str| {
            if content.trim().is_empty() {
                return Err(script_error("Missing message content"));
            }
            let author = User::application(ctx.application_id(), String::new());
            let message = deps
                .runtime
                .block_on(deps.chat.create_message(
                    author,
                    content.to_string(),
                    None,
                    Vec::new(),
                ))
                .map_err(|e| script_error(e.to_string()))?;
            Ok(serialize_message(&message))
        });

        let deps = self.deps.clone();
        module.set_native_fn("create_system_message", move |content: &str| {
            if content.trim().is_empty() {
                return Err(script_error("Missing message content"));
            }
            let message = deps.chat.create_system_message(content);
            Ok(serialize_message(&message))
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
