//! Application sandbox integration tests.

use std::sync::Arc;
use std::time::Duration;

use marquee_core::config::SandboxConfig;
use marquee_core::shutdown::{ShutdownController, ShutdownToken};
use marquee_core::user::User;

use marquee_daemon::apprunner::{
    AppLogLevel, AppRunner, AppRunnerError, InvocationResult, ModuleDependencies,
};
use marquee_daemon::chat::ChatManager;
use marquee_daemon::configuration::ConfigurationManager;
use marquee_daemon::moderation::InMemoryModerationStore;
use marquee_daemon::points::PointsManager;
use marquee_daemon::storage::Database;

const SCRIPT_MIME: &str = "text/x-rhai";

struct Harness {
    runner: Arc<AppRunner>,
    db: Database,
    points: Arc<PointsManager>,
    chat: Arc<ChatManager>,
    _controller: ShutdownController,
}

async fn harness(sandbox_config: SandboxConfig) -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let points = PointsManager::new(db.clone());
    let moderation = InMemoryModerationStore::new();
    let chat = ChatManager::new(moderation);
    let configuration = ConfigurationManager::new();
    let controller = ShutdownController::new();

    let runner = AppRunner::new(
        controller.token(),
        sandbox_config,
        ModuleDependencies {
            db: db.clone(),
            points: Arc::clone(&points),
            chat: Arc::clone(&chat),
            configuration,
            runtime: tokio::runtime::Handle::current(),
        },
    );
    Harness {
        runner,
        db,
        points,
        chat,
        _controller: controller,
    }
}

async fn seed_application(db: &Database, id: &str, main_script: &str) {
    let app = db.upsert_application(id, true, false).await.unwrap();
    db.put_application_file(
        id,
        app.updated_at,
        "main.rhai",
        SCRIPT_MIME,
        false,
        main_script.as_bytes(),
    )
    .await
    .unwrap();
}

async fn wait_for<F, Fut>(mut condition: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn valid_address() -> String {
    format!("ban_{}", "1".repeat(60))
}

#[tokio::test]
async fn main_script_runs_and_its_effects_are_visible() {
    let h = harness(SandboxConfig::default()).await;
    seed_application(
        &h.db,
        "greeter",
        r#"keyvalue::set_item("started", "yes"); print("hello from the script");"#,
    )
    .await;

    h.runner.launch_application("greeter").await.unwrap();

    let db = h.db.clone();
    wait_for(
        move || {
            let db = db.clone();
            async move {
                db.kv_get("greeter", "started").await.unwrap() == Some("yes".to_string())
            }
        },
        Duration::from_secs(5),
    )
    .await;

    let log = h.runner.application_log("greeter").await.unwrap();
    assert!(log.contains(AppLogLevel::Log, "hello from the script"));
}

#[tokio::test]
async fn watchdog_terminates_a_stuck_event_loop() {
    let h = harness(SandboxConfig {
        event_loop_stuck_tolerance_secs: 1,
        ..SandboxConfig::default()
    })
    .await;
    seed_application(&h.db, "spinner", "loop { }").await;

    h.runner.launch_application("spinner").await.unwrap();

    let runner = Arc::clone(&h.runner);
    wait_for(
        move || {
            let runner = Arc::clone(&runner);
            async move { runner.is_running("spinner").await.is_none() }
        },
        Duration::from_secs(10),
    )
    .await;

    let log = h.runner.application_log("spinner").await.unwrap();
    assert!(log.contains(AppLogLevel::RuntimeError, "event loop stuck"));
}

#[tokio::test]
async fn terminated_instances_accept_no_further_work() {
    let h = harness(SandboxConfig::default()).await;
    seed_application(
        &h.db,
        "app",
        r#"rpc::register_method("ping", "unauthenticated", |ctx| "pong");"#,
    )
    .await;

    h.runner.launch_application("app").await.unwrap();
    let instance = h.runner.get_instance("app").await.unwrap();

    // reachable before termination
    let runner = Arc::clone(&h.runner);
    wait_for(
        move || {
            let runner = Arc::clone(&runner);
            async move {
                let instance = runner.get_instance("app").await.unwrap();
                matches!(
                    instance
                        .invoke_rpc_method(None, String::new(), "ping".into(), Vec::new())
                        .await,
                    Ok(InvocationResult::Sync(_))
                )
            }
        },
        Duration::from_secs(5),
    )
    .await;

    instance.terminate(true, Duration::ZERO, true).await.unwrap();
    let (running, _) = instance.running().await;
    assert!(!running);

    let result = instance
        .invoke_rpc_method(None, String::new(), "ping".into(), Vec::new())
        .await;
    assert!(matches!(
        result,
        Err(AppRunnerError::InstanceNotRunning | AppRunnerError::InstanceTerminated)
    ));

    // terminated is terminal
    let err = instance
        .start_or_resume(&ShutdownToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, AppRunnerError::InstanceTerminated));
}

#[tokio::test]
async fn rpc_sync_invocation_returns_json() {
    let h = harness(SandboxConfig::default()).await;
    seed_application(
        &h.db,
        "app",
        r#"rpc::register_method("greet", "unauthenticated", |ctx, name| "hello " + name);"#,
    )
    .await;
    h.runner.launch_application("app").await.unwrap();
    let instance = h.runner.get_instance("app").await.unwrap();

    let runner = Arc::clone(&h.runner);
    wait_for(
        move || {
            let runner = Arc::clone(&runner);
            async move {
                let instance = runner.get_instance("app").await.unwrap();
                !matches!(
                    instance
                        .invoke_rpc_method(
                            None,
                            String::new(),
                            "greet".into(),
                            vec!["\"world\"".to_string()],
                        )
                        .await,
                    Ok(InvocationResult::Error(_))
                )
            }
        },
        Duration::from_secs(5),
    )
    .await;

    let result = instance
        .invoke_rpc_method(
            None,
            String::new(),
            "greet".into(),
            vec!["\"world\"".to_string()],
        )
        .await
        .unwrap();
    let InvocationResult::Sync(json) = result else {
        panic!("expected a synchronous result");
    };
    assert_eq!(json, "\"hello world\"");

    // unknown methods fail with a serialized error value
    let result = instance
        .invoke_rpc_method(None, String::new(), "missing".into(), Vec::new())
        .await
        .unwrap();
    let InvocationResult::Error(json) = result else {
        panic!("expected an error");
    };
    assert_eq!(json, "\"Unknown method\"");
}

#[tokio::test]
async fn rpc_deferred_rejection_reaches_the_client_without_uncaught_log() {
    let h = harness(SandboxConfig::default()).await;
    seed_application(
        &h.db,
        "app",
        r#"
        rpc::register_method("m", "unauthenticated", |ctx| {
            let d = rpc::deferred();
            rpc::reject(d, #{code: 1});
            d
        });
        "#,
    )
    .await;
    h.runner.launch_application("app").await.unwrap();
    let instance = h.runner.get_instance("app").await.unwrap();

    let runner = Arc::clone(&h.runner);
    wait_for(
        move || {
            let runner = Arc::clone(&runner);
            async move {
                let instance = runner.get_instance("app").await.unwrap();
                !matches!(
                    instance
                        .invoke_rpc_method(None, String::new(), "m".into(), Vec::new())
                        .await,
                    Ok(InvocationResult::Error(_))
                )
            }
        },
        Duration::from_secs(5),
    )
    .await;

    let result = instance
        .invoke_rpc_method(None, String::new(), "m".into(), Vec::new())
        .await
        .unwrap();
    let InvocationResult::Deferred(rx) = result else {
        panic!("expected a deferred result");
    };
    let outcome = rx.await.unwrap();
    assert!(outcome.rejected);
    assert_eq!(outcome.value, "{\"code\":1}");

    // observed rejections are never reported as uncaught
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let log = h.runner.application_log("app").await.unwrap();
    assert!(!log.contains(AppLogLevel::RuntimeError, "Uncaught"));
}

#[tokio::test]
async fn unobserved_deferred_rejection_is_logged_by_the_watchdog() {
    let h = harness(SandboxConfig::default()).await;
    seed_application(
        &h.db,
        "app",
        r#"
        let d = rpc::deferred();
        rpc::reject(d, "nobody is listening");
        "#,
    )
    .await;
    h.runner.launch_application("app").await.unwrap();

    let runner = Arc::clone(&h.runner);
    wait_for(
        move || {
            let runner = Arc::clone(&runner);
            async move {
                runner
                    .application_log("app")
                    .await
                    .unwrap()
                    .contains(AppLogLevel::RuntimeError, "Uncaught (in deferred)")
            }
        },
        Duration::from_secs(5),
    )
    .await;
}

#[tokio::test]
async fn points_module_validates_and_transacts() {
    let h = harness(SandboxConfig::default()).await;
    let address = valid_address();
    seed_application(
        &h.db,
        "app",
        &format!(
            r#"
            rpc::register_method("grant", "unauthenticated", |ctx| {{
                let tx = points::create_transaction("{address}", "gift", 5);
                tx.value
            }});
            rpc::register_method("bad", "unauthenticated", |ctx| {{
                points::create_transaction("not-an-address", "gift", 5)
            }});
            "#
        ),
    )
    .await;
    h.runner.launch_application("app").await.unwrap();
    let instance = h.runner.get_instance("app").await.unwrap();

    let runner = Arc::clone(&h.runner);
    wait_for(
        move || {
            let runner = Arc::clone(&runner);
            async move {
                let instance = runner.get_instance("app").await.unwrap();
                !matches!(
                    instance
                        .invoke_rpc_method(None, String::new(), "grant".into(), Vec::new())
                        .await,
                    Ok(InvocationResult::Error(_))
                )
            }
        },
        Duration::from_secs(5),
    )
    .await;

    let result = instance
        .invoke_rpc_method(None, String::new(), "grant".into(), Vec::new())
        .await
        .unwrap();
    let InvocationResult::Sync(json) = result else {
        panic!("expected a synchronous result");
    };
    assert_eq!(json, "5");
    assert_eq!(h.points.balance(&address).await.unwrap(), 5);

    let result = instance
        .invoke_rpc_method(None, String::new(), "bad".into(), Vec::new())
        .await
        .unwrap();
    let InvocationResult::Error(json) = result else {
        panic!("expected an error");
    };
    assert!(json.contains("Invalid user address"));
}

#[tokio::test]
async fn pause_and_resume_picks_up_where_it_left_off() {
    let h = harness(SandboxConfig::default()).await;
    seed_application(
        &h.db,
        "app",
        r#"rpc::register_method("ping", "unauthenticated", |ctx| "pong");"#,
    )
    .await;
    h.runner.launch_application("app").await.unwrap();
    let instance = h.runner.get_instance("app").await.unwrap();

    let runner = Arc::clone(&h.runner);
    wait_for(
        move || {
            let runner = Arc::clone(&runner);
            async move {
                let instance = runner.get_instance("app").await.unwrap();
                matches!(
                    instance
                        .invoke_rpc_method(None, String::new(), "ping".into(), Vec::new())
                        .await,
                    Ok(InvocationResult::Sync(_))
                )
            }
        },
        Duration::from_secs(5),
    )
    .await;

    instance.pause(false, Duration::ZERO, true).await.unwrap();
    let err = instance
        .invoke_rpc_method(None, String::new(), "ping".into(), Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppRunnerError::InstanceNotRunning));

    // double pause is an error
    let err = instance.pause(false, Duration::ZERO, true).await.unwrap_err();
    assert!(matches!(err, AppRunnerError::InstanceAlreadyPaused));

    instance
        .start_or_resume(&ShutdownToken::never())
        .await
        .unwrap();
    let result = instance
        .invoke_rpc_method(None, String::new(), "ping".into(), Vec::new())
        .await
        .unwrap();
    assert!(matches!(result, InvocationResult::Sync(_)));
}

#[tokio::test]
async fn expression_evaluation_reports_results_and_errors() {
    let h = harness(SandboxConfig::default()).await;
    seed_application(&h.db, "app", "let counter = 41;").await;
    h.runner.launch_application("app").await.unwrap();

    let runner = Arc::clone(&h.runner);
    wait_for(
        move || {
            let runner = Arc::clone(&runner);
            async move {
                matches!(
                    runner
                        .evaluate_expression_on_application("app", "counter + 1")
                        .await,
                    Ok((true, ref v, _)) if v == "42"
                )
            }
        },
        Duration::from_secs(5),
    )
    .await;

    let (successful, message, _) = h
        .runner
        .evaluate_expression_on_application("app", "undefined_variable")
        .await
        .unwrap();
    assert!(!successful);
    assert!(!message.is_empty());
}

#[tokio::test]
async fn chat_event_listeners_fire_on_the_loop() {
    let h = harness(SandboxConfig::default()).await;
    seed_application(
        &h.db,
        "app",
        r#"
        chat::add_event_listener("messagecreated", |msg| {
            keyvalue::set_item("last_message", msg.content);
        });
        "#,
    )
    .await;
    h.runner.launch_application("app").await.unwrap();

    // keep sending until a message is observed by the listener; the first
    // ones may precede the listener registration
    let chat = Arc::clone(&h.chat);
    let db = h.db.clone();
    wait_for(
        move || {
            let chat = Arc::clone(&chat);
            let db = db.clone();
            async move {
                let _ = chat
                    .create_message(
                        User::address_only(valid_address()),
                        "a chat message".into(),
                        None,
                        Vec::new(),
                    )
                    .await;
                db.kv_get("app", "last_message").await.unwrap()
                    == Some("a chat message".to_string())
            }
        },
        Duration::from_secs(5),
    )
    .await;
}
