use std::collections::HashMap;
use std::io::Write;

use serde_json::json;
use tempfile::NamedTempFile;

use notifyd::config::AppConfig;
use notifyd::execution::{DeploymentMode, DispatchPath, EmitOptions};
use notifyd::handlers::HandlerStatus;
use notifyd::notification::NotificationStatus;
use notifyd::{Error, ServiceContainer};

const DISPATCH: &str = r#"{
    "retry": { "initial_delay_ms": 1, "max_delay_ms": 5 },
    "events": {
        "user.created": { "channels": ["email"], "default_processing": "sync" },
        "report.ready": { "channels": ["email"], "wait_for_result": true, "timeout_ms": 2000 }
    },
    "providers": [ { "channel": "email", "kind": "log" } ],
    "recipients": [
        { "event_type": "*", "payload_pointer": "/user" }
    ],
    "audit_handler": true
}"#;

fn app_config(vars: &[(&str, &str)]) -> notifyd::Result<AppConfig> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    AppConfig::from_lookup(|key| vars.get(key).cloned())
}

fn dispatch_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(DISPATCH.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn container_from_config_file_delivers_events() {
    let file = dispatch_file();
    let path = file.path().to_string_lossy().to_string();
    let app = app_config(&[("NOTIFYD_CONFIG", path.as_str()), ("NOTIFYD_POLL_INTERVAL_MS", "5")]).unwrap();

    let container = ServiceContainer::build(&app, app.load_dispatch_config().unwrap()).unwrap();
    container.initialize().unwrap();

    let payload = json!({ "user": { "id": "u1", "addresses": { "email": "u1@example.com" } } });
    let emission = container
        .manager
        .emit("user.created", payload.clone(), EmitOptions::default())
        .await
        .unwrap();

    assert_eq!(emission.mode, DispatchPath::Immediate);
    let results = emission.results.unwrap();
    assert_eq!(results[0].status, NotificationStatus::Sent);
    assert_eq!(results[0].provider, "log");
    assert_eq!(emission.handler_results[0].handler, "audit");
    assert_eq!(emission.handler_results[0].status, HandlerStatus::Completed);

    let queued = container
        .manager
        .emit("report.ready", payload, EmitOptions::default())
        .await
        .unwrap();
    assert_eq!(queued.mode, DispatchPath::Queued);
    assert!(!queued.timed_out);
    assert_eq!(queued.results.unwrap()[0].status, NotificationStatus::Sent);

    container.shutdown().await;
}

#[tokio::test]
async fn recipients_without_address_are_skipped() {
    let file = dispatch_file();
    let path = file.path().to_string_lossy().to_string();
    let app = app_config(&[("NOTIFYD_CONFIG", path.as_str()), ("NOTIFYD_MODE", "api")]).unwrap();
    let container = ServiceContainer::build(&app, app.load_dispatch_config().unwrap()).unwrap();

    let emission = container
        .manager
        .emit(
            "user.created",
            json!({ "user": { "id": "u2" } }),
            EmitOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(emission.results.unwrap()[0].status, NotificationStatus::Skipped);
}

#[test]
fn explicit_missing_config_is_an_error() {
    let app = app_config(&[("NOTIFYD_CONFIG", "/nonexistent/notifyd.json")]).unwrap();
    let err = app.load_dispatch_config().unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn malformed_config_is_a_serialization_error() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"{ \"events\": [ }").unwrap();
    let path = file.path().to_string_lossy().to_string();
    let app = app_config(&[("NOTIFYD_CONFIG", path.as_str())]).unwrap();

    let err = app.load_dispatch_config().unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
}

#[test]
fn worker_mode_with_queue_disabled_is_rejected() {
    let err = app_config(&[("NOTIFYD_MODE", "worker"), ("NOTIFYD_QUEUE_ENABLED", "false")])
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    let app = app_config(&[("NOTIFYD_MODE", "WORKER")]).unwrap();
    assert_eq!(app.mode, DeploymentMode::Worker);
}
