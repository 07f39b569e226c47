use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

use notifyd::config::AppConfig;
use notifyd::logging::{LoggingHandle, init_logging};
use notifyd::{DeploymentMode, EmitOptions, ServiceContainer};

/// Upper bound on waiting for queued work after stdin closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// One line of input.
#[derive(Debug, Deserialize)]
struct EmitRequest {
    event_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    options: EmitOptions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let app = AppConfig::from_env().context("Failed to load process configuration")?;
    let (logging, _guard) = init_logging(&app.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %app.mode,
        config = %app.config_path.display(),
        "Starting notifyd"
    );

    let dispatch = app.load_dispatch_config()?;
    let container = ServiceContainer::build(&app, dispatch)?;
    logging.start_retention_cleanup(container.cancellation_token());
    container.initialize()?;

    if container.mode() == DeploymentMode::Worker {
        info!("Worker mode, every emission goes through the queue");
    }

    tokio::select! {
        result = serve_stdin(&container, &logging) => {
            if let Err(e) = result {
                error!(error = %e, "Input loop failed");
            }
            drain(&container).await;
        }
        _ = shutdown_signal() => {}
    }

    container.shutdown().await;
    info!("notifyd shutdown complete");
    Ok(())
}

/// Read newline-delimited requests and print one JSON line per request.
///
/// A line carrying `log_filter` replaces the log filter; every other line is
/// an emission request.
async fn serve_stdin(container: &ServiceContainer, logging: &LoggingHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(fields)) if fields.contains_key("log_filter") => {
                set_log_filter(logging, fields.get("log_filter"))
            }
            Ok(value) => match serde_json::from_value::<EmitRequest>(value) {
                Ok(request) => emit(container, request).await?,
                Err(e) => json!({ "error": format!("invalid request: {e}") }),
            },
            Err(e) => json!({ "error": format!("invalid request: {e}") }),
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    debug!("Input closed");
    Ok(())
}

async fn emit(container: &ServiceContainer, request: EmitRequest) -> anyhow::Result<Value> {
    let response = match container
        .manager
        .emit(&request.event_type, request.payload, request.options)
        .await
    {
        Ok(emission) => serde_json::to_value(&emission)?,
        Err(e) => {
            warn!(event_type = %request.event_type, error = %e, "Emission rejected");
            json!({ "event_type": request.event_type, "error": e.to_string() })
        }
    };
    Ok(response)
}

fn set_log_filter(logging: &LoggingHandle, directive: Option<&Value>) -> Value {
    let Some(directive) = directive.and_then(Value::as_str) else {
        return json!({ "error": "log_filter must be a string" });
    };
    match logging.set_filter(directive) {
        Ok(()) => json!({ "log_filter": logging.get_filter() }),
        Err(e) => json!({ "log_filter": logging.get_filter(), "error": e.to_string() }),
    }
}

/// Give queued work a chance to finish before the queue closes.
async fn drain(container: &ServiceContainer) {
    let Some(queue) = container.manager.queue().cloned() else {
        return;
    };

    let wait = async {
        loop {
            let stats = queue.stats().await;
            if stats.waiting + stats.delayed + stats.active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    tokio::select! {
        _ = wait => debug!("Queue drained"),
        _ = tokio::time::sleep(DRAIN_TIMEOUT) => warn!("Queue not drained before timeout"),
        _ = shutdown_signal() => {}
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
