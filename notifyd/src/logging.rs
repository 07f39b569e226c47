//! Logging setup with a reloadable filter and optional rolling log files.
//!
//! - Runtime log level changes via `tracing_subscriber::reload`
//! - Pretty or JSON console output with local timezone timestamps
//! - Daily rolling files plus retention cleanup when a log directory is set

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "notifyd=info";

/// Prefix of rolled log files (`notifyd.log.YYYY-MM-DD`).
const LOG_FILE_PREFIX: &str = "notifyd.log";

/// Console output format.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging settings resolved from the process configuration.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    /// Enables daily rolling file output when set.
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub retention_days: i64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: None,
            format: LogFormat::Pretty,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Parse a filter directive, rejecting malformed ones as configuration errors.
pub fn parse_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| Error::config(format!("Invalid filter directive '{directive}': {e}")))
}

/// Handle to the installed subscriber.
pub struct LoggingHandle {
    handle: FilterHandle,
    log_dir: Option<PathBuf>,
    retention_days: i64,
}

impl LoggingHandle {
    /// Current filter directive.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive (e.g. `notifyd=debug`).
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = parse_filter(directive)?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {e}")))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    /// Delete expired log files once a day until `cancel_token` fires.
    ///
    /// No-op without a log directory.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let Some(log_dir) = self.log_dir.clone() else {
            return;
        };
        let retention_days = self.retention_days;

        tokio::spawn(async move {
            let cleanup_interval = Duration::from_secs(24 * 60 * 60);

            loop {
                if let Err(e) = cleanup_old_logs(&log_dir, retention_days).await {
                    warn!(error = %e, "Failed to cleanup old logs");
                }

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(cleanup_interval) => {}
                }
            }
        });
    }
}

/// Delete `notifyd.log.YYYY-MM-DD` files older than `retention_days`.
///
/// Returns the number of deleted files.
pub async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
            .and_then(|n| n.strip_prefix('.'))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted_count += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the process, otherwise
/// buffered file output is lost.
pub fn init_logging(settings: &LoggingSettings) -> Result<(Arc<LoggingHandle>, Option<WorkerGuard>)> {
    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let (file_layer, guard) = match &settings.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (pretty_layer, json_layer) = match settings.format {
        LogFormat::Pretty => (
            Some(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_timer(LocalTimer),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_timer(LocalTimer),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(pretty_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {e}")))?;

    let handle = Arc::new(LoggingHandle {
        handle: filter_handle,
        log_dir: settings.dir.clone(),
        retention_days: settings.retention_days,
    });

    Ok((handle, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("notifyd=info"));
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("notifyd=debug,reqwest=warn").is_ok());
        assert!(matches!(
            parse_filter("notifyd=notalevel"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_set_filter_reloads_and_rejects_invalid() {
        let (_layer, handle) = reload::Layer::<EnvFilter, tracing_subscriber::Registry>::new(
            EnvFilter::new(DEFAULT_LOG_FILTER),
        );
        let logging = LoggingHandle {
            handle,
            log_dir: None,
            retention_days: 7,
        };

        logging.set_filter("notifyd=debug").unwrap();
        assert_eq!(logging.get_filter(), "notifyd=debug");

        let err = logging.set_filter("notifyd=notalevel").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(logging.get_filter(), "notifyd=debug");
    }

    #[tokio::test]
    async fn test_cleanup_old_logs_only_removes_expired_dated_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = (Utc::now() - chrono::Duration::days(30)).format("%Y-%m-%d");
        let today = Utc::now().format("%Y-%m-%d");

        let old_file = dir.path().join(format!("notifyd.log.{old}"));
        let fresh_file = dir.path().join(format!("notifyd.log.{today}"));
        let unrelated = dir.path().join(format!("other.log.{old}"));
        let undated = dir.path().join("notifyd.log.backup");
        for path in [&old_file, &fresh_file, &unrelated, &undated] {
            std::fs::write(path, b"x").unwrap();
        }

        let deleted = cleanup_old_logs(dir.path(), 7).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(!old_file.exists());
        assert!(fresh_file.exists());
        assert!(unrelated.exists());
        assert!(undated.exists());
    }
}
