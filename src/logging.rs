//! Logging setup for the dashboard client
//!
//! `RUST_LOG` directives always win over the configured default level.
//! File output rolls daily and is written from a background thread; keep the
//! returned guard alive until shutdown so buffered lines are flushed.

use crate::error::{Result, SessionError};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` does not say otherwise
    pub level: Level,

    /// Log to a daily-rolling file
    pub file_path: Option<PathBuf>,

    /// Log to stderr
    pub stderr: bool,

    /// One JSON object per line
    pub json: bool,

    /// Include thread IDs
    pub thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_path: None,
            stderr: true,
            json: false,
            thread_ids: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(log_file) = std::env::var("TURBACZ_LOG_FILE") {
            if !log_file.trim().is_empty() {
                config.file_path = Some(PathBuf::from(log_file));
            }
        }

        if let Ok(log_stderr) = std::env::var("TURBACZ_LOG_STDERR") {
            config.stderr = log_stderr.to_lowercase() != "false";
        }

        if let Ok(json) = std::env::var("TURBACZ_LOG_JSON") {
            config.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        config
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env_lossy()
    }
}

/// Install the global subscriber
pub fn init_logging(config: LogConfig) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.stderr {
        layers.push(output_layer(&config, std::io::stderr, true));
    }

    if let Some(file_path) = &config.file_path {
        let (directory, file_name) = split_log_path(file_path);
        std::fs::create_dir_all(&directory)?;

        let appender = tracing_appender::rolling::daily(directory, file_name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(output_layer(&config, writer, false));
        guard = Some(file_guard);
    }

    let subscriber = tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter());

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| SessionError::config(format!("Logging already initialised: {e}")))?;

    Ok(guard)
}

fn output_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'writer> fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(config.thread_ids);

    if config.json {
        layer.json().boxed()
    } else {
        layer.with_ansi(ansi).boxed()
    }
}

fn split_log_path(path: &Path) -> (PathBuf, PathBuf) {
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("turbacz-dash.log"));
    (directory, file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("TURBACZ_LOG_FILE", Some("/var/log/turbacz/dash.log")),
                ("TURBACZ_LOG_STDERR", Some("false")),
                ("TURBACZ_LOG_JSON", Some("true")),
            ],
            || {
                let config = LogConfig::from_env();
                assert_eq!(
                    config.file_path,
                    Some(PathBuf::from("/var/log/turbacz/dash.log"))
                );
                assert!(!config.stderr);
                assert!(config.json);
            },
        );
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        temp_env::with_vars_unset(
            ["TURBACZ_LOG_FILE", "TURBACZ_LOG_STDERR", "TURBACZ_LOG_JSON"],
            || {
                let config = LogConfig::from_env();
                assert_eq!(config.level, Level::INFO);
                assert!(config.file_path.is_none());
                assert!(config.stderr);
                assert!(!config.json);
            },
        );
    }

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("dash.log"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, PathBuf::from("dash.log"));

        let (dir, name) = split_log_path(Path::new("/tmp/turbacz/dash.log"));
        assert_eq!(dir, PathBuf::from("/tmp/turbacz"));
        assert_eq!(name, PathBuf::from("dash.log"));
    }
}
