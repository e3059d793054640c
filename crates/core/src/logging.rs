use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_FILE_NAME: &str = "dwiflow.log";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingOptions {
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub log_dir: Option<PathBuf>,
}

/// Filter precedence: explicit CLI filter, then `RUST_LOG`, then the
/// verbosity switches, then the default.
pub fn select_log_filter(options: &LoggingOptions) -> String {
    if let Some(filter) = &options.cli_log_filter {
        return filter.clone();
    }
    if let Some(env_filter) = &options.rust_log_env {
        if !env_filter.trim().is_empty() {
            return env_filter.clone();
        }
    }
    match options.verbose {
        0 => DEFAULT_LOG_FILTER.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Installs the global subscriber: a console layer, plus a plain-text
/// file sink under the run's log directory when one is configured. The
/// returned guard must stay alive for the file sink to flush.
pub fn init_logging(options: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let filter = select_log_filter(options);
    let env_filter = EnvFilter::try_new(&filter)
        .with_context(|| format!("invalid log filter: '{filter}'"))?;

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());

    match &options.log_dir {
        Some(log_dir) => {
            fs::create_dir_all(log_dir).with_context(|| {
                format!("failed to create log directory: {}", log_dir.display())
            })?;
            let appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()
                .context("failed to install tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            registry
                .try_init()
                .context("failed to install tracing subscriber")?;
            Ok(None)
        }
    }
}
