//! Structured logging: console plus an optional daily rolling file.
//!
//! `RUST_LOG` wins over the configured filter. The returned guard flushes the
//! file writer when dropped, so the binary holds it until exit.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::LogConfig;
use crate::error::{AcceptorError, Result};

pub const LOG_FILE_PREFIX: &str = "cash-acceptor";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let (file_layer, guard, pruned) = match &config.dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .map_err(|e| AcceptorError::Config(format!("log dir {}: {e}", dir.display())))?;
            let pruned = prune_old_logs(dir, config.max_files);

            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer: BoxedLayer = if config.json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed()
            };
            (Some(layer), Some(guard), pruned)
        }
        None => (None, None, 0),
    };

    // stdout is reserved for command output
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter)
        .try_init()
        .map_err(|e| AcceptorError::Config(format!("logging already initialised: {e}")))?;

    if pruned > 0 {
        tracing::info!(pruned, "Pruned old log files");
    }
    Ok(guard)
}

/// Delete all but the newest `keep` rolled files in `dir`. Returns how many
/// were removed.
pub fn prune_old_logs(dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune log file"),
        }
    }
    removed
}
