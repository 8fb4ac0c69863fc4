//! Subscriber installation for worker and publisher processes.
//!
//! Each service logs to its own file, `<log_dir>/<queue>_service.log`, opened
//! in append mode so restarts keep their history. Without a log directory,
//! events go to stderr. The filter is read from `RUST_LOG` and defaults to
//! `info`.
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    error::{QueueError, Result},
};

const DEFAULT_FILTER: &str = "info";

/// The log file for `queue` inside `dir`.
pub fn log_path(dir: &Path, queue: &str) -> PathBuf {
    dir.join(format!("{queue}_service.log"))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(config: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = match &config.log_dir {
        Some(dir) => {
            let path = log_path(dir, &config.queue);
            let file = fs::create_dir_all(dir)
                .and_then(|()| OpenOptions::new().create(true).append(true).open(&path))
                .map_err(|e| {
                    QueueError::Config(format!("cannot open log file `{}`: {e}", path.display()))
                })?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };

    installed.map_err(|e| QueueError::Config(format!("failed to install log subscriber: {e}")))
}
