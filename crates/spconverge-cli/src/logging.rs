use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;

use spconverge_core::LayeredSettings;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub(crate) const LOG_ENV: &str = "SPCONVERGE_LOG";

/// Mirror every log line to this file as well.
pub(crate) const SETTING_LOG_FILE: &str = "storpool_charm_log_file";

pub(crate) fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

pub(crate) fn init_logging(settings: &LayeredSettings) -> Result<()> {
    let file_layer = match settings.string(SETTING_LOG_FILE) {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open the log file: {path}"))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!("failed to set up logging: {err}"))
}
