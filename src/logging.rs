//! Tracing setup.
//!
//! Reads `RUST_LOG`, defaulting to `forgeflow=info`. Output goes to stderr in
//! compact form. When `logging.json_file` is set, a second layer writes JSON
//! lines to a daily-rolling file under `logging.dir`.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

pub const DEFAULT_FILTER: &str = "forgeflow=info";

fn env_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "forgeflow=debug" } else { DEFAULT_FILTER };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber. The returned guard flushes the file layer
/// on drop and must be held for the life of the process.
pub fn init(config: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();

    if config.json_file {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("Failed to create log dir {}", config.dir.display()))?;
        let appender = tracing_appender::rolling::daily(&config.dir, "forgeflow.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(env_filter(verbose))
            .with(stderr_layer)
            .with(fmt::layer().json().with_writer(writer))
            .try_init()
            .context("Failed to install tracing subscriber")?;
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(env_filter(verbose))
            .with(stderr_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        Ok(None)
    }
}
