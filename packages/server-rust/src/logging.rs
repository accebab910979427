//! `tracing` subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogArgs, LogFormat};

/// Builds the level filter: `RUST_LOG` if set, otherwise `default_level`.
///
/// # Errors
///
/// Returns an error if `default_level` is not a valid filter directive.
pub fn env_filter(default_level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_level)?),
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if the level is invalid or a subscriber is already set.
pub fn init_logging(args: &LogArgs) -> anyhow::Result<()> {
    let filter = env_filter(&args.log_level)?;
    let registry = tracing_subscriber::registry().with(filter);

    match args.log_format {
        LogFormat::Pretty => registry
            .with(fmt::layer().compact().with_target(true))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true).with_current_span(true))
            .try_init()?,
    }
    Ok(())
}
