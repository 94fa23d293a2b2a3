//! Logging setup using tracing.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. `RUST_LOG` wins over the configured
/// level so a single run can be turned up without touching the config file.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}
