//! Logging setup.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVES: &str = "warn,pj_bitstream=info,pj_decoder=info,pj_display=info,pj_player=info";

/// Install the global fmt subscriber, filtered by `RUST_LOG` or
/// [`DEFAULT_DIRECTIVES`].
///
/// Fails instead of panicking if a subscriber is already installed.
pub fn init() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))?;
    tracing::debug!("Tracing initialized");
    Ok(())
}
