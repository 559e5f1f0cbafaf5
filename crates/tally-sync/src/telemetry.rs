//! # Telemetry
//!
//! Process-wide `tracing` setup for binaries embedding the sync layer.
//!
//! The filter comes from `RUST_LOG` when set, otherwise
//! `info,tally=debug,sqlx=warn`.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,tally=debug,sqlx=warn";

/// Installs a formatted subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::debug!("telemetry initialised twice");
    }
}
