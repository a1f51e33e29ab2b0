use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Installs the global fmt subscriber, filtered by `RUST_LOG`
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_LOG_FILTER);
}

/// Like [`init_tracing`], falling back to `default_filter` when `RUST_LOG` is unset or invalid
pub fn init_tracing_with(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // fails only when a subscriber is already installed
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_tracing();
        init_tracing_with("debug");
        tracing::info!("still logging");
    }
}
