//! Tracing setup for the host process.
//!
//! `DEBUG` widens the default filter; `ENABLE_TRACING` switches the output
//! to machine-readable JSON for log shippers. `RUST_LOG` overrides both.

use tracing_subscriber::EnvFilter;

fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn setup_logging() {
    let default_filter = if env_truthy("DEBUG") {
        "debug,hyper=info,reqwest=info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    if env_truthy("ENABLE_TRACING") {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}
