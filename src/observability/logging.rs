//! # Logging
//!
//! tracing subscriber setup. `RUST_LOG` wins when set; otherwise the
//! configured level applies to this crate and `warn` to everything else.

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber
pub fn init(log_level: &str) {
    let default_directive = format!("warn,keystone_operator={}", log_level.to_lowercase());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
