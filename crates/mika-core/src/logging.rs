//! Tracing bootstrap for embedders.
//!
//! Call once at process start. `MIKA_LOG` (or the conventional `RUST_LOG`)
//! selects the filter; defaults to `info`.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init() {
    let filter = std::env::var("MIKA_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    // A second init (tests, embedders with their own subscriber) is a no-op.
    let _ = fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .try_init();
}
