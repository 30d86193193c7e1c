//! Shared test setup.
//!
//! [`init_tracing`] installs an env-filtered console subscriber once per
//! process. Set `RUST_LOG=mdlist=trace` to watch retry and splice events
//! from the library (requires building with `--features tracing`).

#![allow(dead_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the tracing subscriber.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .with_target(true)
            .compact()
            .try_init();
    });
}
