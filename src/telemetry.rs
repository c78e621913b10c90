//! Optional `tracing-subscriber` wiring for binaries and tests that embed
//! this crate. The library itself never installs a subscriber — it only
//! emits spans/events; whoever hosts it decides where those go.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a default `fmt` subscriber honoring `RUST_LOG`, once per process.
/// Safe to call repeatedly (e.g. once per test) — later calls are no-ops.
pub fn init_test_subscriber() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
