//! Structured JSON logging setup.
//!
//! Log lines are JSON with `level`, `component`, `error_kind` and
//! `correlation_id` fields where call sites provide them. Payloads that may
//! carry credentials go through `auth::redact_payload` before they are
//! handed to a log macro.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `level` is the default filter when
/// RUST_LOG is unset.
pub fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .with_span_list(false)
        .finish();
    // A second init (tests) is harmless.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
