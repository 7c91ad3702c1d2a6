//! Logging for the calibration service.
//!
//! Operational log lines carry `action`/`result` fields so a session's
//! history can be grepped per operation; everything a worker logs inherits
//! its `session_id` from [`session_span`].

use once_cell::sync::OnceCell;
use tracing::{Level, Span};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

static SUBSCRIBER_GUARD: OnceCell<()> = OnceCell::new();

/// Install the global subscriber. Safe to call from every entrypoint (binary
/// and tests alike); only the first call does anything.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
pub fn init_logger(service_name: &'static str) {
    SUBSCRIBER_GUARD.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();

        tracing::info!(
            action = "init_logger",
            result = "success",
            service = service_name,
            "logger initialized"
        );
    });
}

/// Root span for everything a session worker does. All batch handling,
/// persistence and reporting logs inherit the `session_id` field from it.
pub fn session_span(session_id: Uuid) -> Span {
    tracing::span!(Level::INFO, "session", session_id = %session_id)
}
