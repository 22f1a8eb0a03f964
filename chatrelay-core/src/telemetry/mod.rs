//! Telemetry for relay exchanges.
//! By default, no telemetry is emitted unless a sink is installed via `set_telemetry_sink`.

pub mod types;

pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Implement this to receive one record per finished exchange.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record` **may** be called from any thread, including from a `Drop` impl;
///   implementations should avoid panicking and blocking.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, log: ExchangeLog);
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// In tests, gate emission to only the calling test thread to avoid cross-test interference.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install a global telemetry sink. Returns `false` if a sink is already installed.
///
/// This is a write-once global for the process lifetime (backed by `OnceCell`).
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

/// Log the exchange and hand it to the sink, if one is installed.
///
/// In tests, sink delivery is suppressed unless enabled via `test_set_capture_enabled`.
pub(crate) fn emit(log: ExchangeLog) {
    tracing::info!(
        route = %log.route,
        model = log.model.as_deref().unwrap_or(""),
        outcome = log.outcome.as_str(),
        deltas = log.deltas,
        chars = log.chars,
        latency_ms = log.latency_ms,
        error = log.error_message.as_deref().unwrap_or(""),
        "exchange finished"
    );
    #[cfg(test)]
    {
        if !TEST_CAPTURE.with(|c| c.get()) {
            return;
        }
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record(log);
    }
}

#[cfg(test)]
/// Test-only helper: enable or disable capture for the current test thread.
///
/// `#[tokio::test]` runs on a current-thread runtime, so futures polled by the
/// test observe the flag.
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}
