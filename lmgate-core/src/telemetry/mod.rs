//! Completion telemetry.
//!
//! Every finished exchange, streaming or not, produces one [`CompletionLog`].
//! Logs go nowhere until a process-wide sink is installed.

pub mod types;
#[cfg(test)]
pub mod test_span;

pub use types::CompletionLog;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Receiver for completion logs. Called from whichever task finished the
/// exchange, so it must be cheap and must not panic.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_completion(&self, log: CompletionLog);
}

static SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

#[cfg(test)]
thread_local! {
    // Unit tests share the global sink; only threads that opted in emit.
    static CAPTURING: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install the sink. Only the first call wins; later calls return `false`.
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    SINK.set(sink).is_ok()
}

fn capturing() -> bool {
    #[cfg(test)]
    {
        CAPTURING.with(|c| c.get())
    }
    #[cfg(not(test))]
    {
        true
    }
}

#[inline]
pub(crate) fn emit_completion(log: CompletionLog) {
    if !capturing() {
        return;
    }
    if let Some(sink) = SINK.get() {
        sink.record_completion(log);
    }
}
