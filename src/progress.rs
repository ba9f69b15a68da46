//! Progress reporting capability passed explicitly into orchestration calls.
//!
//! The sink is an observability side channel, not part of the control
//! contract: orchestrator behaviour never depends on what a sink does with
//! the lines it receives.

/// Receives human-readable progress lines from orchestration steps.
pub trait ProgressSink: Send + Sync {
    /// Records a single progress line.
    fn log(&self, line: &str);

    /// Records a line of streamed output from a collaborator, tagged with its
    /// origin and whether it came from an error stream.
    fn log_output(&self, source: &str, line: &str, is_error: bool) {
        if is_error {
            self.log(&format!("[{source}] error: {line}"));
        } else {
            self.log(&format!("[{source}] {line}"));
        }
    }
}

/// Sink that discards everything. Used by tests and by callers that do not
/// care about progress output.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn log(&self, _line: &str) {}
}

/// Sink that forwards progress lines to the `tracing` subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn log(&self, line: &str) {
        tracing::info!("{line}");
    }

    fn log_output(&self, source: &str, line: &str, is_error: bool) {
        if is_error {
            tracing::warn!(source, "{line}");
        } else {
            tracing::info!(source, "{line}");
        }
    }
}
