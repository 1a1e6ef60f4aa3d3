//! Structured logging setup.

mod tracing_init;

pub use tracing_init::*;

/// Span that ties every log line of one invocation together.
///
/// Uses the caller's correlation id when given, otherwise a fresh UUID.
pub fn run_span(command: &str, correlation_id: Option<&str>) -> tracing::Span {
    let run_id = correlation_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info_span!("run", run_id = %run_id, command)
}
