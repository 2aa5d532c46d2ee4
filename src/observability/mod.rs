use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::protocol::canonical::{StreamOutcome, Usage};
use crate::stream::StreamStats;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
///
/// Output goes to stderr so stdout stays free for the replayed transcript.
pub fn init_tracing(log_level: &str) {
    let level = log_level.to_uppercase();

    if level == "DISABLED" {
        return;
    }

    let filter = EnvFilter::try_new(tracing_level(&level)).unwrap_or_else(|_| EnvFilter::new("INFO"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn tracing_level(level: &str) -> &str {
    match level {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    }
}

/// Total token count, summing the parts when the source omitted it.
#[must_use]
pub fn resolved_total_tokens(usage: &Usage) -> Option<u64> {
    match (usage.total_tokens, usage.completion_tokens, usage.prompt_tokens) {
        (Some(total), _, _) => Some(total),
        (None, None, None) => None,
        (None, completion, prompt) => Some(completion.unwrap_or(0) + prompt.unwrap_or(0)),
    }
}

/// Log a completed stream at INFO level.
pub fn log_stream_complete(outcome: &StreamOutcome, stats: &StreamStats, duration: Duration) {
    let usage = &outcome.usage;
    info!(
        finish_reason = %outcome.finish_reason,
        events = stats.events,
        snapshots = stats.snapshots,
        messages = stats.messages,
        completion_tokens = usage.completion_tokens.unwrap_or(0),
        prompt_tokens = usage.prompt_tokens.unwrap_or(0),
        total_tokens = resolved_total_tokens(usage).unwrap_or(0),
        usage_known = !usage.is_unknown(),
        duration_seconds = duration.as_secs_f64(),
        "stream completed"
    );
}
