use std::fmt;

use crate::stream::Transcript;

/// Failure raised by an injected tool-call handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Why the driver stopped pulling events before the source was exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller fired the cancellation signal.
    Aborted,
    /// No event arrived within the configured idle timeout.
    TimedOut { idle_secs: u64 },
    /// The event source itself yielded an error.
    SourceFailed(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Aborted => f.write_str("aborted by caller"),
            CancelReason::TimedOut { idle_secs } => {
                write!(f, "no event received for {idle_secs}s")
            }
            CancelReason::SourceFailed(message) => write!(f, "event source failed: {message}"),
        }
    }
}

/// Error type used across the transcript pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Tool call handler error: {0}")]
    Handler(#[from] HandlerError),
    #[error("Stream cancelled: {0}")]
    Cancelled(CancelReason),
}

/// Broad error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Protocol,
    Stream,
    Handler,
    Cancelled,
}

impl TranscriptError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            TranscriptError::Protocol(_) => ErrorCategory::Protocol,
            TranscriptError::Stream(_) => ErrorCategory::Stream,
            TranscriptError::Handler(_) => ErrorCategory::Handler,
            TranscriptError::Cancelled(_) => ErrorCategory::Cancelled,
        }
    }

    /// Cancellation leaves a usable partial transcript; everything else is fatal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.category() == ErrorCategory::Cancelled
    }
}

/// Returned by the driver when consumption stops without a clean end.
///
/// `transcript` is the read-only state at the moment of the abort. It is
/// absent only for cancellations under the `discard` cancel policy.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct StreamAbort {
    pub error: TranscriptError,
    pub transcript: Option<Transcript>,
}

impl StreamAbort {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.error.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_cancellation_is_recoverable() {
        assert!(TranscriptError::Cancelled(CancelReason::Aborted).is_recoverable());
        assert!(!TranscriptError::Protocol("x".into()).is_recoverable());
        assert!(!TranscriptError::Stream("x".into()).is_recoverable());
        assert!(!TranscriptError::Handler(HandlerError::new("x")).is_recoverable());
    }

    #[test]
    fn test_stream_error_message_is_verbatim() {
        let err = TranscriptError::Stream("upstream exploded".into());
        assert_eq!(err.to_string(), "Stream error: upstream exploded");
    }

    #[test]
    fn test_cancel_reason_display() {
        let err = TranscriptError::Cancelled(CancelReason::TimedOut { idle_secs: 30 });
        assert_eq!(err.to_string(), "Stream cancelled: no event received for 30s");
        assert_eq!(err.category(), ErrorCategory::Cancelled);
    }
}
