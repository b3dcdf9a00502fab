//! Error taxonomy for the voice pipeline.
//!
//! Every stage maps its failures into [`PipelineError`] so the WebSocket
//! layer can turn them into protocol `error` frames by kind, and so the
//! retry combinator can decide what is worth another attempt.

use std::time::Duration;

/// Errors produced by pipeline stages and their engine adapters.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Transient backend fault (connect failure, 5xx, broken stream).
    #[error("backend request failed: {0}")]
    BackendTransient(String),

    /// The backend rejected the request (4xx). Never retried.
    #[error("backend rejected request: {0}")]
    BackendRejected(String),

    /// The supervisor gave up restarting the backend.
    #[error("LLM backend is permanently unavailable")]
    BackendUnavailable,

    /// Speech-to-text failure. Non-fatal; the turn is skipped.
    #[error("transcription failed: {0}")]
    Stt(String),

    /// Text-to-speech failure for one sentence.
    #[error("synthesis failed: {0}")]
    Tts(String),

    /// A stage exceeded its deadline.
    #[error("{stage} timed out after {limit:?}")]
    Timeout { stage: &'static str, limit: Duration },

    /// The turn was interrupted by barge-in. Not an error condition.
    #[error("interrupted")]
    Cancelled,

    /// Malformed client input.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Stable error code carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::BackendTransient(_) => "backend_transient",
            PipelineError::BackendRejected(_) => "backend_rejected",
            PipelineError::BackendUnavailable => "backend_unavailable",
            PipelineError::Stt(_) => "stt_failed",
            PipelineError::Tts(_) => "tts_failed",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Protocol(_) => "protocol",
            PipelineError::Io(_) => "io",
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::BackendTransient(_) | PipelineError::Io(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

/// Configuration problems detected at startup. Mapped to exit code 2.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },

    #[error("required path does not exist: {what} = {path}")]
    MissingPath { what: &'static str, path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            PipelineError::BackendTransient("x".into()).code(),
            "backend_transient"
        );
        assert_eq!(PipelineError::BackendUnavailable.code(), "backend_unavailable");
        assert_eq!(PipelineError::Cancelled.code(), "cancelled");
        assert_eq!(
            PipelineError::Timeout {
                stage: "tts",
                limit: Duration::from_secs(15)
            }
            .code(),
            "timeout"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::BackendTransient("conn reset".into()).is_transient());
        assert!(!PipelineError::BackendRejected("bad model".into()).is_transient());
        assert!(!PipelineError::BackendUnavailable.is_transient());
        assert!(!PipelineError::Cancelled.is_transient());
    }
}
