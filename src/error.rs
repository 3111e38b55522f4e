//! Gateway error types.

use thiserror::Error;

/// Errors surfaced to callers of the gateway's public operations.
///
/// Failures inside a live stream are not raised through this type; they are
/// delivered as `error` events on the stream itself so the stream can still
/// terminate with a final `message_stop` frame.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The referenced session, conversation, story, or loop does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The session was explicitly terminated before the call.
    #[error("session terminated: {0}")]
    Terminated(String),

    /// The agent subprocess could not be launched.
    #[error("failed to spawn agent subprocess: {0}")]
    Spawn(String),

    /// External model credentials are missing or rejected.
    #[error("authentication error: {0}")]
    Auth(String),

    /// A persistence operation failed.
    #[error("store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// IO failure outside a subprocess stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }
}

/// Result alias for gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Classification carried by `error` events on a stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    SpawnError,
    CliError,
    Timeout,
    StreamError,
    AuthError,
    CompactionFail,
    GitError,
    QualityFail,
    CommentaryFail,
}

impl StreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamErrorKind::SpawnError => "spawn_error",
            StreamErrorKind::CliError => "cli_error",
            StreamErrorKind::Timeout => "timeout",
            StreamErrorKind::StreamError => "stream_error",
            StreamErrorKind::AuthError => "auth_error",
            StreamErrorKind::CompactionFail => "compaction_fail",
            StreamErrorKind::GitError => "git_error",
            StreamErrorKind::QualityFail => "quality_fail",
            StreamErrorKind::CommentaryFail => "commentary_fail",
        }
    }
}

impl std::fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::NotFound("session-1".to_string());
        assert_eq!(err.to_string(), "not found: session-1");

        let err = GatewayError::Terminated("session-2".to_string());
        assert!(err.to_string().contains("terminated"));
    }

    #[test]
    fn test_stream_error_kind_serialization() {
        let json = serde_json::to_string(&StreamErrorKind::SpawnError).unwrap();
        assert_eq!(json, "\"spawn_error\"");
        assert_eq!(StreamErrorKind::Timeout.as_str(), "timeout");
    }
}
