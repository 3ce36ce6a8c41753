use thiserror::Error;

/// Classification of an error, independent of its message.
///
/// API callers match on this rather than on display strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidState,
    InvalidGraph,
    QueueFull,
    ResourceExhausted,
    NotFound,
    Timeout,
    Cancelled,
    WorkerFailed,
    Internal,
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not allowed: expected state {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("invalid task graph: {0}")]
    InvalidGraph(String),

    #[error("queue full: {pending} pending tasks at limit {limit}")]
    QueueFull { pending: usize, limit: usize },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("worker {worker_id} failed: {reason}")]
    WorkerFailed { worker_id: String, reason: String },

    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Build an `Internal` error with a fresh correlation id.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_state(expected: impl Into<String>, actual: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InvalidGraph(_) => ErrorKind::InvalidGraph,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::WorkerFailed { .. } => ErrorKind::WorkerFailed,
            Self::Internal { .. } | Self::Serialization(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may reasonably retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::QueueFull | ErrorKind::ResourceExhausted | ErrorKind::Timeout
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            OrchestratorError::InvalidArgument("bad".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            OrchestratorError::QueueFull {
                pending: 10,
                limit: 10
            }
            .kind(),
            ErrorKind::QueueFull
        );
        assert_eq!(
            OrchestratorError::internal("boom").kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_internal_carries_correlation_id() {
        let err = OrchestratorError::internal("subcomponent panic");
        match err {
            OrchestratorError::Internal { correlation_id, .. } => {
                assert!(!correlation_id.is_empty());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_retryable() {
        assert!(
            OrchestratorError::QueueFull {
                pending: 1,
                limit: 1
            }
            .is_retryable()
        );
        assert!(!OrchestratorError::NotFound("task-1".into()).is_retryable());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = OrchestratorError::invalid_state("Running", "Paused");
        assert!(err.to_string().contains("Running"));
        assert!(err.to_string().contains("Paused"));
    }
}
