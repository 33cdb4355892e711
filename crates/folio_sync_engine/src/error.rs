//! Error types for the sync engine.

use folio_sync_protocol::Status;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Network or transport failure.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The auth token was rejected; credentials must be refreshed externally.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Data received from the cloud could not be interpreted.
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// The server rejected a request, including conflicting writes.
    #[error("server error: {0}")]
    Server(String),

    /// The storage layer failed; its invariants may be violated.
    #[error("storage error: {0}")]
    Storage(String),

    /// Caller bug, surfaced immediately.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Invariant violation inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns true if this error must end the page's sync for good.
    ///
    /// Server rejections are excluded: a conflicting write self-heals when
    /// the same commit arrives through the download path.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => !retryable,
            SyncError::Server(_) => false,
            SyncError::Auth(_)
            | SyncError::MalformedData(_)
            | SyncError::Storage(_)
            | SyncError::Argument(_)
            | SyncError::Internal(_) => true,
        }
    }
}

impl From<Status> for SyncError {
    fn from(status: Status) -> Self {
        match status {
            Status::NetworkError => SyncError::network_retryable("connection failed"),
            Status::InternalError => SyncError::Network {
                message: "server internal failure".into(),
                retryable: true,
            },
            Status::AuthError => SyncError::Auth("token rejected by cloud".into()),
            Status::ParseError => SyncError::MalformedData("unparseable cloud response".into()),
            Status::ServerError => SyncError::Server("request rejected".into()),
            Status::NotFound => SyncError::Server("entry not found".into()),
            Status::ArgumentError => SyncError::Argument("rejected by cloud".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::network_retryable("connection lost").is_retryable());
        assert!(!SyncError::network_fatal("invalid certificate").is_retryable());
        assert!(!SyncError::Storage("corrupt journal".into()).is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(SyncError::Storage("corrupt journal".into()).is_fatal());
        assert!(SyncError::Auth("expired".into()).is_fatal());
        assert!(SyncError::MalformedData("bad batch".into()).is_fatal());
        assert!(!SyncError::Server("conflict".into()).is_fatal());
        assert!(!SyncError::network_retryable("timeout").is_fatal());
    }

    #[test]
    fn status_conversion() {
        assert!(SyncError::from(Status::NetworkError).is_retryable());
        assert!(SyncError::from(Status::AuthError).is_fatal());
        assert!(!SyncError::from(Status::ServerError).is_fatal());
    }
}
