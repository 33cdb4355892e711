//! Cloud transport status taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status codes reported by the cloud transport.
///
/// Every transport call resolves to either a value or one of these codes.
/// The engine never inspects transport-specific detail beyond the code; the
/// classification helpers below are the single place where "retry or give
/// up" is decided.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The request was malformed or violated a precondition.
    #[error("invalid argument")]
    ArgumentError,
    /// The auth token was rejected or has expired.
    #[error("authentication rejected")]
    AuthError,
    /// The connection failed or timed out.
    #[error("network error")]
    NetworkError,
    /// The requested entry does not exist (for the device set: erased).
    #[error("not found")]
    NotFound,
    /// The response could not be parsed.
    #[error("malformed response")]
    ParseError,
    /// The server rejected the request, including conflicting writes.
    #[error("server error")]
    ServerError,
    /// The server reported an internal failure.
    #[error("internal error")]
    InternalError,
}

impl Status {
    /// Returns true if an operation failing with this status may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Status::NetworkError | Status::InternalError)
    }

    /// Returns true if this status ends the current attempt for good.
    ///
    /// `ServerError` is deliberately neither retryable nor fatal here: a
    /// conflicting write is reconciled by observing the same commit arrive
    /// through the download path, so the caller decides.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Status::ArgumentError | Status::ParseError | Status::AuthError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(Status::NetworkError.is_retryable());
        assert!(Status::InternalError.is_retryable());
        assert!(!Status::AuthError.is_retryable());
        assert!(!Status::NotFound.is_retryable());
        assert!(!Status::ServerError.is_retryable());
    }

    #[test]
    fn fatal_statuses() {
        assert!(Status::ParseError.is_fatal());
        assert!(Status::ArgumentError.is_fatal());
        assert!(Status::AuthError.is_fatal());
        assert!(!Status::NetworkError.is_fatal());
        assert!(!Status::ServerError.is_fatal());
    }

    #[test]
    fn status_display() {
        assert_eq!(Status::NetworkError.to_string(), "network error");
        assert_eq!(Status::NotFound.to_string(), "not found");
    }
}
