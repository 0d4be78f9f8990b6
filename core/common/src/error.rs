//! Common error types for graphdrive.

use thiserror::Error;

/// Top-level error type for graphdrive operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Token missing, expired, or rejected by the identity platform.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Remote item does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote item already exists or was modified concurrently.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The drive has no room left for the upload.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The caller may not access the item.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Any other non-2xx answer from the service.
    #[error("Request failed with status {status}: {message}")]
    Request {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Transport failure or unreadable response.
    #[error("Network error: {0}")]
    Network(String),

    /// One or more items of a batch transfer failed.
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Settings are missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Classify a non-2xx Graph answer.
    ///
    /// A known service error `code` decides; the HTTP status is only
    /// consulted when the code is missing or unknown.
    pub fn from_graph(status: u16, code: Option<String>, message: String) -> Self {
        let by_code = match code.as_deref() {
            Some("itemNotFound") => Some(404),
            Some("nameAlreadyExists" | "resourceModified") => Some(409),
            Some("quotaLimitReached") => Some(507),
            Some("unauthenticated" | "InvalidAuthenticationToken") => Some(401),
            Some("accessDenied") => Some(403),
            _ => None,
        };

        match by_code.unwrap_or(status) {
            404 => Error::NotFound(message),
            409 | 412 => Error::Conflict(message),
            507 => Error::QuotaExceeded(message),
            401 => Error::Authentication(message),
            403 => Error::PermissionDenied(message),
            _ => Error::Request {
                status,
                code,
                message,
            },
        }
    }

    /// Whether the failure is worth retrying while connecting.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Io(_) => true,
            Error::Request { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_code_takes_precedence() {
        let err = Error::from_graph(400, Some("quotaLimitReached".into()), "full".into());
        assert!(matches!(err, Error::QuotaExceeded(_)));

        let err = Error::from_graph(400, Some("nameAlreadyExists".into()), "dup".into());
        assert!(matches!(err, Error::Conflict(_)));

        let err = Error::from_graph(404, Some("accessDenied".into()), "hidden".into());
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn test_graph_status_mapping() {
        assert!(matches!(
            Error::from_graph(404, None, String::new()),
            Error::NotFound(_)
        ));
        assert!(matches!(
            Error::from_graph(401, None, String::new()),
            Error::Authentication(_)
        ));
        assert!(matches!(
            Error::from_graph(403, None, String::new()),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            Error::from_graph(507, None, String::new()),
            Error::QuotaExceeded(_)
        ));
    }

    #[test]
    fn test_unclassified_status_keeps_details() {
        let err = Error::from_graph(400, Some("invalidRequest".into()), "bad".into());
        match err {
            Error::Request {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 400);
                assert_eq!(code.as_deref(), Some("invalidRequest"));
                assert_eq!(message, "bad");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::from_graph(503, None, String::new()).is_transient());
        assert!(Error::from_graph(429, None, String::new()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
        assert!(!Error::Authentication("x".into()).is_transient());
    }
}
