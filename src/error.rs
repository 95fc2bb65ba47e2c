//! Error types and transport error mapping

use thiserror::Error;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ferry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Transport-level failure (connect, read, write)
    #[error("Network error: {message} (code: {code})")]
    Network {
        /// Error code, `-1` when the transport does not provide one
        code: i64,
        /// Error message
        message: String,
    },

    /// Timeout error
    #[error("Request timed out")]
    Timeout,

    /// Request was cancelled
    #[error("Request was cancelled")]
    Cancelled,

    /// The server answered with a non-success status
    #[error("HTTP status {status}")]
    Status {
        /// Response status
        status: http::StatusCode,
        /// Response body, decoded lossily
        body: String,
    },

    /// UTF-8 conversion error
    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Whether this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The HTTP status carried by a [`Error::Status`] error
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Convert a reqwest error into our error type
    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Error::Timeout;
        }

        if let Some(io) = find_io_error(&error) {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return Error::Timeout;
            }
        }

        Error::Network {
            code: error.status().map_or(-1, |s| i64::from(s.as_u16())),
            message: format!("Request failed: {error}"),
        }
    }
}

fn find_io_error<'a>(error: &'a (dyn std::error::Error + 'static)) -> Option<&'a std::io::Error> {
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = err.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_accessor() {
        let err = Error::Status {
            status: http::StatusCode::NOT_FOUND,
            body: "missing".to_string(),
        };
        assert_eq!(err.status(), Some(http::StatusCode::NOT_FOUND));
        assert_eq!(err.to_string(), "HTTP status 404 Not Found");
        assert!(Error::Timeout.status().is_none());
    }

    #[test]
    fn predicates() {
        assert!(Error::Timeout.is_timeout());
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_timeout());
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
