//! Common error types for InvoiceDrop.

use std::fmt;

use thiserror::Error;

/// The request of an upload that the remote store rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    /// Single-request PUT of the whole file.
    Direct,
    /// Creation of a resumable upload session.
    SessionCreation,
    /// One chunk of a resumable session (1-based index).
    Chunk { index: u64, count: u64 },
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStage::Direct => write!(f, "direct upload"),
            UploadStage::SessionCreation => write!(f, "upload session creation"),
            UploadStage::Chunk { index, count } => write!(f, "chunk {}/{}", index, count),
        }
    }
}

/// Top-level error type for InvoiceDrop operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration, including an unreadable token cache.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Token exchange or interactive authorization failed.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A request could not be sent or its response could not be read.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote store answered with a non-success status.
    #[error("{stage} rejected with status {status}: {body} ({bytes_committed} bytes committed)")]
    UploadRejected {
        stage: UploadStage,
        status: u16,
        body: String,
        bytes_committed: u64,
    },

    /// The local file ended before the size declared to the session.
    #[error("Local file truncated: expected {expected} bytes, read {actual}")]
    LocalFileTruncated { expected: u64, actual: u64 },

    /// The operation was cancelled by the caller.
    #[error("Cancelled after {bytes_committed} bytes committed")]
    Cancelled { bytes_committed: u64 },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether retrying the whole operation from scratch may succeed.
    ///
    /// Only transport failures and upload rejections with a transient
    /// status (408, 429, 5xx) qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::UploadRejected { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Bytes the server acknowledged before the failure, when known.
    pub fn bytes_committed(&self) -> Option<u64> {
        match self {
            Error::UploadRejected {
                bytes_committed, ..
            }
            | Error::Cancelled { bytes_committed } => Some(*bytes_committed),
            _ => None,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(status: u16) -> Error {
        Error::UploadRejected {
            stage: UploadStage::Chunk { index: 7, count: 16 },
            status,
            body: "boom".to_string(),
            bytes_committed: 42,
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(rejected(500).is_transient());
        assert!(rejected(503).is_transient());
        assert!(rejected(429).is_transient());
        assert!(!rejected(403).is_transient());
        assert!(!rejected(409).is_transient());
        assert!(!Error::Authentication("denied".to_string()).is_transient());
        assert!(!Error::Configuration("no client id".to_string()).is_transient());
        assert!(!Error::LocalFileTruncated {
            expected: 10,
            actual: 5
        }
        .is_transient());
    }

    #[test]
    fn test_rejection_message_carries_status_and_body() {
        let message = rejected(500).to_string();
        assert!(message.contains("chunk 7/16"));
        assert!(message.contains("500"));
        assert!(message.contains("boom"));
        assert_eq!(rejected(500).bytes_committed(), Some(42));
    }
}
