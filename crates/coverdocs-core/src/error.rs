//! Error types for coverdocs.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using coverdocs' Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for coverdocs operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input; never retried by the core.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Document not found.
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// OCR job not found.
    #[error("OCR job not found: {0}")]
    JobNotFound(Uuid),

    /// Duplicate resource or conflicting state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// ETag precondition failed on an optimistic update.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Authentication failed.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authenticated but not authorized.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Owner storage quota exceeded.
    #[error("Quota exceeded: {used_bytes} of {quota_bytes} bytes used")]
    QuotaExceeded { used_bytes: i64, quota_bytes: i64 },

    /// Upstream dependency failure (blob store, OCR engine, metadata store).
    #[error("Upstream {service} error: {message}")]
    Upstream {
        service: &'static str,
        message: String,
        retryable: bool,
    },

    /// Permanent processing failure (unreadable input); never retried.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// A worker lost its lease on a job; internal to the queue.
    #[error("Lease lost on job {0}")]
    LeaseLost(Uuid),

    /// Database operation failed (wraps sqlx::Error).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failed operation may be retried by the caller.
    ///
    /// Drives the queue's retry-vs-terminal classification: transient
    /// upstream and I/O failures burn a retry, everything else finalizes.
    pub fn retryable(&self) -> bool {
        match self {
            Error::Upstream { retryable, .. } => *retryable,
            Error::Database(_) | Error::Io(_) => true,
            Error::LeaseLost(_) => false,
            _ => false,
        }
    }

    /// Convenience constructor for a retryable upstream failure.
    pub fn upstream(service: &'static str, message: impl Into<String>) -> Self {
        Error::Upstream {
            service,
            message: message.into(),
            retryable: true,
        }
    }

    /// Convenience constructor for a non-retryable upstream failure.
    pub fn upstream_permanent(service: &'static str, message: impl Into<String>) -> Self {
        Error::Upstream {
            service,
            message: message.into(),
            retryable: false,
        }
    }

    /// Short machine-readable code recorded on failed jobs and audit rows.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) | Error::DocumentNotFound(_) | Error::JobNotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::PreconditionFailed(_) => "precondition_failed",
            Error::Unauthenticated(_) => "unauthenticated",
            Error::Forbidden(_) => "forbidden",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::Upstream { .. } => "upstream",
            Error::Permanent(_) => "permanent",
            Error::LeaseLost(_) => "lease_lost",
            Error::Database(_) => "database",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Upstream {
            service: "http",
            message: e.to_string(),
            retryable: e.is_timeout() || e.is_connect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_validation() {
        let err = Error::Validation("empty file".to_string());
        assert_eq!(err.to_string(), "Validation error: empty file");
    }

    #[test]
    fn test_display_document_not_found() {
        let id = Uuid::nil();
        let err = Error::DocumentNotFound(id);
        assert_eq!(err.to_string(), format!("Document not found: {}", id));
    }

    #[test]
    fn test_display_quota_exceeded() {
        let err = Error::QuotaExceeded {
            used_bytes: 900,
            quota_bytes: 1000,
        };
        assert_eq!(err.to_string(), "Quota exceeded: 900 of 1000 bytes used");
    }

    #[test]
    fn test_upstream_retryable_classification() {
        assert!(Error::upstream("blobstore", "timeout").retryable());
        assert!(!Error::upstream_permanent("ocr", "unreadable").retryable());
    }

    #[test]
    fn test_validation_not_retryable() {
        assert!(!Error::Validation("bad".into()).retryable());
        assert!(!Error::PreconditionFailed("etag".into()).retryable());
        assert!(!Error::Permanent("decode".into()).retryable());
        assert!(!Error::LeaseLost(Uuid::nil()).retryable());
    }

    #[test]
    fn test_io_retryable() {
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(err.retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Validation("x".into()).code(), "validation");
        assert_eq!(Error::JobNotFound(Uuid::nil()).code(), "not_found");
        assert_eq!(Error::LeaseLost(Uuid::nil()).code(), "lease_lost");
        assert_eq!(
            Error::QuotaExceeded {
                used_bytes: 0,
                quota_bytes: 0
            }
            .code(),
            "quota_exceeded"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
