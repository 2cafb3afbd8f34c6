//! Error types for Cirrus
//!
//! This module defines the common error types used throughout the system.

use crate::types::{BucketNameError, ObjectKeyError};
use thiserror::Error;

/// Common result type for Cirrus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Cirrus
#[derive(Debug, Error)]
pub enum Error {
    // Start-up errors (fatal to the process)
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cluster registration failed: {0}")]
    Registration(String),

    // Placement errors
    #[error("no enabled mountpaths")]
    NoEnabledMountpaths,

    // Cache / storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error on {path}: {reason}")]
    Storage { path: String, reason: String },

    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("checksum mismatch for {bucket}/{key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        bucket: String,
        key: String,
        expected: String,
        actual: String,
    },

    // Cloud backend errors
    #[error("fetch failed for {bucket}/{key}: {reason}")]
    Fetch {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("bucket listing failed for {bucket}: {reason}")]
    ListBucket { bucket: String, reason: String },

    // Intra-cluster errors
    #[error("peer transfer failed: {0}")]
    Peer(String),

    // Control plane errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid bucket name: {0}")]
    InvalidBucketName(#[from] BucketNameError),

    #[error("invalid object key: {0}")]
    InvalidObjectKey(#[from] ObjectKeyError),

    // Clean termination marker (signal runner, shutdown action)
    #[error("shutdown requested")]
    Shutdown,
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a storage error for a mountpath-local failure
    pub fn storage(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for the clean-termination marker produced by the signal
    /// runner and the shutdown action
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Check if the caller may retry the operation as-is
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. } | Self::ListBucket { .. } | Self::ChecksumMismatch { .. } | Self::Peer(_)
        )
    }

    /// HTTP status code reported at the request boundary
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::Protocol(_) | Self::InvalidBucketName(_) | Self::InvalidObjectKey(_) => 400,

            Self::ObjectNotFound { .. } => 404,

            Self::DiskIo(_)
            | Self::Storage { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Configuration(_)
            | Self::Registration(_)
            | Self::Shutdown => 500,

            Self::Fetch { .. } | Self::ListBucket { .. } | Self::Peer(_) => 502,

            Self::NoEnabledMountpaths => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let fetch = Error::Fetch {
            bucket: "b".into(),
            key: "k".into(),
            reason: "timeout".into(),
        };
        assert!(fetch.is_retryable());
        assert!(!Error::NoEnabledMountpaths.is_retryable());
        assert!(!Error::Configuration("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_http_status() {
        assert_eq!(Error::Protocol("bad msg".into()).http_status_code(), 400);
        assert_eq!(
            Error::ObjectNotFound {
                bucket: "b".into(),
                key: "k".into()
            }
            .http_status_code(),
            404
        );
        assert_eq!(Error::NoEnabledMountpaths.http_status_code(), 503);
    }

    #[test]
    fn test_shutdown_marker() {
        assert!(Error::Shutdown.is_shutdown());
        assert!(!Error::NoEnabledMountpaths.is_shutdown());
    }
}
