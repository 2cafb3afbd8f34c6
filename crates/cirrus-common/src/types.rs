//! Core type definitions for Cirrus
//!
//! Identifiers, cluster member records, and the validated bucket/key
//! newtypes used to build cache paths.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a cluster member (proxy or target process)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct NodeId(String);

impl NodeId {
    /// Create a new node ID
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the node ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// One proxy or target process in the cluster. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member identity
    pub id: NodeId,
    /// Network address (IP or hostname)
    pub addr: String,
    /// Service port
    pub port: u16,
    /// Base URL other members use to reach this one directly
    pub direct_url: String,
}

impl Member {
    /// Create a member record, deriving the direct URL from addr and port
    #[must_use]
    pub fn new(id: NodeId, addr: impl Into<String>, port: u16) -> Self {
        let addr = addr.into();
        let direct_url = format!("http://{addr}:{port}");
        Self {
            id,
            addr,
            port,
            direct_url,
        }
    }
}

/// Cloud bucket name, validated against S3 naming rules
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BucketName(String);

impl BucketName {
    /// Create a new bucket name (validates S3 naming rules)
    pub fn new(name: impl Into<String>) -> Result<Self, BucketNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the bucket name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), BucketNameError> {
        if name.is_empty() {
            return Err(BucketNameError::Empty);
        }
        if name.len() > 63 {
            return Err(BucketNameError::TooLong);
        }
        for c in name.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '.' {
                return Err(BucketNameError::InvalidChar(c));
            }
        }
        // first/last checked after the charset pass, so unwrap-free indexing
        let first = name.as_bytes()[0];
        let last = name.as_bytes()[name.len() - 1];
        if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
            return Err(BucketNameError::InvalidStartChar);
        }
        if !last.is_ascii_lowercase() && !last.is_ascii_digit() {
            return Err(BucketNameError::InvalidEndChar);
        }
        if name.contains("..") {
            return Err(BucketNameError::ConsecutivePeriods);
        }
        Ok(())
    }
}

impl fmt::Debug for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketName({:?})", self.0)
    }
}

/// Errors that can occur when creating a bucket name
#[derive(Debug, Clone, thiserror::Error)]
pub enum BucketNameError {
    #[error("bucket name cannot be empty")]
    Empty,
    #[error("bucket name must be at most 63 characters")]
    TooLong,
    #[error("bucket name must start with a lowercase letter or number")]
    InvalidStartChar,
    #[error("bucket name must end with a lowercase letter or number")]
    InvalidEndChar,
    #[error("bucket name contains invalid character: {0}")]
    InvalidChar(char),
    #[error("bucket name cannot contain consecutive periods")]
    ConsecutivePeriods,
}

/// Object key (path within a bucket)
///
/// Keys become path components under a mountpath, so traversal segments
/// and absolute paths are rejected outright.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Create a new object key
    pub fn new(key: impl Into<String>) -> Result<Self, ObjectKeyError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the object key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(key: &str) -> Result<(), ObjectKeyError> {
        if key.is_empty() {
            return Err(ObjectKeyError::Empty);
        }
        if key.len() > 1024 {
            return Err(ObjectKeyError::TooLong);
        }
        if key.starts_with('/') {
            return Err(ObjectKeyError::Absolute);
        }
        if key.contains('\0') {
            return Err(ObjectKeyError::NulByte);
        }
        if key.split('/').any(|seg| seg == ".." || seg == ".") {
            return Err(ObjectKeyError::Traversal);
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({:?})", self.0)
    }
}

/// Errors that can occur when creating an object key
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectKeyError {
    #[error("object key cannot be empty")]
    Empty,
    #[error("object key cannot exceed 1024 bytes")]
    TooLong,
    #[error("object key cannot be an absolute path")]
    Absolute,
    #[error("object key cannot contain NUL bytes")]
    NulByte,
    #[error("object key cannot contain '.' or '..' segments")]
    Traversal,
}

/// Logical identity of a cached object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectLocator {
    pub bucket: BucketName,
    pub key: ObjectKey,
}

impl ObjectLocator {
    #[must_use]
    pub fn new(bucket: BucketName, key: ObjectKey) -> Self {
        Self { bucket, key }
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Per-mountpath used-capacity thresholds governing eviction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Eviction target: a pass stops once used% drops to this
    pub low_percent: u8,
    /// Eviction trigger: a pass starts once used% reaches this
    pub high_percent: u8,
}

impl Watermarks {
    pub fn new(low_percent: u8, high_percent: u8) -> Result<Self, String> {
        if low_percent >= high_percent || high_percent > 100 {
            return Err(format!(
                "watermarks must satisfy low < high <= 100, got {low_percent}/{high_percent}"
            ));
        }
        Ok(Self {
            low_percent,
            high_percent,
        })
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            low_percent: 75,
            high_percent: 90,
        }
    }
}
