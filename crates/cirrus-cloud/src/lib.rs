//! Cirrus Cloud - pluggable object-store backends
//!
//! The cache core consumes exactly three operations: list a bucket, get
//! an object as a byte stream with its reported checksum, and put an
//! object. Any vendor implements this capability; the variant is picked
//! once at start-up from configuration and owns one pooled HTTP client.

mod aws;
mod gcp;
mod memory;

pub use aws::AmazonBackend;
pub use gcp::GoogleBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use bytes::Bytes;
use cirrus_common::config::{CloudConfig, Provider};
use cirrus_common::{BucketName, Checksum, ObjectKey, Result};
use futures::stream::BoxStream;
use std::sync::Arc;

/// An object's body as it leaves a backend
pub struct ObjectBody {
    /// Byte stream of the object content
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
    /// Checksum the backend reported for the object, when it did
    pub checksum: Option<Checksum>,
    /// Content length, when the backend reported it
    pub length: Option<u64>,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("stream", &"<stream>")
            .field("checksum", &self.checksum)
            .field("length", &self.length)
            .finish()
    }
}

/// The capability the cache core consumes
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Object names in a bucket
    async fn list_bucket(&self, bucket: &BucketName) -> Result<Vec<String>>;

    /// Stream an object's bytes together with its reported checksum
    async fn get_object(&self, bucket: &BucketName, key: &ObjectKey) -> Result<ObjectBody>;

    /// Upload an object
    async fn put_object(&self, bucket: &BucketName, key: &ObjectKey, body: Bytes) -> Result<()>;
}

/// Select and construct the configured backend once at start-up
pub fn from_config(cfg: &CloudConfig) -> Result<Arc<dyn CloudBackend>> {
    Ok(match cfg.provider {
        Provider::Amazon => Arc::new(AmazonBackend::new(cfg.endpoint.clone())?),
        Provider::Google => Arc::new(GoogleBackend::new(cfg.endpoint.clone())?),
        Provider::Memory => Arc::new(MemoryBackend::new()),
    })
}

/// Percent-encode a path for use in a backend URL.
///
/// Keeps unreserved characters; `keep_slash` preserves `/` for S3-style
/// object paths, while the GCS JSON API wants it encoded.
pub(crate) fn percent_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        let plain = b.is_ascii_alphanumeric()
            || matches!(b, b'-' | b'_' | b'.' | b'~')
            || (keep_slash && b == b'/');
        if plain {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("a/b c", true), "a/b%20c");
        assert_eq!(percent_encode("a/b c", false), "a%2Fb%20c");
        assert_eq!(percent_encode("plain-key_1.bin~", false), "plain-key_1.bin~");
    }
}
