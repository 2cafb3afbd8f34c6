//! In-process backend for development and tests
//!
//! Behaves like a real backend: reports a checksum with every object and
//! counts fetches, so tests can assert on fill coalescing and inject a
//! wrong checksum to exercise the integrity path.

use crate::{CloudBackend, ObjectBody};
use async_trait::async_trait;
use bytes::Bytes;
use cirrus_common::checksum::sha256_of;
use cirrus_common::{BucketName, Checksum, Error, ObjectKey, Result};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct MemoryBackend {
    objects: DashMap<(String, String), (Bytes, Checksum)>,
    fetches: AtomicU64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object with its real SHA256 checksum
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        let body = body.into();
        let checksum = sha256_of(&body);
        self.objects
            .insert((bucket.to_string(), key.to_string()), (body, checksum));
    }

    /// Store an object that reports the given checksum, matching or not
    pub fn insert_with_checksum(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        checksum: Checksum,
    ) {
        self.objects
            .insert((bucket.to_string(), key.to_string()), (body.into(), checksum));
    }

    /// Number of `get_object` calls served so far
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudBackend for MemoryBackend {
    async fn list_bucket(&self, bucket: &BucketName) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().0 == bucket.as_str())
            .map(|e| e.key().1.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_object(&self, bucket: &BucketName, key: &ObjectKey) -> Result<ObjectBody> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let entry = self
            .objects
            .get(&(bucket.as_str().to_string(), key.as_str().to_string()))
            .ok_or_else(|| Error::Fetch {
                bucket: bucket.as_str().to_string(),
                key: key.as_str().to_string(),
                reason: "object not found".to_string(),
            })?;
        let (body, checksum) = entry.value().clone();
        let length = body.len() as u64;
        // chunked so fills exercise the streaming digest path
        let chunks: Vec<std::io::Result<Bytes>> = body
            .chunks(8 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(ObjectBody {
            stream: futures::stream::iter(chunks).boxed(),
            checksum: Some(checksum),
            length: Some(length),
        })
    }

    async fn put_object(&self, bucket: &BucketName, key: &ObjectKey, body: Bytes) -> Result<()> {
        self.insert(bucket.as_str(), key.as_str(), body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_roundtrip() {
        let backend = MemoryBackend::new();
        backend.insert("b1", "o1", &b"payload"[..]);

        let bucket = BucketName::new_unchecked("b1");
        let body = backend
            .get_object(&bucket, &ObjectKey::new_unchecked("o1"))
            .await
            .unwrap();
        let bytes: Vec<Bytes> = body.stream.try_collect().await.unwrap();
        let joined: Vec<u8> = bytes.concat();
        assert_eq!(joined, b"payload");
        assert_eq!(body.checksum, Some(sha256_of(b"payload")));
        assert_eq!(backend.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_list_sorted_per_bucket() {
        let backend = MemoryBackend::new();
        backend.insert("b1", "zeta", &b"z"[..]);
        backend.insert("b1", "alpha", &b"a"[..]);
        backend.insert("b2", "other", &b"o"[..]);

        let names = backend
            .list_bucket(&BucketName::new_unchecked("b1"))
            .await
            .unwrap();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_missing_object_is_fetch_error() {
        let backend = MemoryBackend::new();
        let err = backend
            .get_object(
                &BucketName::new_unchecked("b1"),
                &ObjectKey::new_unchecked("nope"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
    }
}
