//! Google Cloud Storage backend
//!
//! Listing goes through the JSON API with page tokens; object reads use
//! the path-style download endpoint, which reports a crc32c in the
//! `x-goog-hash` header. Same auth posture as the S3 backend: ambient
//! or anonymous, credential management is out of scope.

use crate::{CloudBackend, ObjectBody, percent_encode};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use cirrus_common::{BucketName, Checksum, Error, ObjectKey, Result};
use futures::TryStreamExt;
use serde::Deserialize;
use tracing::debug;

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// GCS backend with one pooled client shared across requests
pub struct GoogleBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl GoogleBackend {
    pub fn new(endpoint: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::configuration(format!("gcs client: {e}")))?;
        let endpoint = endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

/// objects.list response subset
#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
}

#[async_trait]
impl CloudBackend for GoogleBackend {
    async fn list_bucket(&self, bucket: &BucketName) -> Result<Vec<String>> {
        let url = format!("{}/storage/v1/b/{}/o", self.endpoint, bucket.as_str());
        let mut names = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut req = self.client.get(&url);
            if let Some(t) = &token {
                req = req.query(&[("pageToken", t.as_str())]);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| list_err(bucket, e.to_string()))?;
            if !resp.status().is_success() {
                return Err(list_err(bucket, format!("status {}", resp.status())));
            }
            let page: ListResponse = resp
                .json()
                .await
                .map_err(|e| list_err(bucket, format!("bad listing JSON: {e}")))?;

            names.extend(page.items.into_iter().map(|i| i.name));
            match page.next_page_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        debug!(bucket = %bucket, count = names.len(), "listed bucket");
        Ok(names)
    }

    async fn get_object(&self, bucket: &BucketName, key: &ObjectKey) -> Result<ObjectBody> {
        let url = format!(
            "{}/{}/{}",
            self.endpoint,
            bucket.as_str(),
            percent_encode(key.as_str(), true)
        );
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(bucket, key, e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(fetch_err(bucket, key, "object not found (404)"));
        }
        if !resp.status().is_success() {
            return Err(fetch_err(bucket, key, format!("status {}", resp.status())));
        }

        let checksum = resp
            .headers()
            .get("x-goog-hash")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_goog_hash_crc32c);
        let length = resp.content_length();
        let stream = resp.bytes_stream().map_err(std::io::Error::other);

        Ok(ObjectBody {
            stream: Box::pin(stream),
            checksum,
            length,
        })
    }

    async fn put_object(&self, bucket: &BucketName, key: &ObjectKey, body: Bytes) -> Result<()> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint,
            bucket.as_str()
        );
        let resp = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", key.as_str())])
            .body(body)
            .send()
            .await
            .map_err(|e| fetch_err(bucket, key, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fetch_err(bucket, key, format!("status {}", resp.status())));
        }
        Ok(())
    }
}

/// `x-goog-hash: crc32c=<b64>,md5=<b64>` - the crc32c part is a
/// big-endian u32
fn parse_goog_hash_crc32c(value: &str) -> Option<Checksum> {
    for part in value.split(',') {
        let part = part.trim();
        if let Some(encoded) = part.strip_prefix("crc32c=") {
            let decoded = BASE64.decode(encoded).ok()?;
            let bytes: [u8; 4] = decoded.try_into().ok()?;
            return Some(Checksum::Crc32c(u32::from_be_bytes(bytes)));
        }
    }
    None
}

fn fetch_err(bucket: &BucketName, key: &ObjectKey, reason: impl Into<String>) -> Error {
    Error::Fetch {
        bucket: bucket.as_str().to_string(),
        key: key.as_str().to_string(),
        reason: reason.into(),
    }
}

fn list_err(bucket: &BucketName, reason: impl Into<String>) -> Error {
    Error::ListBucket {
        bucket: bucket.as_str().to_string(),
        reason: reason.into(),
    }
}
