//! Amazon S3 backend
//!
//! Speaks the S3 REST API path-style against a configurable endpoint.
//! Checksums come from `x-amz-checksum-sha256`, requested by sending
//! `x-amz-checksum-mode: ENABLED`; objects uploaded without checksum
//! metadata yield none and are installed unverified. Credential handling
//! is out of scope here - requests go out with ambient/anonymous auth.

use crate::{CloudBackend, ObjectBody, percent_encode};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use cirrus_common::{BucketName, Checksum, Error, ObjectKey, Result};
use futures::TryStreamExt;
use serde::Deserialize;
use tracing::debug;

const DEFAULT_ENDPOINT: &str = "https://s3.amazonaws.com";

/// S3 backend with one pooled client shared across requests
pub struct AmazonBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl AmazonBackend {
    pub fn new(endpoint: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::configuration(format!("s3 client: {e}")))?;
        let endpoint = endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn object_url(&self, bucket: &BucketName, key: &ObjectKey) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            bucket.as_str(),
            percent_encode(key.as_str(), true)
        )
    }
}

/// ListObjectsV2 response subset
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListEntry>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
}

#[async_trait]
impl CloudBackend for AmazonBackend {
    async fn list_bucket(&self, bucket: &BucketName) -> Result<Vec<String>> {
        let url = format!("{}/{}", self.endpoint, bucket.as_str());
        let mut names = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![("list-type", "2".to_string())];
            if let Some(t) = &token {
                query.push(("continuation-token", t.clone()));
            }
            let resp = self
                .client
                .get(&url)
                .query(&query)
                .send()
                .await
                .map_err(|e| list_err(bucket, e.to_string()))?;
            if !resp.status().is_success() {
                return Err(list_err(bucket, format!("status {}", resp.status())));
            }
            let text = resp
                .text()
                .await
                .map_err(|e| list_err(bucket, e.to_string()))?;
            let parsed: ListBucketResult = quick_xml::de::from_str(&text)
                .map_err(|e| list_err(bucket, format!("bad listing XML: {e}")))?;

            names.extend(parsed.contents.into_iter().map(|c| c.key));
            if parsed.is_truncated {
                token = parsed.next_continuation_token;
                if token.is_none() {
                    return Err(list_err(bucket, "truncated listing without token"));
                }
            } else {
                break;
            }
        }
        debug!(bucket = %bucket, count = names.len(), "listed bucket");
        Ok(names)
    }

    async fn get_object(&self, bucket: &BucketName, key: &ObjectKey) -> Result<ObjectBody> {
        let resp = self
            .client
            .get(self.object_url(bucket, key))
            .header("x-amz-checksum-mode", "ENABLED")
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
            .get("x-amz-checksum-sha256")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_sha256_b64);
        let length = resp.content_length();
        let stream = resp.bytes_stream().map_err(std::io::Error::other);

        Ok(ObjectBody {
            stream: Box::pin(stream),
            checksum,
            length,
        })
    }

    async fn put_object(&self, bucket: &BucketName, key: &ObjectKey, body: Bytes) -> Result<()> {
        let resp = self
            .client
            .put(self.object_url(bucket, key))
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

fn parse_sha256_b64(value: &str) -> Option<Checksum> {
    let decoded = BASE64.decode(value).ok()?;
    let digest: [u8; 32] = decoded.try_into().ok()?;
    Some(Checksum::Sha256(digest))
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
