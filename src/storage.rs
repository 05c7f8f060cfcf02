use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::presigning::PresigningConfig;
use thiserror::Error;
use uuid::Uuid;

/// Presigned URLs stay valid for 10 minutes.
const UPLOAD_URL_TTL: Duration = Duration::from_secs(600);

/// MIME types accepted as delivery evidence, with the extension stored in the key.
const EVIDENCE_TYPES: [(&str, &str); 3] = [
    ("image/jpeg", "jpg"),
    ("image/jpg", "jpg"),
    ("image/png", "png"),
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("could not build presigning config: {0}")]
    Presigning(String),
    #[error("object storage request failed: {0}")]
    Request(String),
}

/// StorageService
///
/// Object storage contract. `S3StorageClient` talks to MinIO or any S3-compatible
/// endpoint; `MockStorageService` stands in for it in tests.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Creates the configured bucket if missing. Only called for `Env::Local`.
    async fn ensure_bucket_exists(&self) -> Result<(), StorageError>;

    /// Returns a time-limited URL the client can PUT `key` to. The request must carry
    /// exactly `content_type`.
    async fn presigned_upload_url(&self, key: &str, content_type: &str)
    -> Result<String, StorageError>;
}

/// S3StorageClient
///
/// `force_path_style(true)` is required by MinIO.
#[derive(Clone)]
pub struct S3StorageClient {
    client: s3::Client,
    bucket_name: String,
}

impl S3StorageClient {
    pub fn new(endpoint: &str, region: &str, access_key: &str, secret_key: &str, bucket: &str) -> Self {
        let credentials = s3::config::Credentials::new(access_key, secret_key, None, None, "static");

        let config = s3::Config::builder()
            .credentials_provider(credentials)
            .endpoint_url(endpoint)
            .region(s3::config::Region::new(region.to_string()))
            .behavior_version_latest()
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(config),
            bucket_name: bucket.to_string(),
        }
    }
}

#[async_trait]
impl StorageService for S3StorageClient {
    async fn ensure_bucket_exists(&self) -> Result<(), StorageError> {
        if self.client.head_bucket().bucket(&self.bucket_name).send().await.is_ok() {
            return Ok(());
        }
        self.client
            .create_bucket()
            .bucket(&self.bucket_name)
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;
        tracing::info!(bucket = %self.bucket_name, "created evidence bucket");
        Ok(())
    }

    async fn presigned_upload_url(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(UPLOAD_URL_TTL)
            .map_err(|e| StorageError::Presigning(e.to_string()))?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket_name)
            .key(sanitize_key(key))
            .content_type(content_type)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        Ok(request.uri().to_string())
    }
}

/// Drops empty, `.` and `..` segments so a key can never climb out of its prefix.
pub fn sanitize_key(key: &str) -> String {
    key.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".." && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// File extension for an accepted evidence content type, or `None` when the type is
/// not an accepted image format.
pub fn evidence_extension(content_type: &str) -> Option<&'static str> {
    let normalized = content_type.trim().to_ascii_lowercase();
    EVIDENCE_TYPES
        .iter()
        .find(|(mime, _)| *mime == normalized)
        .map(|(_, ext)| *ext)
}

/// Key prefix under which every photo of a delivery lives.
pub fn evidence_prefix(delivery_id: i64) -> String {
    format!("evidence/delivery_{delivery_id}/")
}

/// A fresh, collision-free key for a new evidence photo.
pub fn evidence_key(delivery_id: i64, extension: &str) -> String {
    format!("{}{}.{extension}", evidence_prefix(delivery_id), Uuid::new_v4())
}

/// True when `key` (after sanitising) sits directly under the delivery's prefix.
pub fn key_belongs_to(delivery_id: i64, key: &str) -> bool {
    let key = sanitize_key(key);
    key.strip_prefix(&evidence_prefix(delivery_id))
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

/// MockStorageService
///
/// Deterministic stand-in used by the test-suite. `new_failing()` makes every call fail.
#[derive(Clone, Default)]
pub struct MockStorageService {
    pub should_fail: bool,
}

impl MockStorageService {
    pub fn new() -> Self {
        Self { should_fail: false }
    }

    pub fn new_failing() -> Self {
        Self { should_fail: true }
    }
}

#[async_trait]
impl StorageService for MockStorageService {
    async fn ensure_bucket_exists(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn presigned_upload_url(
        &self,
        key: &str,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        if self.should_fail {
            return Err(StorageError::Request("simulated storage outage".to_string()));
        }
        Ok(format!(
            "http://localhost:9000/mock-bucket/{}?signature=fake",
            sanitize_key(key)
        ))
    }
}

pub type StorageState = Arc<dyn StorageService>;
