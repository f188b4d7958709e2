//! Object storage gateway
//!
//! Region-aware S3 access: one SDK client per region, created on first use
//! and reused for the life of the process. Every transfer is bounded by the
//! configured timeout regardless of what the caller does.

use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument};

/// Default bound on one download or upload
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{operation} s3://{bucket}/{key} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        bucket: String,
        key: String,
        after: Duration,
    },

    #[error("get s3://{bucket}/{key}: {message}")]
    Get {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("put s3://{bucket}/{key}: {message}")]
    Put {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("stream s3://{bucket}/{key}: {source}")]
    Stream {
        bucket: String,
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("open upload body {path}: {message}")]
    Body { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// What the store reported after accepting an upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReceipt {
    pub etag: Option<String>,
    pub size_bytes: u64,
}

/// Region-aware object access used by the job handler
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stream an object into `sink`, returning the number of bytes written
    async fn download_to_writer(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> StorageResult<u64>;

    /// Upload a local file as an object
    async fn upload_from_file(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> StorageResult<UploadReceipt>;
}

/// S3 implementation with a per-region client cache
pub struct S3ObjectStore {
    endpoint_url: Option<String>,
    force_path_style: bool,
    timeout: Duration,
    clients: Mutex<HashMap<String, S3Client>>,
}

impl S3ObjectStore {
    pub fn new(config: &StorageConfig) -> Self {
        let timeout = match config.transfer_timeout() {
            t if t.is_zero() => DEFAULT_TRANSFER_TIMEOUT,
            t => t,
        };

        info!(
            endpoint = ?config.endpoint_url,
            force_path_style = config.force_path_style,
            timeout_secs = timeout.as_secs(),
            "S3 object store initialized"
        );

        Self {
            endpoint_url: config
                .endpoint_url
                .clone()
                .filter(|url| !url.trim().is_empty()),
            force_path_style: config.force_path_style,
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Client for `region`, created on first use
    pub async fn client(&self, region: &str) -> S3Client {
        let cached = self.clients.lock().get(region).cloned();
        if let Some(client) = cached {
            return client;
        }

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = self.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if self.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());
        debug!(region, "Created S3 client");

        // A concurrent caller may have won the race; keep whichever landed first
        self.clients
            .lock()
            .entry(region.to_string())
            .or_insert(client)
            .clone()
    }

    pub fn cached_regions(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, sink))]
    async fn download_to_writer(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> StorageResult<u64> {
        let client = self.client(region).await;

        let transfer = async {
            let response = client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| StorageError::Get {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    message: DisplayErrorContext(&e).to_string(),
                })?;

            let mut body_reader = response.body.into_async_read();
            let written = tokio::io::copy(&mut body_reader, sink)
                .await
                .map_err(|source| StorageError::Stream {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    source,
                })?;
            sink.flush().await?;

            Ok::<_, StorageError>(written)
        };

        let written = tokio::time::timeout(self.timeout, transfer)
            .await
            .map_err(|_| StorageError::Timeout {
                operation: "get",
                bucket: bucket.to_string(),
                key: key.to_string(),
                after: self.timeout,
            })??;

        debug!(bytes = written, "Object downloaded");
        Ok(written)
    }

    #[instrument(skip(self, path), fields(path = %path.display()))]
    async fn upload_from_file(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> StorageResult<UploadReceipt> {
        let client = self.client(region).await;

        let transfer = async {
            let size_bytes = tokio::fs::metadata(path).await?.len();

            let body = ByteStream::from_path(path)
                .await
                .map_err(|e| StorageError::Body {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;

            let response = client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(body)
                .content_type(content_type)
                .content_length(size_bytes as i64)
                .send()
                .await
                .map_err(|e| StorageError::Put {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    message: DisplayErrorContext(&e).to_string(),
                })?;

            Ok::<_, StorageError>(UploadReceipt {
                etag: response.e_tag().map(normalize_etag),
                size_bytes,
            })
        };

        let receipt = tokio::time::timeout(self.timeout, transfer)
            .await
            .map_err(|_| StorageError::Timeout {
                operation: "put",
                bucket: bucket.to_string(),
                key: key.to_string(),
                after: self.timeout,
            })??;

        info!(size_bytes = receipt.size_bytes, etag = ?receipt.etag, "Object uploaded");
        Ok(receipt)
    }
}

/// S3 returns the ETag wrapped in quotes
fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}
