use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from the object storage backend
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("failed to presign {method} for key {key}: {message}")]
    Presign {
        method: &'static str,
        key: String,
        message: String,
    },

    #[error("object store request failed for key {key}: {message}")]
    Request { key: String, message: String },
}

/// A time-limited, method-scoped credential against one object key
#[derive(Debug, Clone, Serialize)]
pub struct PresignedRequest {
    /// The presigned URL
    pub url: String,
    /// URL expiration time
    pub expires_at: DateTime<Utc>,
}

/// Object storage as the coordinator needs it: put/head by key plus
/// time-limited, single-key, method-scoped credentials. No listing, no
/// deletion, no server-side dedup — the ledger owns dedup.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Mint a PUT-scoped presigned URL for one object key.
    async fn presign_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<PresignedRequest, ObjectStoreError>;

    /// Mint a GET-scoped presigned URL for one object key.
    async fn presign_download(&self, key: &str) -> Result<PresignedRequest, ObjectStoreError>;

    /// Write bytes directly (server-side selfie intake).
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Whether the object currently resolves.
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;

    /// Durable locator recorded in metadata (never time-limited).
    fn locator(&self, key: &str) -> String;
}

/// S3-compatible photo store
pub struct S3PhotoStore {
    client: S3Client,
    bucket: String,
    upload_expiry: Duration,
    download_expiry: Duration,
}

impl S3PhotoStore {
    /// Create a new photo store
    pub async fn new(config: &S3Config) -> Result<Self, ObjectStoreError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/Storj-style gateways
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 photo store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            upload_expiry: config.upload_url_expiry(),
            download_expiry: config.download_url_expiry(),
        })
    }

    fn expiry_timestamp(expiry: Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(expiry.as_secs() as i64)
    }
}

#[async_trait]
impl ObjectStore for S3PhotoStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn presign_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        let presigning_config =
            PresigningConfig::expires_in(self.upload_expiry).map_err(|e| {
                ObjectStoreError::Presign {
                    method: "PUT",
                    key: key.to_string(),
                    message: e.to_string(),
                }
            })?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning_config)
            .await
            .map_err(|e| ObjectStoreError::Presign {
                method: "PUT",
                key: key.to_string(),
                message: e.to_string(),
            })?;

        debug!("presigned upload URL issued");

        Ok(PresignedRequest {
            url: presigned.uri().to_string(),
            expires_at: Self::expiry_timestamp(self.upload_expiry),
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn presign_download(&self, key: &str) -> Result<PresignedRequest, ObjectStoreError> {
        let presigning_config =
            PresigningConfig::expires_in(self.download_expiry).map_err(|e| {
                ObjectStoreError::Presign {
                    method: "GET",
                    key: key.to_string(),
                    message: e.to_string(),
                }
            })?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| ObjectStoreError::Presign {
                method: "GET",
                key: key.to_string(),
                message: e.to_string(),
            })?;

        Ok(PresignedRequest {
            url: presigned.uri().to_string(),
            expires_at: Self::expiry_timestamp(self.download_expiry),
        })
    }

    #[instrument(skip(self, data), fields(key = %key, size_bytes = data.len()))]
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        debug!("object uploaded");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(ObjectStoreError::Request {
                        key: key.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    fn locator(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}
