//! S3-backed [`BlobStore`].
//!
//! One JSON document per entry at `<prefix><id_hash>.json`, content-type
//! `application/json`. Works against AWS S3 or any S3-compatible service
//! (MinIO, R2) via the endpoint override.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, error, info, instrument};

use super::BlobStore;
use crate::cache::CacheRecord;
use crate::config::{BlobStoreConfig, ConfigError};

pub struct S3BlobStore {
    client: Client,
    bucket: String,
    config: BlobStoreConfig,
}

impl S3BlobStore {
    pub async fn new(config: BlobStoreConfig) -> Result<Self, ConfigError> {
        let bucket = config.resolve_bucket()?;
        info!(bucket = %bucket, "Initializing S3 blob store");

        let mut aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            aws_config = aws_config.region(aws_config::Region::new(region.clone()));
        }
        let aws_config = aws_config.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint_url) = &config.endpoint_url {
            s3_config = s3_config.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            s3_config = s3_config.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config.build()),
            bucket,
            config,
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn read(&self, id: &str) -> Option<CacheRecord> {
        let key = self.config.object_key(id);

        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let message = e.to_string();
                if message.contains("NoSuchKey") || message.contains("NotFound") {
                    debug!(key, "blob object not found");
                } else {
                    error!(key, error = %message, "blob read failed");
                }
                return None;
            }
        };

        let bytes = match output.body.collect().await {
            Ok(data) => data.to_vec(),
            Err(e) => {
                error!(key, error = %e, "blob body failed to collect");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(key, error = %e, "blob document failed to parse");
                None
            }
        }
    }

    #[instrument(skip(self, record), fields(bucket = %self.bucket))]
    async fn write(&self, id: &str, record: &CacheRecord) -> bool {
        let key = self.config.object_key(id);

        let document = match serde_json::to_vec(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(key, error = %e, "record failed to serialize");
                return false;
            }
        };

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/json")
            .body(aws_sdk_s3::primitives::ByteStream::from(document))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(key, "blob object written");
                true
            }
            Err(e) => {
                error!(key, error = %e, "blob write failed");
                false
            }
        }
    }

    async fn health_check(&self) -> bool {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => true,
            Err(e) => {
                error!(bucket = %self.bucket, error = %e, "blob health check failed");
                false
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
