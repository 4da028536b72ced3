//! S3-API blob store back-ends: plain S3 and MinIO behind a custom endpoint.

use async_trait::async_trait;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::S3Config;

use super::{BlobError, BlobStore};

const CREDENTIALS_PROVIDER_NAME: &str = "docflow-static";

fn classify<E>(err: SdkError<E>) -> BlobError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match err.code() {
        Some("NoSuchKey") | Some("NotFound") | Some("NoSuchBucket") => {
            BlobError::NotFound(err.to_string())
        }
        Some("AccessDenied")
        | Some("InvalidAccessKeyId")
        | Some("SignatureDoesNotMatch")
        | Some("ExpiredToken") => BlobError::Auth(err.to_string()),
        _ => BlobError::Io(err.to_string()),
    }
}

async fn build_client(cfg: &S3Config) -> Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = cfg.region.clone() {
        loader = loader.region(Region::new(region));
    }
    let shared = loader.load().await;

    let mut builder = S3ConfigBuilder::from(&shared);
    if let Some(endpoint) = &cfg.endpoint_url {
        builder = builder.endpoint_url(endpoint);
    }
    if cfg.force_path_style {
        builder = builder.force_path_style(true);
    }
    if let (Some(access), Some(secret)) = (&cfg.access_key, &cfg.secret_key) {
        builder = builder.credentials_provider(Credentials::new(
            access.clone(),
            secret.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER_NAME,
        ));
    }

    Client::from_conf(builder.build())
}

/// Shared bucket operations; both back-ends delegate here.
#[derive(Debug, Clone)]
struct Bucket {
    client: Client,
    name: String,
}

impl Bucket {
    async fn put(&self, data: Bytes, key: &str) -> Result<String, BlobError> {
        self.client
            .put_object()
            .bucket(&self.name)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(classify)?;
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.name)
            .key(key)
            .send()
            .await
            .map_err(classify)?;

        let aggregated = output
            .body
            .collect()
            .await
            .map_err(|err| BlobError::Io(err.to_string()))?;
        Ok(aggregated.into_bytes())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(&self.name)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn cleanup_before(&self, threshold: DateTime<Utc>) -> Result<u64, BlobError> {
        let cutoff = threshold.timestamp();
        let mut deleted = 0u64;

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.name)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(classify)?;
            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let Some(modified) = object.last_modified() else {
                    continue;
                };
                if modified.secs() >= cutoff {
                    continue;
                }
                match self.delete(key).await {
                    Ok(()) => {
                        deleted += 1;
                        tracing::info!(key, "deleted expired object");
                    }
                    Err(err) => {
                        tracing::warn!(key, %err, "failed to delete expired object");
                    }
                }
            }
        }

        Ok(deleted)
    }

    async fn ensure_exists(&self) -> Result<(), BlobError> {
        let head = self.client.head_bucket().bucket(&self.name).send().await;
        match head {
            Ok(_) => Ok(()),
            Err(err) => {
                // HEAD responses carry no error body; probe the typed variant.
                let service_err = err.into_service_error();
                if !service_err.is_not_found() {
                    return Err(BlobError::Io(service_err.to_string()));
                }
                self.client
                    .create_bucket()
                    .bucket(&self.name)
                    .send()
                    .await
                    .map_err(classify)?;
                tracing::info!(bucket = %self.name, "created missing bucket");
                Ok(())
            }
        }
    }
}

/// Object storage against AWS S3 proper. Credentials resolve through the
/// standard provider chain unless the config carries a static pair.
#[derive(Debug, Clone)]
pub struct S3BlobStore {
    bucket: Bucket,
}

impl S3BlobStore {
    pub async fn connect(cfg: &S3Config) -> Result<Self, BlobError> {
        let client = build_client(cfg).await;
        let bucket = Bucket {
            client,
            name: cfg.bucket.clone(),
        };
        // Verify reachability and permissions up front.
        bucket
            .client
            .head_bucket()
            .bucket(&bucket.name)
            .send()
            .await
            .map_err(classify)?;
        Ok(Self { bucket })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, data: Bytes, key: &str) -> Result<String, BlobError> {
        self.bucket.put(data, key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        self.bucket.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.bucket.delete(key).await
    }

    async fn cleanup_before(&self, threshold: DateTime<Utc>) -> Result<u64, BlobError> {
        self.bucket.cleanup_before(threshold).await
    }
}

/// Object storage against a MinIO deployment: custom endpoint, path-style
/// addressing, and the bucket created on boot when absent.
#[derive(Debug, Clone)]
pub struct MinioBlobStore {
    bucket: Bucket,
}

impl MinioBlobStore {
    pub async fn connect(cfg: &S3Config) -> Result<Self, BlobError> {
        let client = build_client(cfg).await;
        let bucket = Bucket {
            client,
            name: cfg.bucket.clone(),
        };
        bucket.ensure_exists().await?;
        Ok(Self { bucket })
    }
}

#[async_trait]
impl BlobStore for MinioBlobStore {
    async fn put(&self, data: Bytes, key: &str) -> Result<String, BlobError> {
        self.bucket.put(data, key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        self.bucket.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.bucket.delete(key).await
    }

    async fn cleanup_before(&self, threshold: DateTime<Utc>) -> Result<u64, BlobError> {
        self.bucket.cleanup_before(threshold).await
    }
}
