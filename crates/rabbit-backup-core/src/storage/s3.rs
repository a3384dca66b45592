//! Mirror uploads of sealed units to S3 and S3-compatible stores.
//!
//! The mirror only ever writes: each sealed unit is uploaded once under
//! `<prefix>/<unit key>`. Upload failures are reported to the caller, which
//! treats the mirror as best effort.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::StorageBackend;
use crate::error::StorageError;
use crate::{Error, Result};

/// Bucket and connection settings for the upload mirror.
///
/// Unset credentials and region are taken from the `AWS_*` environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Target {
    pub bucket: String,
    /// Key prefix units are uploaded under
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services such as MinIO
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

impl S3Target {
    /// Read a target from `s3://bucket/prefix?region=..&endpoint=..&allow_http=true`
    pub fn from_url(url: &Url) -> Result<Self> {
        let bucket = url.host_str().unwrap_or_default().to_string();
        if bucket.is_empty() {
            return Err(Error::Config(format!("S3 URL has no bucket: {}", url)));
        }

        let query = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };

        Ok(Self {
            bucket,
            prefix: Some(url.path().trim_matches('/').to_string()).filter(|p| !p.is_empty()),
            region: query("region"),
            endpoint: query("endpoint"),
            access_key: None,
            secret_key: None,
            allow_http: query("allow_http").is_some_and(|v| v == "true"),
        })
    }

    /// Object path a unit key is uploaded to
    pub fn object_path(&self, key: &str) -> Path {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => Path::from(format!("{}/{}", prefix, key)),
            _ => Path::from(key),
        }
    }
}

/// Uploads sealed units to an object store bucket
pub struct S3Mirror {
    store: Arc<dyn ObjectStore>,
    target: S3Target,
}

impl S3Mirror {
    /// Build an S3 client for `target`
    pub fn connect(target: S3Target) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&target.bucket);

        if let Some(region) = &target.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &target.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }
        if let Some(access_key) = &target.access_key {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret_key) = &target.secret_key {
            builder = builder.with_secret_access_key(secret_key);
        }
        if target.allow_http {
            builder = builder.with_allow_http(true);
        }

        let store = builder.build().map_err(|e| {
            StorageError::Backend(format!("Failed to create S3 client: {}", e))
        })?;

        info!(
            "Uploading sealed units to s3://{}/{}",
            target.bucket,
            target.prefix.as_deref().unwrap_or("")
        );
        Ok(Self::with_store(target, Arc::new(store)))
    }

    /// Upload through an existing object store client
    pub fn with_store(target: S3Target, store: Arc<dyn ObjectStore>) -> Self {
        Self { store, target }
    }
}

#[async_trait]
impl StorageBackend for S3Mirror {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.target.object_path(key);
        debug!("S3 PUT: {} ({} bytes)", path, data.len());

        self.store
            .put(&path, PutPayload::from_bytes(data))
            .await
            .map_err(|e| StorageError::Backend(format!("S3 PUT {} failed: {}", path, e)))?;
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.target.bucket, self.target.object_path(key))
    }
}
