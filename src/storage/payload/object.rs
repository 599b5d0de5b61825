//! Object-storage payload store (S3 and compatible services).

use crate::config::S3Config;
use crate::error::{StoreError, StoreResult};
use crate::secret::record::is_valid_id;
use crate::storage::PayloadStore;
use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::debug;

/// One object per secret, optionally under a key prefix.
pub struct ObjectPayloadStore {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl ObjectPayloadStore {
    /// Wrap any `object_store` implementation.
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<String>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self { store, prefix }
    }

    /// Connect to an S3-compatible bucket.
    pub fn from_s3(config: &S3Config) -> StoreResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_allow_http(config.allow_http);

        if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            // Self-hosted endpoints (MinIO etc.) generally need path-style requests
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }
        if let (Some(access), Some(secret)) = (&config.access_key, &config.secret_key) {
            builder = builder
                .with_access_key_id(access)
                .with_secret_access_key(secret);
        }

        let s3 = builder.build()?;
        Ok(Self::new(Arc::new(s3), config.prefix.clone()))
    }

    fn location(&self, id: &str) -> StoreResult<Path> {
        if !is_valid_id(id) {
            return Err(StoreError::InvalidKey(id.to_string()));
        }
        Ok(match &self.prefix {
            Some(prefix) => Path::from(format!("{}/{}", prefix, id)),
            None => Path::from(id),
        })
    }
}

impl std::fmt::Debug for ObjectPayloadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPayloadStore")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[async_trait]
impl PayloadStore for ObjectPayloadStore {
    async fn put(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        let location = self.location(id)?;
        self.store
            .put(&location, PutPayload::from(data.to_vec()))
            .await?;
        debug!("Uploaded payload object {}", location);
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Vec<u8>> {
        let location = self.location(id)?;
        match self.store.get(&location).await {
            Ok(result) => Ok(result.bytes().await?.to_vec()),
            Err(object_store::Error::NotFound { .. }) => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let location = self.location(id)?;
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
