//! Payload and metadata storage.
//!
//! The vault talks to two independent stores:
//!
//! - a [`PayloadStore`] holding the opaque ciphertext bytes, one entry per id
//! - a [`MetadataStore`] holding the JSON [`SecretRecord`] for the same id
//!
//! Neither store knows about the other and there is no shared transaction;
//! pairing is maintained by [`crate::secret::SecretVault`]. Concrete backends
//! are chosen from configuration at startup.

pub mod memory;
pub mod metadata;
pub mod payload;

pub use memory::{MemoryMetadataStore, MemoryPayloadStore};
pub use metadata::{RedbMetadataStore, RedisMetadataStore};
pub use payload::{LocalPayloadStore, ObjectPayloadStore};

use crate::config::{MetadataBackend, PayloadBackend, StorageConfig};
use crate::error::StoreResult;
use crate::secret::SecretRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// Durable byte storage keyed by secret id.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Store `data` under `id`, replacing any existing entry.
    async fn put(&self, id: &str, data: &[u8]) -> StoreResult<()>;

    /// Return the exact bytes stored under `id`, or `StoreError::NotFound`.
    async fn get(&self, id: &str) -> StoreResult<Vec<u8>>;

    /// Remove the entry. Deleting an absent id succeeds.
    async fn delete(&self, id: &str) -> StoreResult<()>;
}

/// Durable record storage keyed by secret id.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist `record` under `record.id`, silently replacing any existing one.
    async fn create(&self, record: &SecretRecord) -> StoreResult<()>;

    async fn get(&self, id: &str) -> StoreResult<SecretRecord>;

    /// Remove the record. Deleting an absent id succeeds.
    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// Every record with `expires_at <= before`.
    async fn list_expired(&self, before: DateTime<Utc>) -> StoreResult<Vec<SecretRecord>>;
}

pub type SharedPayloadStore = Arc<dyn PayloadStore>;
pub type SharedMetadataStore = Arc<dyn MetadataStore>;

/// Build the payload backend selected in configuration.
pub async fn build_payload_store(config: &StorageConfig) -> StoreResult<SharedPayloadStore> {
    let store: SharedPayloadStore = match config.payload_backend {
        PayloadBackend::Local => {
            info!("Payload store: local directory {}", config.payload_dir);
            Arc::new(LocalPayloadStore::new(&config.payload_dir).await?)
        }
        PayloadBackend::S3 => {
            info!("Payload store: S3 bucket {}", config.s3.bucket);
            Arc::new(ObjectPayloadStore::from_s3(&config.s3)?)
        }
        PayloadBackend::Memory => {
            info!("Payload store: in-memory (data is lost on restart)");
            Arc::new(MemoryPayloadStore::new())
        }
    };
    Ok(store)
}

/// Build the metadata backend selected in configuration.
pub async fn build_metadata_store(config: &StorageConfig) -> StoreResult<SharedMetadataStore> {
    let store: SharedMetadataStore = match config.metadata_backend {
        MetadataBackend::Redb => {
            info!("Metadata store: redb file {}", config.redb_path);
            Arc::new(RedbMetadataStore::open(&config.redb_path).await?)
        }
        MetadataBackend::Redis => {
            info!("Metadata store: redis (prefix {})", config.redis.key_prefix);
            Arc::new(RedisMetadataStore::connect(&config.redis.url, &config.redis.key_prefix).await?)
        }
        MetadataBackend::Memory => {
            info!("Metadata store: in-memory (data is lost on restart)");
            Arc::new(MemoryMetadataStore::new())
        }
    };
    Ok(store)
}
