//! In-process stores. Used by the `memory` backends and throughout the tests.

use super::{MetadataStore, PayloadStore};
use crate::error::{StoreError, StoreResult};
use crate::secret::SecretRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Payload store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn put(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        self.entries.insert(id.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Vec<u8>> {
        self.entries
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.entries.remove(id);
        Ok(())
    }
}

/// Metadata store backed by a concurrent map. `list_expired` scans.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: DashMap<String, SecretRecord>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create(&self, record: &SecretRecord) -> StoreResult<()> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<SecretRecord> {
        self.records
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.records.remove(id);
        Ok(())
    }

    async fn list_expired(&self, before: DateTime<Utc>) -> StoreResult<Vec<SecretRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.value().expires_at <= before)
            .map(|r| r.value().clone())
            .collect())
    }
}
