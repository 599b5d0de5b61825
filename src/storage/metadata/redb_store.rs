//! Embedded single-file metadata store on top of redb.
//!
//! Records are JSON-encoded into one table. redb transactions are
//! synchronous, so every operation runs on the blocking pool; a write
//! transaction either commits fully or not at all.

use crate::error::{StoreError, StoreResult};
use crate::secret::SecretRecord;
use crate::storage::MetadataStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const SECRETS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

pub struct RedbMetadataStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbMetadataStore {
    /// Open (or create) the database file and make sure the table exists.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let open_path = path.clone();
        let db = tokio::task::spawn_blocking(move || -> Result<Database, redb::Error> {
            let db = Database::create(&open_path)?;
            let write_txn = db.begin_write()?;
            {
                write_txn.open_table(SECRETS_TABLE)?;
            }
            write_txn.commit()?;
            Ok(db)
        })
        .await??;

        info!("Opened metadata database at {}", path.display());
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    /// Run a blocking closure against the database on the blocking pool.
    async fn with_db<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

impl std::fmt::Debug for RedbMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbMetadataStore")
            .field("path", &self.path)
            .finish()
    }
}

fn redb_err(e: impl Into<redb::Error>) -> StoreError {
    StoreError::Redb(e.into())
}

#[async_trait]
impl MetadataStore for RedbMetadataStore {
    async fn create(&self, record: &SecretRecord) -> StoreResult<()> {
        let id = record.id.clone();
        let encoded = serde_json::to_vec(record)?;
        self.with_db(move |db| {
            let write_txn = db.begin_write().map_err(redb_err)?;
            {
                let mut table = write_txn.open_table(SECRETS_TABLE).map_err(redb_err)?;
                table
                    .insert(id.as_str(), encoded.as_slice())
                    .map_err(redb_err)?;
            }
            write_txn.commit().map_err(redb_err)
        })
        .await
    }

    async fn get(&self, id: &str) -> StoreResult<SecretRecord> {
        let id = id.to_string();
        self.with_db(move |db| {
            let read_txn = db.begin_read().map_err(redb_err)?;
            let table = read_txn.open_table(SECRETS_TABLE).map_err(redb_err)?;
            match table.get(id.as_str()).map_err(redb_err)? {
                Some(value) => Ok(serde_json::from_slice(value.value())?),
                None => Err(StoreError::NotFound),
            }
        })
        .await
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.with_db(move |db| {
            let write_txn = db.begin_write().map_err(redb_err)?;
            {
                let mut table = write_txn.open_table(SECRETS_TABLE).map_err(redb_err)?;
                table.remove(id.as_str()).map_err(redb_err)?;
            }
            write_txn.commit().map_err(redb_err)
        })
        .await
    }

    async fn list_expired(&self, before: DateTime<Utc>) -> StoreResult<Vec<SecretRecord>> {
        // No secondary index: scan the table and filter.
        self.with_db(move |db| {
            let read_txn = db.begin_read().map_err(redb_err)?;
            let table = read_txn.open_table(SECRETS_TABLE).map_err(redb_err)?;

            let mut expired = Vec::new();
            for entry in table.iter().map_err(redb_err)? {
                let (_, value) = entry.map_err(redb_err)?;
                let record: SecretRecord = serde_json::from_slice(value.value())?;
                if record.expires_at <= before {
                    expired.push(record);
                }
            }
            Ok(expired)
        })
        .await
    }
}
