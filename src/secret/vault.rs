//! The secret vault: keeps the payload store and the metadata store paired.
//!
//! Writes go payload first, then metadata; deletes go metadata first, then
//! payload. A reader that finds a live record can therefore expect its
//! payload to exist, and a payload without a record is never served.
//!
//! There is no shared transaction between the two stores. When the metadata
//! write of a create fails, the already-written payload is removed again
//! (the compensating step). If that removal keeps failing the id is parked in
//! an in-memory reconciliation list, which [`SecretVault::reconcile`] drains.
//!
//! Every step that writes or removes a given id (create, delete, expiry and
//! reconciliation) runs under that id's lock, so no two of them interleave.

use super::record::{is_valid_id, NewSecret, RevealedSecret, SecretRecord};
use crate::config::StorageConfig;
use crate::error::{StoreError, VaultError, VaultResult};
use crate::storage::{SharedMetadataStore, SharedPayloadStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Tuning for the compensating payload delete.
#[derive(Debug, Clone)]
pub struct VaultOptions {
    /// Total delete attempts before the id goes to the reconciliation list
    pub compensation_attempts: u32,
    /// Delay before the second attempt, doubled for each one after
    pub compensation_backoff: Duration,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            compensation_attempts: 3,
            compensation_backoff: Duration::from_millis(50),
        }
    }
}

impl VaultOptions {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            compensation_attempts: config.compensation_attempts.max(1),
            compensation_backoff: Duration::from_millis(config.compensation_backoff_ms),
        }
    }
}

pub struct SecretVault {
    payloads: SharedPayloadStore,
    metadata: SharedMetadataStore,
    options: VaultOptions,
    /// Payloads whose compensating delete failed, with the time they were parked
    orphans: DashMap<String, DateTime<Utc>>,
    /// Per-id locks, present only while someone holds or waits for one
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Exclusive hold on one secret id.
struct IdGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left: nobody is waiting
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl SecretVault {
    pub fn new(payloads: SharedPayloadStore, metadata: SharedMetadataStore) -> Self {
        Self::with_options(payloads, metadata, VaultOptions::default())
    }

    pub fn with_options(
        payloads: SharedPayloadStore,
        metadata: SharedMetadataStore,
        options: VaultOptions,
    ) -> Self {
        Self {
            payloads,
            metadata,
            options,
            orphans: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Store a new secret and return its record (without the payload).
    ///
    /// Validation runs before any store is touched: proof record, id, TTL,
    /// then payload. A caller-supplied id that names a live secret fails with
    /// `AlreadyExists`; one that names an expired secret is purged first.
    pub async fn create(&self, input: NewSecret) -> VaultResult<SecretRecord> {
        if input.proof_record.is_empty() {
            return Err(VaultError::ProofRecordMissing);
        }

        let supplied_id = input
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let id = match &supplied_id {
            Some(id) if !is_valid_id(id) => return Err(VaultError::InvalidId(id.clone())),
            Some(id) => id.clone(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        if input.ttl.is_zero() {
            return Err(VaultError::InvalidTtl);
        }
        if input.payload.is_empty() {
            return Err(VaultError::InvalidPayload);
        }

        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(input.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or(VaultError::InvalidTtl)?;

        let _guard = self.lock_id(&id).await;
        if supplied_id.is_some() {
            self.ensure_vacant(&id).await?;
        }

        let record = SecretRecord {
            id: id.clone(),
            file_name: input.file_name,
            content_type: input.content_type,
            size: input.payload.len() as u64,
            expires_at,
            payload_type: input.payload_type,
            proof_record: input.proof_record,
        };

        if let Err(e) = self.payloads.put(&id, &input.payload).await {
            error!(secret_id = %id, error = %e, "Failed to store payload");
            return Err(VaultError::backend("store payload", e));
        }

        if let Err(e) = self.metadata.create(&record).await {
            error!(secret_id = %id, error = %e, "Failed to store metadata, removing payload");
            self.compensate(&id).await;
            return Err(VaultError::backend("store metadata", e));
        }

        // A retry with the same id may have left it parked from an earlier failure
        self.orphans.remove(&id);

        info!(
            secret_id = %id,
            size = record.size,
            payload_type = %record.payload_type,
            expires_at = %record.expires_at,
            "Secret created"
        );
        Ok(record)
    }

    /// Load metadata and payload of a live secret.
    ///
    /// An expired secret is deleted on the spot and reported as `Expired`.
    /// A payload failure after the record was found live is returned as-is
    /// and leaves the secret in place.
    pub async fn load(&self, id: &str) -> VaultResult<RevealedSecret> {
        let record = self.live_record(id).await?;
        let payload = self.payloads.get(id).await.map_err(|e| {
            error!(secret_id = %id, error = %e, "Failed to load payload of live secret");
            VaultError::backend("load payload", e)
        })?;
        debug!(secret_id = %id, "Secret loaded");
        Ok(RevealedSecret { record, payload })
    }

    /// Expiry-checked metadata lookup that never touches the payload store.
    pub async fn metadata(&self, id: &str) -> VaultResult<SecretRecord> {
        self.live_record(id).await
    }

    /// Remove a secret: metadata first, then payload. Absent ids succeed.
    pub async fn delete(&self, id: &str) -> VaultResult<()> {
        check_id(id)?;
        let _guard = self.lock_id(id).await;
        self.remove(id).await
    }

    /// Remove an expired secret, provided the id still holds exactly `record`.
    ///
    /// Returns `false` without touching anything when the id has since been
    /// reused for another secret. An id with no metadata left only gets its
    /// payload removed.
    pub async fn purge_expired(&self, record: &SecretRecord) -> VaultResult<bool> {
        let id = record.id.as_str();
        check_id(id)?;
        let _guard = self.lock_id(id).await;

        match self.metadata.get(id).await {
            Ok(current) if current == *record => {
                self.remove(id).await?;
                Ok(true)
            }
            Ok(_) => {
                debug!(secret_id = %id, "Id was reused since it expired, leaving the new secret");
                Ok(false)
            }
            Err(StoreError::NotFound) => {
                self.payloads
                    .delete(id)
                    .await
                    .map_err(|e| VaultError::backend("delete payload", e))?;
                Ok(true)
            }
            Err(e) => Err(VaultError::backend("load metadata", e)),
        }
    }

    /// Caller holds the id lock.
    async fn remove(&self, id: &str) -> VaultResult<()> {
        self.metadata
            .delete(id)
            .await
            .map_err(|e| VaultError::backend("delete metadata", e))?;
        self.payloads
            .delete(id)
            .await
            .map_err(|e| VaultError::backend("delete payload", e))?;
        debug!(secret_id = %id, "Secret deleted");
        Ok(())
    }

    /// Every record with `expires_at <= cutoff`.
    pub async fn expired_before(&self, cutoff: DateTime<Utc>) -> VaultResult<Vec<SecretRecord>> {
        self.metadata
            .list_expired(cutoff)
            .await
            .map_err(|e| VaultError::backend("list expired metadata", e))
    }

    /// Retry deletion of parked orphan payloads.
    ///
    /// Ids whose metadata exists again are dropped from the list without
    /// touching the payload. Returns the number of orphans resolved.
    pub async fn reconcile(&self) -> usize {
        let parked: Vec<String> = self.orphans.iter().map(|e| e.key().clone()).collect();
        if parked.is_empty() {
            return 0;
        }

        let mut resolved = 0;
        for id in parked {
            let _guard = self.lock_id(&id).await;
            // A create that ran while we waited may have settled it already
            if !self.orphans.contains_key(&id) {
                continue;
            }
            match self.metadata.get(&id).await {
                Ok(_) => {
                    debug!(secret_id = %id, "Parked payload is paired again, dropping from reconciliation");
                    self.orphans.remove(&id);
                    resolved += 1;
                }
                Err(StoreError::NotFound) => match self.payloads.delete(&id).await {
                    Ok(()) => {
                        info!(secret_id = %id, "Orphan payload removed");
                        self.orphans.remove(&id);
                        resolved += 1;
                    }
                    Err(e) => {
                        warn!(secret_id = %id, error = %e, "Orphan payload still cannot be removed");
                    }
                },
                Err(e) => {
                    warn!(secret_id = %id, error = %e, "Cannot check metadata of parked payload");
                }
            }
        }
        resolved
    }

    /// Ids currently waiting in the reconciliation list.
    pub fn pending_orphans(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.orphans.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    async fn live_record(&self, id: &str) -> VaultResult<SecretRecord> {
        check_id(id)?;
        let record = match self.metadata.get(id).await {
            Ok(record) => record,
            Err(StoreError::NotFound) => return Err(VaultError::NotFound),
            Err(e) => return Err(VaultError::backend("load metadata", e)),
        };

        if !record.is_live_at(Utc::now()) {
            info!(secret_id = %id, "Secret expired on access, deleting");
            // Failures are logged only; the sweeper picks up whatever is left
            if let Err(e) = self.purge_expired(&record).await {
                error!(secret_id = %id, error = %e, "Failed to delete expired secret");
            }
            return Err(VaultError::Expired);
        }
        Ok(record)
    }

    async fn lock_id(&self, id: &str) -> IdGuard<'_> {
        let lock = Arc::clone(&self.locks.entry(id.to_string()).or_default());
        let guard = lock.lock_owned().await;
        IdGuard {
            locks: &self.locks,
            id: id.to_string(),
            guard: Some(guard),
        }
    }

    /// Caller holds the id lock.
    async fn ensure_vacant(&self, id: &str) -> VaultResult<()> {
        match self.metadata.get(id).await {
            Ok(existing) if existing.is_live_at(Utc::now()) => Err(VaultError::AlreadyExists),
            Ok(_) => {
                debug!(secret_id = %id, "Purging expired secret before reuse of its id");
                self.remove(id).await
            }
            Err(StoreError::NotFound) => Ok(()),
            Err(e) => Err(VaultError::backend("load metadata", e)),
        }
    }

    /// Caller holds the id lock.
    async fn compensate(&self, id: &str) {
        let attempts = self.options.compensation_attempts.max(1);
        let mut delay = self.options.compensation_backoff;

        for attempt in 1..=attempts {
            match self.payloads.delete(id).await {
                Ok(()) => {
                    debug!(secret_id = %id, attempt, "Compensating payload delete succeeded");
                    self.orphans.remove(id);
                    return;
                }
                Err(e) => {
                    warn!(secret_id = %id, attempt, error = %e, "Compensating payload delete failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        error!(
            secret_id = %id,
            attempts,
            "Compensation exhausted, payload parked for reconciliation"
        );
        self.orphans.insert(id.to_string(), Utc::now());
    }
}

fn check_id(id: &str) -> VaultResult<()> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(VaultError::InvalidId(id.to_string()))
    }
}
