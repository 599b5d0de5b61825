//! End-to-end lifecycle tests against the on-disk backends.
//!
//! Payloads live in a temporary directory, metadata in a temporary redb file.
//! Partial failures are injected by wrapping the real metadata store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ephemera::error::{StoreError, StoreResult, VaultError};
use ephemera::secret::{NewSecret, PayloadType, SecretRecord, SecretVault, Sweeper, VaultOptions};
use ephemera::storage::{LocalPayloadStore, MetadataStore, PayloadStore, RedbMetadataStore};
use ephemera::RateGovernor;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

/// Metadata store that can be told to fail creates, or deletes of chosen ids.
struct FaultyMetadata {
    inner: RedbMetadataStore,
    fail_create: AtomicBool,
    fail_delete: Mutex<HashSet<String>>,
}

impl FaultyMetadata {
    fn new(inner: RedbMetadataStore) -> Self {
        Self {
            inner,
            fail_create: AtomicBool::new(false),
            fail_delete: Mutex::new(HashSet::new()),
        }
    }

    fn fail_delete_of(&self, id: &str) {
        self.fail_delete.lock().unwrap().insert(id.to_string());
    }
}

fn injected(what: &str) -> StoreError {
    StoreError::Io(std::io::Error::other(format!("injected {} failure", what)))
}

#[async_trait]
impl MetadataStore for FaultyMetadata {
    async fn create(&self, record: &SecretRecord) -> StoreResult<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(injected("create"));
        }
        self.inner.create(record).await
    }

    async fn get(&self, id: &str) -> StoreResult<SecretRecord> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        if self.fail_delete.lock().unwrap().contains(id) {
            return Err(injected("delete"));
        }
        self.inner.delete(id).await
    }

    async fn list_expired(&self, before: DateTime<Utc>) -> StoreResult<Vec<SecretRecord>> {
        self.inner.list_expired(before).await
    }
}

struct Harness {
    _dir: TempDir,
    payloads: Arc<LocalPayloadStore>,
    metadata: Arc<FaultyMetadata>,
    vault: Arc<SecretVault>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let payloads = Arc::new(LocalPayloadStore::new(dir.path().join("blobs")).await.unwrap());
        let redb = RedbMetadataStore::open(dir.path().join("metadata.redb"))
            .await
            .unwrap();
        let metadata = Arc::new(FaultyMetadata::new(redb));
        let vault = Arc::new(SecretVault::with_options(
            payloads.clone(),
            metadata.clone(),
            VaultOptions {
                compensation_attempts: 2,
                compensation_backoff: Duration::from_millis(1),
            },
        ));
        Self {
            _dir: dir,
            payloads,
            metadata,
            vault,
        }
    }

    fn blob_count(&self) -> usize {
        std::fs::read_dir(self.payloads.root()).unwrap().count()
    }
}

fn secret(id: Option<&str>, payload: &[u8], ttl: Duration) -> NewSecret {
    NewSecret {
        id: id.map(str::to_string),
        file_name: "secret.bin".to_string(),
        content_type: "application/octet-stream".to_string(),
        payload: payload.to_vec(),
        ttl,
        payload_type: PayloadType::File,
        proof_record: b"registration-upload".to_vec(),
    }
}

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn round_trip_returns_exact_payload() {
    let h = Harness::new().await;
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

    let created = h.vault.create(secret(None, &payload, HOUR)).await.unwrap();
    let loaded = h.vault.load(&created.id).await.unwrap();

    assert_eq!(loaded.payload, payload);
    assert_eq!(loaded.record, created);
    assert_eq!(loaded.record.size, 10_000);
    assert_eq!(loaded.record.file_name, "secret.bin");
}

#[tokio::test]
async fn expired_secret_is_deleted_on_load() {
    let h = Harness::new().await;
    let created = h
        .vault
        .create(secret(None, b"brief", Duration::from_millis(1)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(h.vault.load(&created.id).await, Err(VaultError::Expired)));
    assert!(matches!(
        h.vault.metadata(&created.id).await,
        Err(VaultError::NotFound)
    ));
    assert!(h.payloads.get(&created.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn validation_failures_touch_no_store() {
    let h = Harness::new().await;

    assert!(matches!(
        h.vault.create(secret(Some("v-1"), b"", HOUR)).await,
        Err(VaultError::InvalidPayload)
    ));

    let mut no_proof = secret(Some("v-2"), b"data", HOUR);
    no_proof.proof_record.clear();
    assert!(matches!(
        h.vault.create(no_proof).await,
        Err(VaultError::ProofRecordMissing)
    ));

    assert!(matches!(
        h.vault.create(secret(Some("v-3"), b"data", Duration::ZERO)).await,
        Err(VaultError::InvalidTtl)
    ));

    assert_eq!(h.blob_count(), 0);
    assert!(h.metadata.list_expired(Utc::now() + chrono::Duration::days(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn metadata_failure_rolls_back_payload() {
    let h = Harness::new().await;
    h.metadata.fail_create.store(true, Ordering::SeqCst);

    let err = h
        .vault
        .create(secret(Some("rollback"), b"data", HOUR))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("store metadata"));
    assert!(h.payloads.get("rollback").await.unwrap_err().is_not_found());
    assert_eq!(h.blob_count(), 0);
    assert!(h.vault.pending_orphans().is_empty());
}

#[tokio::test]
async fn delete_of_unknown_id_succeeds() {
    let h = Harness::new().await;
    assert_ok!(h.vault.delete("never-created").await);
    assert_ok!(h.vault.delete("never-created").await);
}

#[tokio::test]
async fn sweep_continues_past_failures() {
    let h = Harness::new().await;
    for id in ["exp-a", "exp-b", "exp-c"] {
        h.vault
            .create(secret(Some(id), id.as_bytes(), Duration::from_millis(1)))
            .await
            .unwrap();
    }
    for id in ["live-a", "live-b"] {
        h.vault.create(secret(Some(id), id.as_bytes(), HOUR)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.metadata.fail_delete_of("exp-b");

    let err = assert_err!(Sweeper::new(h.vault.clone()).run_sweep(Utc::now()).await);
    assert_eq!(err.failed_ids(), vec!["exp-b"]);
    match &err {
        VaultError::Sweep {
            attempted, removed, ..
        } => {
            assert_eq!(*attempted, 3);
            assert_eq!(*removed, 2);
        }
        other => panic!("unexpected error: {other}"),
    }

    // The failed item is untouched, the others are gone
    assert!(h.metadata.get("exp-b").await.is_ok());
    assert!(h.payloads.get("exp-b").await.is_ok());
    for id in ["exp-a", "exp-c"] {
        assert!(h.metadata.get(id).await.unwrap_err().is_not_found());
        assert!(h.payloads.get(id).await.unwrap_err().is_not_found());
    }
    for id in ["live-a", "live-b"] {
        assert_eq!(h.vault.load(id).await.unwrap().payload, id.as_bytes());
    }
}

#[tokio::test]
async fn concurrent_creates_are_independent() {
    let h = Harness::new().await;
    let creates = (0..16).map(|i| {
        let vault = h.vault.clone();
        async move {
            vault
                .create(secret(Some(format!("c-{i}").as_str()), format!("payload {i}").as_bytes(), HOUR))
                .await
        }
    });
    let results = join_all(creates).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(h.blob_count(), 16);

    let loads = join_all((0..16).map(|i| {
        let vault = h.vault.clone();
        async move { vault.load(&format!("c-{i}")).await }
    }))
    .await;
    for (i, loaded) in loads.into_iter().enumerate() {
        assert_eq!(loaded.unwrap().payload, format!("payload {i}").as_bytes());
    }
}

#[tokio::test]
async fn reveal_and_sweep_race_never_returns_expired_data() {
    let h = Harness::new().await;
    let created = h
        .vault
        .create(secret(None, b"racy", Duration::from_millis(5)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sweeper = Sweeper::new(h.vault.clone());
    let (load, sweep) = tokio::join!(h.vault.load(&created.id), sweeper.run_sweep(Utc::now()));

    assert!(matches!(
        load,
        Err(VaultError::Expired) | Err(VaultError::NotFound)
    ));
    // Whichever side deleted first, the other treats the delete as a no-op
    assert!(sweep.is_ok());
    assert_eq!(h.blob_count(), 0);
}

#[test]
fn rate_governor_limits_each_caller() {
    let governor = RateGovernor::new(2, Duration::from_secs(1));
    let now = Instant::now();

    let a1 = governor.allow_at("A", now);
    let a2 = governor.allow_at("A", now);
    let a3 = governor.allow_at("A", now);
    let b1 = governor.allow_at("B", now);

    assert!(a1.admitted && a1.remaining == 1);
    assert!(a2.admitted && a2.remaining == 0);
    assert!(!a3.admitted && a3.retry_after > Duration::ZERO);
    assert!(b1.admitted && b1.remaining == 1);
}
