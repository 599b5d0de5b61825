//! Active expiry: purge everything past its TTL on a fixed cadence.
//!
//! Reads already delete expired secrets lazily; the sweep catches the ones
//! nobody asks for again.

use super::vault::SecretVault;
use crate::error::{SweepFailure, VaultError, VaultResult};
use crate::schedule::spawn_periodic;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Outcome of a sweep in which no item failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub removed: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    vault: Arc<SecretVault>,
}

impl Sweeper {
    pub fn new(vault: Arc<SecretVault>) -> Self {
        Self { vault }
    }

    /// Delete every secret that expired at or before `cutoff`.
    ///
    /// A failing item never stops the batch. When any item fails the whole
    /// call returns `VaultError::Sweep` listing each failed id. An id reused
    /// for a new secret since the listing is skipped and not counted.
    pub async fn run_sweep(&self, cutoff: DateTime<Utc>) -> VaultResult<SweepReport> {
        let expired = self.vault.expired_before(cutoff).await?;
        let attempted = expired.len();
        let mut removed = 0;
        let mut failures = Vec::new();

        for record in expired {
            match self.vault.purge_expired(&record).await {
                Ok(true) => {
                    info!(secret_id = %record.id, "Expired secret removed");
                    removed += 1;
                }
                Ok(false) => debug!(secret_id = %record.id, "Expired id was reused, skipped"),
                Err(e) => {
                    error!(secret_id = %record.id, error = %e, "Failed to remove expired secret");
                    failures.push(SweepFailure {
                        id: record.id,
                        error: e,
                    });
                }
            }
        }

        if failures.is_empty() {
            if attempted > 0 {
                info!(removed, "Expiry sweep completed");
            } else {
                debug!("Expiry sweep found nothing to remove");
            }
            Ok(SweepReport { attempted, removed })
        } else {
            Err(VaultError::Sweep {
                attempted,
                removed,
                failures,
            })
        }
    }

    /// One scheduled pass: sweep up to now, then retry parked orphans.
    pub async fn tick(&self) {
        if let Err(e) = self.run_sweep(Utc::now()).await {
            error!(error = %e, "Expiry sweep finished with errors");
        }
        let resolved = self.vault.reconcile().await;
        if resolved > 0 {
            info!(resolved, "Reconciled orphan payloads");
        }
    }

    /// Run [`Sweeper::tick`] now and every `interval` until `cancel` fires.
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        spawn_periodic("expiry-sweeper", interval, cancel, move || {
            let sweeper = self.clone();
            async move { sweeper.tick().await }
        })
    }
}
