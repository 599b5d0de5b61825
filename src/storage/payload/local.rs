//! Filesystem payload store: one file per secret under a root directory.

use crate::error::{StoreError, StoreResult};
use crate::secret::record::is_valid_id;
use crate::storage::PayloadStore;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub struct LocalPayloadStore {
    root: PathBuf,
}

impl LocalPayloadStore {
    /// Open the store, creating `root` (mode 0700 on unix) if needed.
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        if root.as_os_str().is_empty() {
            return Err(StoreError::InvalidKey(
                "payload directory must not be empty".to_string(),
            ));
        }
        tokio::fs::create_dir_all(&root).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).await?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> StoreResult<PathBuf> {
        if !is_valid_id(id) {
            return Err(StoreError::InvalidKey(id.to_string()));
        }
        Ok(self.root.join(id))
    }
}

impl std::fmt::Debug for LocalPayloadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPayloadStore")
            .field("root", &self.root)
            .finish()
    }
}

#[async_trait]
impl PayloadStore for LocalPayloadStore {
    async fn put(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.path_for(id)?;
        // Write beside the target and rename so readers never see a torn file.
        // The '.' keeps temp names outside the valid id alphabet.
        let tmp = self
            .root
            .join(format!(".{}.{}", id, uuid::Uuid::new_v4().simple()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let result = async {
            let mut file = options.open(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Stored payload {} ({} bytes)", id, data.len());
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Vec<u8>> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
