use thiserror::Error;

/// Failures raised by a payload or metadata backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("entry not found")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("embedded database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("object storage error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("record encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("backend task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One item of a sweep that could not be removed.
#[derive(Debug)]
pub struct SweepFailure {
    pub id: String,
    pub error: VaultError,
}

/// Vault-level error taxonomy.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("secret not found")]
    NotFound,

    #[error("secret expired")]
    Expired,

    #[error("secret already exists")]
    AlreadyExists,

    #[error("invalid secret ID: {0}")]
    InvalidId(String),

    #[error("invalid payload")]
    InvalidPayload,

    #[error("invalid TTL")]
    InvalidTtl,

    #[error("proof record is required")]
    ProofRecordMissing,

    #[error("{op}: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error(
        "sweep removed {removed} of {attempted} expired secrets, failed: {}",
        join_failed_ids(.failures)
    )]
    Sweep {
        attempted: usize,
        removed: usize,
        failures: Vec<SweepFailure>,
    },
}

impl VaultError {
    pub fn backend(op: &'static str, source: StoreError) -> Self {
        Self::Backend { op, source }
    }

    /// IDs that failed during a sweep, empty for every other variant.
    pub fn failed_ids(&self) -> Vec<&str> {
        match self {
            Self::Sweep { failures, .. } => failures.iter().map(|f| f.id.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn join_failed_ids(failures: &[SweepFailure]) -> String {
    failures
        .iter()
        .map(|f| f.id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using VaultError
pub type VaultResult<T> = Result<T, VaultError>;
