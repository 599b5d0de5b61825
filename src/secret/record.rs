use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest identifier accepted by the vault.
pub const MAX_ID_LEN: usize = 128;

/// Classification hint for the stored payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    #[default]
    File,
    Text,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Text => "text",
        }
    }

    /// Parse a user-supplied hint, falling back to `File` for anything unknown.
    pub fn from_hint(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "text" => Self::Text,
            _ => Self::File,
        }
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted metadata for one secret. The payload itself never lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRecord {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub payload_type: PayloadType,
    #[serde(with = "base64_bytes")]
    pub proof_record: Vec<u8>,
}

impl SecretRecord {
    /// A record is live while `now < expires_at`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Input for `SecretVault::create`.
#[derive(Debug, Clone, Default)]
pub struct NewSecret {
    /// Caller-supplied identifier; a UUID is generated when absent.
    pub id: Option<String>,
    pub file_name: String,
    pub content_type: String,
    pub payload: Vec<u8>,
    pub ttl: Duration,
    pub payload_type: PayloadType,
    pub proof_record: Vec<u8>,
}

/// Metadata plus payload, returned by a successful load.
#[derive(Debug, Clone)]
pub struct RevealedSecret {
    pub record: SecretRecord,
    pub payload: Vec<u8>,
}

/// Check that an identifier is safe to use as a key in every backend.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
