use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use the first `X-Forwarded-For` hop as the caller key when present.
    /// Disable when the service is not behind a trusted proxy.
    #[serde(default = "default_true")]
    pub trust_forwarded_for: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trust_forwarded_for: true,
        }
    }
}

/// Size and lifetime limits applied to new secrets
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_payload_mb")]
    pub max_payload_mb: u64,
    #[serde(default = "default_ttl_minutes")]
    pub default_ttl_minutes: u64,
    #[serde(default = "default_max_ttl_minutes")]
    pub max_ttl_minutes: u64,
}

fn default_max_payload_mb() -> u64 {
    25
}

fn default_ttl_minutes() -> u64 {
    15
}

fn default_max_ttl_minutes() -> u64 {
    7 * 24 * 60
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_mb: default_max_payload_mb(),
            default_ttl_minutes: default_ttl_minutes(),
            max_ttl_minutes: default_max_ttl_minutes(),
        }
    }
}

impl LimitsConfig {
    pub fn max_payload_bytes(&self) -> usize {
        (self.max_payload_mb as usize).saturating_mul(1024 * 1024)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_minutes * 60)
    }
}

/// Rate limiting settings
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitsConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

fn default_requests_per_minute() -> u32 {
    100
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadBackend {
    #[default]
    Local,
    S3,
    Memory,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    #[default]
    Redb,
    Redis,
    Memory,
}

/// S3-compatible object storage settings
#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    #[serde(default)]
    pub bucket: String,
    /// Custom endpoint for MinIO and other S3-compatible services
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    /// Key prefix inside the bucket
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: None,
            region: default_region(),
            access_key: None,
            secret_key: None,
            allow_http: false,
            prefix: None,
        }
    }
}

/// Redis metadata settings
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://:password@localhost:6379/0`
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "ephemera".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Backend selection and per-backend settings
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub payload_backend: PayloadBackend,
    #[serde(default = "default_payload_dir")]
    pub payload_dir: String,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub metadata_backend: MetadataBackend,
    #[serde(default = "default_redb_path")]
    pub redb_path: String,
    #[serde(default)]
    pub redis: RedisConfig,
    /// Attempts at deleting an orphaned payload after a failed metadata write
    #[serde(default = "default_compensation_attempts")]
    pub compensation_attempts: u32,
    /// Base delay between compensation attempts, doubled after each failure
    #[serde(default = "default_compensation_backoff_ms")]
    pub compensation_backoff_ms: u64,
}

fn default_payload_dir() -> String {
    "./.storage/blobs".to_string()
}

fn default_redb_path() -> String {
    "./.storage/metadata.redb".to_string()
}

fn default_compensation_attempts() -> u32 {
    3
}

fn default_compensation_backoff_ms() -> u64 {
    50
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            payload_backend: PayloadBackend::default(),
            payload_dir: default_payload_dir(),
            s3: S3Config::default(),
            metadata_backend: MetadataBackend::default(),
            redb_path: default_redb_path(),
            redis: RedisConfig::default(),
            compensation_attempts: default_compensation_attempts(),
            compensation_backoff_ms: default_compensation_backoff_ms(),
        }
    }
}

/// Background expiry sweep settings
#[derive(Debug, Deserialize, Clone)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    3 * 60 * 60
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// OPAQUE authentication settings
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Serialized server setup (standard base64). A fresh one is generated at
    /// startup when absent, which invalidates every stored proof record on
    /// restart.
    #[serde(default)]
    pub server_setup: Option<String>,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

fn default_session_ttl_secs() -> u64 {
    120
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            server_setup: None,
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl AuthConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: EPHEMERA_)
            // e.g., EPHEMERA_SERVER__PORT, EPHEMERA_STORAGE__S3__BUCKET
            .add_source(
                Environment::with_prefix("EPHEMERA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Reject combinations the service cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let storage = &self.storage;

        if storage.payload_backend == PayloadBackend::S3 {
            if storage.s3.bucket.trim().is_empty() {
                return Err(invalid("storage.s3.bucket must be set when using the s3 payload backend"));
            }
            let has_access = storage.s3.access_key.as_deref().is_some_and(|k| !k.is_empty());
            let has_secret = storage.s3.secret_key.as_deref().is_some_and(|k| !k.is_empty());
            if has_access != has_secret {
                return Err(invalid(
                    "storage.s3.access_key and storage.s3.secret_key must be set together",
                ));
            }
        }

        if storage.metadata_backend == MetadataBackend::Redis && storage.redis.url.trim().is_empty() {
            return Err(invalid("storage.redis.url must be set when using the redis metadata backend"));
        }

        if self.limits.max_payload_mb == 0 {
            return Err(invalid("limits.max_payload_mb must be greater than zero"));
        }
        if self.limits.default_ttl_minutes == 0 {
            return Err(invalid("limits.default_ttl_minutes must be greater than zero"));
        }
        if self.limits.default_ttl_minutes > self.limits.max_ttl_minutes {
            return Err(invalid("limits.default_ttl_minutes must not exceed limits.max_ttl_minutes"));
        }
        if self.rate_limits.requests_per_minute == 0 {
            return Err(invalid("rate_limits.requests_per_minute must be greater than zero"));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(invalid("sweeper.interval_secs must be greater than zero"));
        }
        if self.auth.session_ttl_secs == 0 {
            return Err(invalid("auth.session_ttl_secs must be greater than zero"));
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Message(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.limits.max_payload_bytes(), 25 * 1024 * 1024);
        assert_eq!(config.limits.default_ttl(), Duration::from_secs(15 * 60));
        assert_eq!(config.sweeper.interval(), Duration::from_secs(3 * 60 * 60));
        assert_eq!(config.auth.session_ttl(), Duration::from_secs(120));
        assert_eq!(config.storage.s3.region, "us-east-1");
    }

    #[test]
    fn test_s3_requires_bucket_and_paired_keys() {
        let mut config = AppConfig::default();
        config.storage.payload_backend = PayloadBackend::S3;
        assert!(config.validate().is_err());

        config.storage.s3.bucket = "secrets".to_string();
        assert!(config.validate().is_ok());

        config.storage.s3.access_key = Some("key".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("set together"));

        config.storage.s3.secret_key = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_requires_url() {
        let mut config = AppConfig::default();
        config.storage.metadata_backend = MetadataBackend::Redis;
        assert!(config.validate().is_err());
        config.storage.redis.url = "redis://127.0.0.1/".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut config = AppConfig::default();
        config.limits.max_payload_mb = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rate_limits.requests_per_minute = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sweeper.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.limits.default_ttl_minutes = config.limits.max_ttl_minutes + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_toml_source() {
        let raw = r#"
            [storage]
            payload_backend = "memory"
            metadata_backend = "redis"

            [storage.redis]
            url = "redis://cache:6379/0"

            [rate_limits]
            requests_per_minute = 10
        "#;
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.storage.payload_backend, PayloadBackend::Memory);
        assert_eq!(config.storage.metadata_backend, MetadataBackend::Redis);
        assert_eq!(config.storage.redis.key_prefix, "ephemera");
        assert_eq!(config.rate_limits.requests_per_minute, 10);
        assert_eq!(config.server.port, 8000);
    }
}
