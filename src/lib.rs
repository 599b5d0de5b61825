pub mod auth;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod schedule;
pub mod secret;
pub mod storage;
pub mod web;

pub use config::AppConfig;
pub use error::{StoreError, StoreResult, VaultError, VaultResult};
pub use ratelimit::{Decision, RateGovernor};
pub use secret::{NewSecret, PayloadType, RevealedSecret, SecretRecord, SecretVault, Sweeper};
