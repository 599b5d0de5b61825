//! JSON-over-HTTP presentation layer.

pub mod error;
pub mod rate_limit;
pub mod routes;

pub use error::ApiError;
pub use routes::create_router;

use crate::auth::SecretGate;
use crate::config::LimitsConfig;
use crate::ratelimit::RateGovernor;
use crate::secret::SecretVault;
use std::sync::Arc;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub vault: Arc<SecretVault>,
    pub gate: Arc<dyn SecretGate>,
    pub governor: Arc<RateGovernor>,
    pub limits: LimitsConfig,
    /// Key rate limits on `X-Forwarded-For` when present
    pub trust_forwarded_for: bool,
}
