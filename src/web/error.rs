use crate::auth::AuthError;
use crate::error::VaultError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error};

/// Shown for every retrieval failure that must not reveal its cause.
pub const NOT_FOUND_OR_INVALID_PIN: &str = "secret not found or invalid PIN";

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// HTTP-facing errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("payload exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// Unknown secret, unknown session, failed proof or mismatched id
    #[error("{}", NOT_FOUND_OR_INVALID_PIN)]
    NotFoundOrInvalidPin,

    #[error("session expired, try again")]
    SessionExpired,

    #[error("secret expired")]
    Expired,

    #[error("secret already exists")]
    AlreadyExists,

    #[error("too many requests")]
    RateLimited { retry_after: Duration },

    /// Backend failure. Only the generic message reaches the client.
    #[error("{0}")]
    Internal(&'static str),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Map a failure of `SecretVault::create`.
    pub fn from_create(err: VaultError) -> Self {
        match err {
            VaultError::ProofRecordMissing => Self::bad_request("opaque upload is required"),
            VaultError::InvalidPayload => Self::bad_request("file or message is required"),
            VaultError::InvalidTtl => Self::bad_request("TTL must be a positive number of minutes"),
            VaultError::InvalidId(_) => Self::bad_request("invalid secret ID"),
            VaultError::AlreadyExists => Self::AlreadyExists,
            other => {
                error!(error = %other, "Failed to save secret");
                Self::Internal("failed to save secret")
            }
        }
    }

    /// Map a failure of a lookup on the retrieval path. Missing and malformed
    /// ids look the same as a failed proof.
    pub fn from_lookup(err: VaultError, secret_id: &str) -> Self {
        match err {
            VaultError::NotFound | VaultError::InvalidId(_) => Self::NotFoundOrInvalidPin,
            VaultError::Expired => Self::Expired,
            other => {
                error!(secret_id = %secret_id, error = %other, "Failed to load secret");
                Self::Internal("failed to load secret")
            }
        }
    }

    /// Map a failure of a login finish.
    pub fn from_login_finish(err: AuthError) -> Self {
        match err {
            AuthError::SessionExpired => Self::SessionExpired,
            other => {
                debug!(error = %other, "Login finish rejected");
                Self::NotFoundOrInvalidPin
            }
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFoundOrInvalidPin => StatusCode::NOT_FOUND,
            ApiError::SessionExpired => StatusCode::BAD_REQUEST,
            ApiError::Expired => StatusCode::GONE,
            ApiError::AlreadyExists => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Whole seconds, rounded up, never below one.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            ApiError::RateLimited { retry_after } => Some(retry_after_secs(*retry_after)),
            _ => None,
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::bad_request("bad").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::PayloadTooLarge(10).into_response().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::NotFoundOrInvalidPin.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::Expired.into_response().status(), StatusCode::GONE);
        assert_eq!(
            ApiError::AlreadyExists.into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Internal("boom").into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let resp = ApiError::RateLimited {
            retry_after: Duration::from_millis(1500),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn test_retry_after_rounding() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(3)), 3);
        assert_eq!(retry_after_secs(Duration::from_millis(3001)), 4);
    }

    #[test]
    fn test_lookup_errors_are_coarsened() {
        let not_found = ApiError::from_lookup(VaultError::NotFound, "x");
        let bad_id = ApiError::from_lookup(VaultError::InvalidId("..".to_string()), "..");
        let bad_pin = ApiError::from_login_finish(AuthError::Protocol("mac".to_string()));
        let no_session = ApiError::from_login_finish(AuthError::SessionNotFound);

        for err in [not_found, bad_id, bad_pin, no_session] {
            assert!(matches!(err, ApiError::NotFoundOrInvalidPin));
        }
    }

    #[test]
    fn test_backend_errors_hide_details() {
        let err = ApiError::from_lookup(
            VaultError::backend("load payload", StoreError::InvalidKey("secret-path".to_string())),
            "id",
        );
        assert_eq!(err.to_string(), "failed to load secret");
        assert!(matches!(
            ApiError::from_create(VaultError::AlreadyExists),
            ApiError::AlreadyExists
        ));
    }
}
