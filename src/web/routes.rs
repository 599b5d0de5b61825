use super::error::ApiError;
use super::rate_limit::rate_limit;
use super::AppState;
use crate::secret::{NewSecret, PayloadType, SecretRecord};
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Room for JSON framing around the base64 payload
const BODY_OVERHEAD: usize = 64 * 1024;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RegisterStartRequest {
    /// Base64 OPAQUE registration request
    pub request: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterStartResponse {
    pub secret_id: String,
    pub response: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateSecretRequest {
    pub secret_id: String,
    /// Base64 OPAQUE registration upload, stored as the proof record
    pub opaque_upload: String,
    /// Base64 ciphertext
    pub payload: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub payload_type: Option<String>,
    #[serde(default)]
    pub ttl_minutes: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretResponse {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
    pub payload_type: PayloadType,
}

impl From<SecretRecord> for SecretResponse {
    fn from(record: SecretRecord) -> Self {
        Self {
            id: record.id,
            file_name: record.file_name,
            content_type: record.content_type,
            size: record.size,
            expires_at: record.expires_at,
            payload_type: record.payload_type,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretStatusResponse {
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStartRequest {
    pub secret_id: String,
    /// Base64 OPAQUE credential request
    pub request: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStartResponse {
    pub session_id: String,
    pub response: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealRequest {
    pub session_id: String,
    /// Base64 OPAQUE credential finalization
    pub finalization: String,
    /// When present, must match the secret the session unlocks
    #[serde(default)]
    pub secret_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealResponse {
    #[serde(flatten)]
    pub secret: SecretResponse,
    /// Base64 ciphertext
    pub payload: String,
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>, ApiError> {
    BASE64
        .decode(value.trim())
        .map_err(|_| ApiError::bad_request(format!("invalid {}", field)))
}

/// Handler: POST /opaque/register/start
///
/// Mints the secret id and answers the client's registration request.
async fn register_start(
    State(state): State<AppState>,
    Json(body): Json<RegisterStartRequest>,
) -> Result<Json<RegisterStartResponse>, ApiError> {
    let request = decode_field(&body.request, "registration request")?;
    let challenge = state.gate.start_registration(&request).map_err(|e| {
        error!(error = %e, "OPAQUE registration failed");
        ApiError::bad_request("opaque registration failed")
    })?;

    Ok(Json(RegisterStartResponse {
        secret_id: challenge.secret_id,
        response: BASE64.encode(challenge.response),
    }))
}

/// Handler: POST /secrets
async fn create_secret(
    State(state): State<AppState>,
    Json(body): Json<CreateSecretRequest>,
) -> Result<(StatusCode, Json<SecretResponse>), ApiError> {
    let secret_id = body.secret_id.trim();
    if secret_id.is_empty() {
        return Err(ApiError::bad_request("secret ID is required"));
    }

    let proof_record = decode_field(&body.opaque_upload, "opaque upload")?;
    let payload = decode_field(&body.payload, "payload")?;
    let max_bytes = state.limits.max_payload_bytes();
    if payload.len() > max_bytes {
        return Err(ApiError::PayloadTooLarge(max_bytes));
    }

    let ttl = match body.ttl_minutes {
        None => state.limits.default_ttl(),
        Some(0) => return Err(ApiError::bad_request("TTL must be a positive number of minutes")),
        Some(m) if m > state.limits.max_ttl_minutes => {
            return Err(ApiError::bad_request("ttl exceeds maximum allowed value"))
        }
        Some(m) => Duration::from_secs(m * 60),
    };

    let record = state
        .vault
        .create(NewSecret {
            id: Some(secret_id.to_string()),
            file_name: body.file_name.unwrap_or_default(),
            content_type: body.content_type.unwrap_or_default(),
            payload,
            ttl,
            payload_type: body
                .payload_type
                .as_deref()
                .map(PayloadType::from_hint)
                .unwrap_or_default(),
            proof_record,
        })
        .await
        .map_err(ApiError::from_create)?;

    Ok((StatusCode::CREATED, Json(record.into())))
}

/// Handler: GET /secrets/{id}
///
/// Existence check used before a reveal attempt. Never touches the payload.
async fn secret_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SecretStatusResponse>, ApiError> {
    let record = state
        .vault
        .metadata(&id)
        .await
        .map_err(|e| ApiError::from_lookup(e, &id))?;
    Ok(Json(SecretStatusResponse {
        id: record.id,
        expires_at: record.expires_at,
    }))
}

/// Handler: POST /opaque/login/start
async fn login_start(
    State(state): State<AppState>,
    Json(body): Json<LoginStartRequest>,
) -> Result<Json<LoginStartResponse>, ApiError> {
    let secret_id = body.secret_id.trim();
    if secret_id.is_empty() {
        return Err(ApiError::bad_request("secretId is required"));
    }
    let request = decode_field(&body.request, "credential request")?;

    let record = state
        .vault
        .metadata(secret_id)
        .await
        .map_err(|e| ApiError::from_lookup(e, secret_id))?;

    let challenge = state
        .gate
        .start_login(secret_id, &record.proof_record, &request)
        .map_err(|e| {
            error!(secret_id = %secret_id, error = %e, "OPAQUE login start failed");
            ApiError::Internal("opaque login failed")
        })?;

    Ok(Json(LoginStartResponse {
        session_id: challenge.session_id,
        response: BASE64.encode(challenge.response),
    }))
}

/// Handler: POST /secrets/reveal
///
/// Completes the login, returns the payload and deletes the secret.
async fn reveal_secret(
    State(state): State<AppState>,
    Json(body): Json<RevealRequest>,
) -> Result<Json<RevealResponse>, ApiError> {
    let session_id = body.session_id.trim();
    if session_id.is_empty() || body.finalization.trim().is_empty() {
        return Err(ApiError::bad_request("sessionId and finalization are required"));
    }
    let finalization = decode_field(&body.finalization, "finalization")?;

    let secret_id = state
        .gate
        .finish_login(session_id, &finalization)
        .map_err(ApiError::from_login_finish)?;

    if let Some(expected) = body.secret_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        if expected != secret_id {
            return Err(ApiError::NotFoundOrInvalidPin);
        }
    }

    let revealed = state
        .vault
        .load(&secret_id)
        .await
        .map_err(|e| ApiError::from_lookup(e, &secret_id))?;

    if let Err(e) = state.vault.delete(&secret_id).await {
        error!(secret_id = %secret_id, error = %e, "Failed to delete secret after reveal");
    } else {
        info!(secret_id = %secret_id, "Secret revealed and deleted");
    }

    Ok(Json(RevealResponse {
        secret: revealed.record.into(),
        payload: BASE64.encode(&revealed.payload),
    }))
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    // base64 inflates by 4/3
    let body_limit = state.limits.max_payload_bytes() / 3 * 4 + BODY_OVERHEAD;

    Router::new()
        .route("/healthz", get(health))
        .route("/opaque/register/start", post(register_start))
        .route("/opaque/login/start", post(login_start))
        .route("/secrets", post(create_secret))
        .route("/secrets/reveal", post(reveal_secret))
        .route("/secrets/{id}", get(secret_status))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
