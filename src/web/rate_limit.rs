use super::error::ApiError;
use super::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use tracing::warn;

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Key used when neither a forwarded address nor the peer address is known.
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Middleware: admit or reject the request against the caller's window.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let caller = caller_key(&request, state.trust_forwarded_for);
    let decision = state.governor.allow(&caller);

    if !decision.admitted {
        warn!(caller = %caller, retry_after_ms = decision.retry_after.as_millis() as u64, "Rate limit exceeded");
        return ApiError::RateLimited {
            retry_after: decision.retry_after,
        }
        .into_response();
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(state.governor.limit()));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    response
}

/// Client IP: first `X-Forwarded-For` hop when trusted, else the peer address.
pub fn caller_key(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS_CALLER.to_string())
}
