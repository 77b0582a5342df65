use super::OAuthService;
use super::error::AuthError;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

tokio::task_local! {
    static TRACE_ID: String;
}

/// Trace id of the request being handled. Outside a request (tests, startup)
/// a fresh one is made up so internal errors are still correlatable in logs.
pub fn current_trace_id() -> String {
    TRACE_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| Uuid::new_v4().to_string())
}

/// Tags every request with a trace id (echoed as `X-Trace-ID`) and logs it
/// once it's done.
pub async fn trace_id_middleware(req: Request, next: Next) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let mut response = TRACE_ID.scope(trace_id.clone(), next.run(req)).await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }

    tracing::info!(
        status = response.status().as_u16(),
        method = %method,
        path = %path,
        latency_ms = start.elapsed().as_millis() as u64,
        trace_id = %trace_id,
        "Request"
    );
    response
}

/// Validates the Bearer access token and stashes its verified claims in the
/// request extensions for the handler.
pub async fn access_token_middleware(
    State(service): State<Arc<OAuthService>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        tracing::warn!(
            "Missing or invalid Authorization header for {} {}",
            req.method(),
            req.uri()
        );
        return AuthError::invalid_token("missing bearer token").into_response();
    };

    let verified = service.verify_access_token(token).await;
    match verified {
        Ok(claims) => {
            tracing::debug!("Valid access token for user {} via {}", claims.sub, claims.aud);
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// `Authorization: Basic base64(client_id:client_secret)`
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?.trim();
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    if id.is_empty() {
        return None;
    }
    Some((id.to_string(), secret.to_string()))
}
