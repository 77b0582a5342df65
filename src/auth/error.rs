use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::collections::BTreeMap;

use super::middleware::current_trace_id;

/// Everything the credential engine can fail with.
///
/// The first three variants render identically so a caller can't tell an
/// unknown client from an unknown user from a bad password.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid client")]
    InvalidClient,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("client authentication failed")]
    Unauthorized,
    #[error("invalid grant: {0}")]
    InvalidGrant(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("validation failed")]
    Validation(BTreeMap<&'static str, Vec<String>>),
    #[error("unusable key material: {0}")]
    KeyError(#[source] jsonwebtoken::errors::Error),
    #[error("store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl AuthError {
    pub fn store(err: anyhow::Error) -> Self {
        Self::StoreUnavailable(err)
    }

    pub fn invalid_token(reason: impl std::fmt::Display) -> Self {
        Self::InvalidToken(reason.to_string())
    }

    fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::KeyError(_) | Self::StoreUnavailable(_) | Self::Internal(_)
        )
    }

    /// (status, oauth error code, description shown to the caller)
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            Self::InvalidClient | Self::InvalidCredentials | Self::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "unauthorized", "Invalid credentials")
            }
            Self::InvalidGrant(reason) => (StatusCode::BAD_REQUEST, "invalid_grant", *reason),
            Self::InvalidRequest(reason) => (StatusCode::BAD_REQUEST, "invalid_request", *reason),
            Self::InvalidToken(_) => (StatusCode::UNAUTHORIZED, "invalid_token", "Invalid token"),
            Self::Conflict(reason) => (StatusCode::CONFLICT, "conflict", *reason),
            Self::Validation(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_request",
                "Validation failed",
            ),
            Self::KeyError(_) | Self::StoreUnavailable(_) | Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "Internal server error",
            ),
        }
    }
}

/// OAuth 2.0 error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<&'static str, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let trace_id = current_trace_id();
        let (status, error, description) = self.parts();

        if self.is_internal() {
            tracing::error!(trace_id = %trace_id, error = %self, "internal fault");
        } else {
            tracing::warn!(trace_id = %trace_id, status = %status, error = %self, "client error");
        }

        let mut headers = HeaderMap::new();
        if matches!(self, Self::InvalidToken(_)) {
            headers.insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer error=\"invalid_token\""),
            );
        }

        let body = ErrorResponse {
            error: error.to_string(),
            error_description: Some(description.to_string()),
            trace_id: self.is_internal().then_some(trace_id),
            fields: match self {
                Self::Validation(fields) => Some(fields),
                _ => None,
            },
        };

        (status, headers, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumeration_errors_render_identically() {
        let a = AuthError::InvalidClient.parts();
        let b = AuthError::InvalidCredentials.parts();
        let c = AuthError::Unauthorized.parts();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err = AuthError::store(anyhow::anyhow!("connection refused to 10.0.0.3:6379"));
        let (status, code, description) = err.parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "server_error");
        assert!(!description.contains("6379"));
    }

    #[test]
    fn test_invalid_token_sets_www_authenticate() {
        let response = AuthError::invalid_token("bad signature").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }
}
