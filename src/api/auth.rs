//! Single-admin authentication.
//!
//! One static credential from the environment; a successful login
//! issues an opaque bearer token that lives in server state until
//! logout. Every deployment endpoint requires a valid token via the
//! [`RequireAuth`] extractor.

use std::sync::Arc;

use axum::{
    Json,
    extract::{FromRequestParts, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub is_active: bool,
}

/// Pull the token out of an `Authorization: Bearer ...` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Extractor that rejects requests without a known bearer token.
#[derive(Debug, Clone, Copy)]
pub struct RequireAuth;

impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(&parts.headers) else {
            log::warn!("Missing bearer token");
            return Err(ApiError::Unauthorized);
        };
        if state.tokens.read().await.contains(token) {
            Ok(RequireAuth)
        } else {
            log::warn!("Unknown bearer token presented");
            Err(ApiError::Unauthorized)
        }
    }
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    if request.username != state.config.admin_username
        || request.password != state.config.admin_password
    {
        return Err(ApiError::Unauthorized);
    }
    let token = Uuid::new_v4().to_string();
    state.tokens.write().await.insert(token.clone());
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
    }))
}

pub async fn verify(
    _auth: RequireAuth,
    State(state): State<Arc<AppState>>,
) -> Json<UserResponse> {
    Json(UserResponse {
        id: "admin".to_string(),
        username: state.config.admin_username.clone(),
        is_active: true,
    })
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    if let Some(token) = bearer_token(&headers) {
        state.tokens.write().await.remove(token);
    }
    Json(serde_json::json!({ "message": "Successfully logged out" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
