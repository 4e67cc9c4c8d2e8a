//! Deployment endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use super::auth::RequireAuth;
use crate::error::{ApiError, ApiResult, ProvisionError};
use crate::model::{Deployment, DeploymentId, DeploymentState, LogLevel};

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub source_url: String,
    pub subdomain: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub id: String,
    pub name: String,
    pub source_url: String,
    pub subdomain: String,
    pub port: u16,
    pub state: DeploymentState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Deployment> for DeploymentResponse {
    fn from(d: &Deployment) -> Self {
        Self {
            id: d.id.to_string(),
            name: d.name.clone(),
            source_url: d.source_url.clone(),
            subdomain: d.subdomain.clone(),
            port: d.port,
            state: d.state,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub id: String,
    pub state: DeploymentState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct LogEntryResponse {
    pub id: String,
    pub message: String,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Last path segment of the repository URL, without a `.git` suffix.
fn repo_name(source_url: &str) -> String {
    let name = source_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    if name.is_empty() {
        "deployment".to_string()
    } else {
        name.to_string()
    }
}

/// Ids are parsed at the boundary; an unparseable id is an unknown
/// deployment, not a client error.
fn parse_id(raw: &str) -> ApiResult<DeploymentId> {
    raw.parse().map_err(|_| ProvisionError::NotFound.into())
}

pub async fn create(
    _auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateDeploymentRequest>,
) -> ApiResult<Json<DeploymentResponse>> {
    let subdomain = request.subdomain.trim().to_string();
    if subdomain.is_empty() {
        return Err(ApiError::BadRequest("subdomain must not be empty".to_string()));
    }
    if request.source_url.trim().is_empty() {
        return Err(ApiError::BadRequest("source_url must not be empty".to_string()));
    }

    // Conflict check happens before any port is allocated or any build
    // starts.
    if state.store.subdomain_in_use(&subdomain).await {
        return Err(ProvisionError::ConflictingSubdomain(subdomain).into());
    }

    let id = DeploymentId::new();
    let port = state.ports.allocate(id).await.map_err(ApiError::from)?;

    let deployment = Deployment::new(
        id,
        repo_name(&request.source_url),
        request.source_url.trim().to_string(),
        subdomain,
        port,
        request.env_vars,
    );
    if let Err(e) = state.store.insert_deployment(deployment.clone()).await {
        state.ports.release(port).await;
        return Err(ApiError::Internal(e.to_string()));
    }
    state.logs.info(id, "Deployment request accepted").await;

    let saga = state.saga.clone();
    tokio::spawn(async move {
        saga.provision(id).await;
    });

    Ok(Json(DeploymentResponse::from(&deployment)))
}

pub async fn list(
    _auth: RequireAuth,
    State(state): State<Arc<AppState>>,
) -> Json<Vec<DeploymentResponse>> {
    let all = state.store.list_deployments().await;
    Json(all.iter().map(DeploymentResponse::from).collect())
}

pub async fn show(
    _auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentResponse>> {
    let id = parse_id(&id)?;
    let deployment = state
        .store
        .get_deployment(id)
        .await
        .ok_or(ProvisionError::NotFound)?;
    Ok(Json(DeploymentResponse::from(&deployment)))
}

pub async fn status(
    _auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let id = parse_id(&id)?;
    let deployment = state
        .store
        .get_deployment(id)
        .await
        .ok_or(ProvisionError::NotFound)?;
    Ok(Json(StatusResponse {
        id: deployment.id.to_string(),
        state: deployment.state,
        updated_at: deployment.updated_at,
    }))
}

pub async fn logs(
    _auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<LogEntryResponse>>> {
    let id = parse_id(&id)?;
    if state.store.get_deployment(id).await.is_none() {
        return Err(ProvisionError::NotFound.into());
    }
    let entries = state
        .logs
        .entries(id)
        .await
        .into_iter()
        .map(|e| LogEntryResponse {
            id: e.id.to_string(),
            message: e.message,
            level: e.level,
            timestamp: e.timestamp,
        })
        .collect();
    Ok(Json(entries))
}

/// Deletion always triggers the full teardown, whatever state the
/// deployment is in; the work happens in the background.
pub async fn delete(
    _auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    let id = parse_id(&id)?;
    if state.store.get_deployment(id).await.is_none() {
        return Err(ProvisionError::NotFound.into());
    }
    let saga = state.saga.clone();
    tokio::spawn(async move {
        saga.teardown(id).await;
    });
    Ok(Json(MessageResponse {
        message: "Deployment deletion started".to_string(),
    }))
}
