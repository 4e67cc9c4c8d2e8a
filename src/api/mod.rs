//! HTTP surface.
//!
//! Thin layer over the saga: requests return immediately with the
//! pre-saga state and progress is observed by polling status and logs.
//! Only subdomain conflicts, port exhaustion and unknown ids surface as
//! synchronous request errors.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    Json, Router,
    http::HeaderValue,
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};

use crate::config::AppConfig;
use crate::logs::LogSink;
use crate::ports::PortAllocator;
use crate::saga::DeploymentSaga;
use crate::store::StateStore;

pub mod auth;
pub mod deployments;

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<StateStore>,
    pub logs: LogSink,
    pub ports: PortAllocator,
    pub saga: Arc<DeploymentSaga>,
    /// Bearer tokens issued to the admin session.
    pub tokens: RwLock<HashSet<String>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = match state.config.dashboard_origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => {
            log::warn!(
                "Invalid dashboard origin {:?}, allowing any origin",
                state.config.dashboard_origin
            );
            CorsLayer::permissive()
        }
    };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/auth/login", post(auth::login))
        .route("/auth/verify", get(auth::verify))
        .route("/auth/logout", post(auth::logout))
        .route(
            "/deployments",
            get(deployments::list).post(deployments::create),
        )
        .route(
            "/deployments/{id}",
            get(deployments::show).delete(deployments::delete),
        )
        .route("/deployments/{id}/status", get(deployments::status))
        .route("/deployments/{id}/logs", get(deployments::logs))
        .layer(cors)
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "Slipway API is running" }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}
