//! HTTP surface of the Funil inbound integration processor.
//!
//! One worker endpoint drains the webhook event queue on demand; cron hits
//! it with the internal secret, admins can invoke it from the UI. Everything
//! stateful lives behind the [`IntegrationStore`] seam so the whole service
//! is testable against the in-memory store.

pub mod auth;
pub mod config;
pub mod processor;
pub mod recorder;
pub mod resolver;
pub mod writer;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use funil_store::IntegrationStore;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn IntegrationStore>,
}

/// Optional invocation scoping. An empty body processes the due queue.
#[derive(Debug, Default, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub integration_id: Option<Uuid>,
    /// Reprocess these exact events, bypassing the retry window.
    #[serde(default)]
    pub event_ids: Option<Vec<Uuid>>,
}

pub fn build_router(config: Config, store: Arc<dyn IntegrationStore>) -> Router {
    let state = AppState {
        config: Arc::new(config),
        store,
    };

    // The process route is called from browser admin panels on other
    // origins; auth is header-based, so a permissive CORS policy is safe.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(health))
        .route("/integration/process", post(process_events).layer(cors))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "funil-integration-service" }))
}

async fn process_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<ProcessRequest>>,
) -> Response {
    let Some(method) = auth::authorize(&headers, &state.config, &state.store).await else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized: Admin access required" })),
        )
            .into_response();
    };
    tracing::info!(auth_method = method.as_str(), "processing invocation authorized");

    let request = body.map(|Json(request)| request).unwrap_or_default();
    match processor::run_batch(&state, request).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(error) => {
            tracing::error!(%error, "batch run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": error.to_string() })),
            )
                .into_response()
        }
    }
}
