//! Admin API Server
//!
//! API-key-gated control plane: CRUD on routes and backends, per-backend
//! health with breaker stats, and configuration reload. Every mutation
//! validates the resulting configuration and installs it through the
//! gateway's reload path, so the same invariants hold as at initial load.

use crate::application::Gateway;
use crate::config::Config;
use crate::domain::entities::{BackendService, RouteConfig};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct AdminState {
    gateway: Arc<Gateway>,
    api_key: String,
    config_path: String,
    /// Serializes mutations so concurrent edits cannot lose updates.
    mutation_lock: Arc<Mutex<()>>,
}

/// Build the admin router.
pub fn router(gateway: Arc<Gateway>, api_key: String, config_path: String) -> Router {
    let state = AdminState {
        gateway,
        api_key,
        config_path,
        mutation_lock: Arc::new(Mutex::new(())),
    };

    Router::new()
        .route("/admin/routes", get(list_routes).post(create_route))
        .route(
            "/admin/routes/:id",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route("/admin/backends", get(list_backends).post(create_backend))
        .route("/admin/backends/:id/health", get(get_backend_health))
        .route("/admin/reload", axum::routing::post(reload_config))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the stop channel flips.
pub async fn run(
    gateway: Arc<Gateway>,
    listen_addr: SocketAddr,
    api_key: String,
    config_path: String,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(gateway, api_key, config_path);
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await?;
    Ok(())
}

async fn require_api_key(
    State(state): State<AdminState>,
    req: Request,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != state.api_key {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(req).await
}

// ===== Route handlers =====

async fn list_routes(State(state): State<AdminState>) -> Json<Vec<RouteConfig>> {
    Json(state.gateway.snapshot().config.routes.clone())
}

async fn get_route(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Response {
    match state.gateway.snapshot().config.route(&id) {
        Some(route) => Json(route.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "Route not found").into_response(),
    }
}

async fn create_route(
    State(state): State<AdminState>,
    Json(mut route): Json<RouteConfig>,
) -> Response {
    let _guard = state.mutation_lock.lock().await;

    let now = chrono::Utc::now();
    route.created_at = Some(now);
    route.updated_at = Some(now);

    let mut config = state.gateway.snapshot().config.clone();
    config.routes.push(route.clone());

    match state.gateway.reload(config).await {
        Ok(()) => (StatusCode::CREATED, Json(route)).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn update_route(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(mut route): Json<RouteConfig>,
) -> Response {
    let _guard = state.mutation_lock.lock().await;

    let mut config = state.gateway.snapshot().config.clone();
    let Some(slot) = config.routes.iter_mut().find(|r| r.id == id) else {
        return (StatusCode::NOT_FOUND, "Route not found").into_response();
    };

    route.id = id;
    route.created_at = slot.created_at;
    route.updated_at = Some(chrono::Utc::now());
    *slot = route.clone();

    match state.gateway.reload(config).await {
        Ok(()) => Json(route).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn delete_route(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Response {
    let _guard = state.mutation_lock.lock().await;

    let mut config = state.gateway.snapshot().config.clone();
    let before = config.routes.len();
    config.routes.retain(|r| r.id != id);
    if config.routes.len() == before {
        return (StatusCode::NOT_FOUND, "Route not found").into_response();
    }

    match state.gateway.reload(config).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ===== Backend handlers =====

async fn list_backends(State(state): State<AdminState>) -> Json<Vec<BackendService>> {
    Json(state.gateway.snapshot().config.backends.clone())
}

async fn create_backend(
    State(state): State<AdminState>,
    Json(mut backend): Json<BackendService>,
) -> Response {
    let _guard = state.mutation_lock.lock().await;

    let now = chrono::Utc::now();
    backend.created_at = Some(now);
    backend.updated_at = Some(now);

    let mut config = state.gateway.snapshot().config.clone();
    config.backends.push(backend.clone());

    match state.gateway.reload(config).await {
        Ok(()) => (StatusCode::CREATED, Json(backend)).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn get_backend_health(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Response {
    let Some(health) = state.gateway.backend_health(&id).await else {
        return (StatusCode::NOT_FOUND, "Backend not found").into_response();
    };

    let breaker = state.gateway.snapshot().breaker_stats(&id);
    Json(json!({
        "backend_id": health.backend_id,
        "status": health.status,
        "endpoints": health.endpoints,
        "circuit_breaker": breaker,
    }))
    .into_response()
}

// ===== Reload =====

async fn reload_config(State(state): State<AdminState>) -> Response {
    let _guard = state.mutation_lock.lock().await;

    let config = match Config::load(&state.config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "reload: failed to load config file");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    match state.gateway.reload(config).await {
        Ok(()) => Json(json!({
            "message": "Configuration reloaded successfully",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
