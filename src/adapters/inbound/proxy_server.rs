//! Proxy Listener
//!
//! The main HTTP entry point. Every request falls through to the gateway
//! dispatch pipeline; `/health` is answered locally. Panics anywhere below
//! are caught, logged and turned into a 500 so the process never dies with
//! a request.

use crate::application::Gateway;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

/// Gateway health payload.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    timestamp: String,
    services: BTreeMap<String, ServiceHealth>,
}

#[derive(Debug, Serialize)]
struct ServiceHealth {
    status: String,
}

/// Build the proxy router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(dispatch_handler)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Bind and serve until the stop channel flips, letting accepted
/// connections finish.
pub async fn run(
    gateway: Arc<Gateway>,
    listen_addr: SocketAddr,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(gateway);
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "proxy listener started");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = stop.wait_for(|stopped| *stopped).await;
    })
    .await?;

    Ok(())
}

async fn dispatch_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response<Body> {
    gateway.dispatch(req, Some(peer)).await
}

async fn health_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let statuses = gateway.all_backend_health().await;

    let mut services = BTreeMap::new();
    let mut degraded = false;
    for backend in statuses {
        let status = match backend.status {
            crate::infrastructure::health_checker::HealthState::Healthy => "healthy",
            crate::infrastructure::health_checker::HealthState::Unhealthy => {
                degraded = true;
                "unhealthy"
            }
            crate::infrastructure::health_checker::HealthState::Unknown => "unknown",
        };
        services.insert(
            backend.backend_id,
            ServiceHealth {
                status: status.to_string(),
            },
        );
    }

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        services,
    })
}

/// A panic in the forwarding path becomes a logged incident and a 500, not
/// a dead process.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    tracing::error!(panic = %detail, "panic recovered while handling request");

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from("Internal Server Error"))
        .expect("static response must build")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_panic_builds_500() {
        let resp = handle_panic(Box::new("boom".to_string()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let resp = handle_panic(Box::new(42u32));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
