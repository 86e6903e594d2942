//! Metrics Exposition Server
//!
//! Dedicated listener rendering the gateway metrics in Prometheus text
//! format at the configured path.

use crate::application::Gateway;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Build the metrics router for the configured exposition path.
pub fn router(gateway: Arc<Gateway>, path: &str) -> Router {
    Router::new()
        .route(path, get(metrics_handler))
        .with_state(gateway)
}

/// Bind and serve until the stop channel flips.
pub async fn run(
    gateway: Arc<Gateway>,
    listen_addr: SocketAddr,
    path: String,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(gateway, &path);
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, path = %path, "metrics exposition listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await?;
    Ok(())
}

async fn metrics_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let snapshot = gateway.snapshot();
    let body = gateway
        .metrics()
        .export_prometheus(&snapshot.breaker_states(), &snapshot.backend_health_flags());

    ([(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body)
}
