//! apigate - composition root
//!
//! Loads the configuration, wires the gateway core to its listeners and
//! background workers, and runs until SIGINT/SIGTERM.

use apigate::adapters::inbound::{admin_server, metrics_server, proxy_server};
use apigate::adapters::outbound::GatewayMetrics;
use apigate::application::Gateway;
use apigate::config::{self, Config};
use apigate::infrastructure::config_watcher::ConfigWatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config::config_path();
    let cfg = Config::load(&config_path)?;

    init_tracing(&cfg);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        port = cfg.router.port,
        backends = cfg.backends.len(),
        routes = cfg.routes.len(),
        "starting apigate"
    );

    let metrics = Arc::new(GatewayMetrics::new());

    let admin_cfg = cfg.admin.clone();
    let metrics_cfg = cfg.metrics.clone();
    let router_port = cfg.router.port;

    let gateway = Gateway::new(cfg, metrics).await;

    // One stop channel for every listener; flipped by the signal task.
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        let _ = stop_tx.send(true);
    });

    // Admin control plane (optional).
    if admin_cfg.enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], admin_cfg.port).into();
        let gateway = gateway.clone();
        let stop = stop_rx.clone();
        let config_path = config_path.clone();
        tokio::spawn(async move {
            if let Err(e) =
                admin_server::run(gateway, addr, admin_cfg.api_key, config_path, stop).await
            {
                tracing::error!(error = %e, "admin server failed");
            }
        });
    }

    // Prometheus exposition (optional).
    if metrics_cfg.enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], metrics_cfg.port).into();
        let gateway = gateway.clone();
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server::run(gateway, addr, metrics_cfg.path, stop).await {
                tracing::error!(error = %e, "metrics server failed");
            }
        });
    }

    // File-watch hot reload.
    let watcher = Arc::new(ConfigWatcher::new(&config_path, Duration::from_secs(5)));
    watcher.prime().await;
    let mut changes = watcher.subscribe();
    watcher.clone().start();
    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            while let Ok(change) = changes.recv().await {
                match Config::load(&change.path) {
                    Ok(new_config) => {
                        if let Err(e) = gateway.reload(new_config).await {
                            tracing::error!(error = %e, "hot reload rejected");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "hot reload: config file unreadable, keeping current");
                    }
                }
            }
        });
    }

    // Main proxy listener; returns once the stop channel flips and the
    // accepted connections have finished.
    let listen_addr: SocketAddr = ([0, 0, 0, 0], router_port).into();
    proxy_server::run(gateway.clone(), listen_addr, stop_rx).await?;

    // The gateway's own in-flight gauge decides when we are drained.
    gateway.drain_in_flight(Duration::from_secs(30)).await;
    gateway.stop().await;
    tracing::info!("apigate stopped");

    Ok(())
}

/// Resolve once the process is asked to stop.
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("SIGTERM received, stopping");
                    }
                    result = tokio::signal::ctrl_c() => {
                        match result {
                            Ok(()) => tracing::info!("interrupt received, stopping"),
                            Err(e) => tracing::error!(error = %e, "interrupt handler failed"),
                        }
                    }
                }
            }
            Err(e) => {
                // No SIGTERM stream; Ctrl+C alone still stops the process.
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, stopping");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
        }
    }
}

fn init_tracing(cfg: &Config) {
    let level = cfg.logging.level.clone();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if cfg.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
