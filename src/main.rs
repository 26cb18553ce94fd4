// src/main.rs
//
// Process entry point: logging, configuration, bridge startup, admin
// interface, and signal-driven shutdown.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cerebro2mqtt::{web, BridgeService, ConfigStore};

fn init_tracing() {
    // LOG_LEVEL takes either a plain level ("debug") or a full filter
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::var("ALGODOMO_CONFIG")
        .unwrap_or_else(|_| "./config/config.json".to_string());
    let store =
        Arc::new(ConfigStore::open(&config_path).context("loading configuration failed")?);

    let service = Arc::new(BridgeService::new(store.clone()));
    service.start().await.context("starting bridge failed")?;

    let web_settings = store.config().web;
    let listener =
        tokio::net::TcpListener::bind((web_settings.host.as_str(), web_settings.port))
            .await
            .with_context(|| {
                format!(
                    "binding admin interface on {}:{} failed",
                    web_settings.host, web_settings.port
                )
            })?;
    info!(
        host = %web_settings.host,
        port = web_settings.port,
        "admin interface listening"
    );

    let app = web::router(web::AppState {
        store,
        service: service.clone(),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin interface failed")?;

    service.stop().await;
    Ok(())
}
