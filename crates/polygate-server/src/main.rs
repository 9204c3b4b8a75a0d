//! polygate: OpenAI-compatible LLM gateway

use anyhow::Context;
use polygate_observability::init_tracing;
use polygate_server::{build_router, AppState, GatewayConfig};
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("polygate=info");

    let config = GatewayConfig::from_env().context("configuration")?;
    let addr = format!("{}:{}", config.host, config.port);
    let providers = config.provider_ids();

    let state = AppState::build(config).context("wiring application state")?;
    let draining = Arc::clone(&state.draining);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, providers = ?providers, "polygate listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Flip the drain gate so new requests fail fast while
            // in-flight ones finish.
            draining.store(true, Ordering::Release);
            tracing::info!("shutdown signal received, draining");
        })
        .await
        .context("server error")?;

    Ok(())
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
}
