//! Axum-based WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::connection::handle_ws_connection;
use crate::state::GatewayState;

/// Build the gateway's HTTP router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway WebSocket server and run until Ctrl-C or until
/// `state.shutdown` is cancelled.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.bind_addr());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    let app = router(state.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.clone()))
    .await?;

    let remaining = state.registry.len().await;
    info!(remaining, "Gateway stopped");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    match state.admission.try_admit(addr.ip()) {
        Ok(permit) => ws
            .max_message_size(state.config.media().max_payload + 1024)
            .on_upgrade(move |socket| handle_ws_connection(state, socket, permit)),
        Err(e) => {
            warn!(%addr, error = %e, "Connection rejected at admission");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.admission.active(),
        "sessions": state.registry.len().await,
    }))
}

async fn shutdown_signal(state: Arc<GatewayState>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                error!(%e, "Failed to install Ctrl-C handler");
                state.shutdown.cancelled().await;
            }
        },
        _ = state.shutdown.cancelled() => info!("Shutdown requested"),
    }
    state.shutdown.cancel();
    state.registry.shutdown_all().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxrelay_core::config::Config;

    #[tokio::test]
    async fn test_health_reports_counts() {
        let state = Arc::new(GatewayState::new(Config::default()));
        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_shutdown_signal_follows_token() {
        let state = Arc::new(GatewayState::new(Config::default()));
        let signal = tokio::spawn(shutdown_signal(state.clone()));
        state.shutdown.cancel();
        signal.await.unwrap();
        assert!(state.shutdown.is_cancelled());
    }
}
