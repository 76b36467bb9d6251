//! Streamable HTTP transport.
//!
//! MCP traffic is handled by rmcp's `StreamableHttpService` on every path
//! except `GET /health`, which reports the relay link:
//!
//! ```json
//! { "status": "healthy", "service": "easel-mcp",
//!   "relay": { "connected": true, "channel": "k3x9q2ab", "pending_calls": 0, "url": "ws://127.0.0.1:3055" } }
//! ```

use crate::server::EaselServer;
use axum::{extract::State, response::Json, routing::get, Router};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(server: EaselServer) -> Router {
    let sessions = Arc::new(LocalSessionManager::default());
    let factory = server.clone();
    let mcp = StreamableHttpService::new(
        move || Ok(factory.clone()),
        sessions,
        StreamableHttpServerConfig::default(),
    );

    Router::new()
        .route("/health", get(health))
        .fallback_service(mcp)
        .with_state(server)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

async fn health(State(server): State<EaselServer>) -> Json<Value> {
    let relay = server.relay_status().await;
    Json(json!({
        "status": "healthy",
        "service": "easel-mcp",
        "relay": relay,
    }))
}

/// Serve MCP over HTTP on `addr` until `shutdown` resolves.
pub async fn serve(
    server: EaselServer,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "MCP HTTP transport listening");

    axum::serve(listener, build_router(server))
        .with_graceful_shutdown(shutdown)
        .await
}
