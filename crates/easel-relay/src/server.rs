//! WebSocket endpoint and HTTP routes for the relay.
//!
//! ## Endpoints
//!
//! - `GET /` and `GET /ws` - WebSocket upgrade for sandboxes and clients
//! - `GET /health` - Health check with channel and client counts

use crate::config::RelayConfig;
use crate::hub::{encode, ClientId, Hub, Outbox};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use easel_core::protocol::{connected_result, joined_notice};
use easel_core::{Envelope, EnvelopeKind};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Greeting sent to every new connection.
pub const WELCOME: &str = "Please join a channel to start chatting";

/// Shared state for the relay routes.
#[derive(Clone, Default)]
pub struct RelayState {
    hub: Hub,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a reference to the channel hub.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

/// Build the HTTP router for the relay.
pub fn build_router(state: RelayState) -> Router {
    tracing::debug!("Building relay router");

    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_handler(State(state): State<RelayState>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(json!({
        "status": "healthy",
        "service": "easel-relay",
        "channels": state.hub.channel_count(),
        "clients": state.hub.client_count(),
    }))
}

/// Upgrade to a relay socket, or explain how to connect.
async fn ws_handler(ws: Option<WebSocketUpgrade>, State(state): State<RelayState>) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        None => "Please connect via WebSocket".into_response(),
    }
}

/// Serve one relay connection until it closes.
async fn handle_socket(socket: WebSocket, state: RelayState) {
    let client: ClientId = Uuid::new_v4();
    tracing::debug!(%client, "Client connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(encode(&Envelope::system(None, json!(WELCOME))));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state.hub, client, &tx, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%client, error = %e, "Socket error");
                break;
            }
        }
    }

    state.hub.leave(client);
    writer.abort();
    tracing::debug!(%client, "Client disconnected");
}

/// Act on one inbound text frame from `client`.
pub fn handle_frame(hub: &Hub, client: ClientId, outbox: &Outbox, text: &str) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(%client, error = %e, "Invalid frame");
            let _ = outbox.send(encode(&Envelope::error("Invalid message format")));
            return;
        }
    };

    match envelope.kind {
        Some(EnvelopeKind::Join) => handle_join(hub, client, outbox, envelope),
        Some(EnvelopeKind::Message) | Some(EnvelopeKind::ProgressUpdate) => {
            handle_forward(hub, client, outbox, envelope)
        }
        other => {
            tracing::debug!(%client, kind = ?other, "Ignoring frame");
        }
    }
}

fn handle_join(hub: &Hub, client: ClientId, outbox: &Outbox, envelope: Envelope) {
    let channel = match envelope.channel.as_deref().map(str::trim) {
        Some(channel) if !channel.is_empty() => channel.to_string(),
        _ => {
            let _ = outbox.send(encode(&Envelope::error("Channel name is required")));
            return;
        }
    };

    hub.join(client, &channel, outbox.clone());

    let ack = match envelope.id {
        Some(id) => json!({ "id": id, "result": connected_result(&channel) }),
        None => json!(joined_notice(&channel)),
    };
    let _ = outbox.send(encode(&Envelope::system(Some(channel), ack)));
}

fn handle_forward(hub: &Hub, client: ClientId, outbox: &Outbox, envelope: Envelope) {
    let Some(channel) = envelope.channel.clone().or_else(|| hub.channel_of(client)) else {
        let _ = outbox.send(encode(&Envelope::error("You must join a channel first")));
        return;
    };
    let Some(message) = envelope.message else {
        tracing::debug!(%client, channel = %channel, "Frame without message");
        return;
    };

    let forwarded = if envelope.kind == Some(EnvelopeKind::ProgressUpdate) {
        Envelope {
            id: envelope.id,
            kind: Some(EnvelopeKind::ProgressUpdate),
            channel: Some(channel.clone()),
            sender: None,
            message: Some(message),
        }
    } else {
        Envelope::broadcast(channel.clone(), message)
    };

    if let Err(e) = hub.forward(client, &channel, &forwarded) {
        tracing::debug!(%client, channel = %channel, error = %e, "Rejected frame");
        let _ = outbox.send(encode(&Envelope::error(e.to_string())));
    }
}

/// Start the relay on an already bound listener.
///
/// Runs until `shutdown` resolves. Spawns the idle-channel sweeper when the
/// config enables it.
pub async fn serve(
    listener: TcpListener,
    state: RelayState,
    config: &RelayConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let sweeper = config.channel_idle_timeout.map(|idle| {
        let hub = state.hub.clone();
        let every = config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let evicted = hub.evict_idle(idle);
                if !evicted.is_empty() {
                    tracing::debug!(count = evicted.len(), "Swept idle channels");
                }
            }
        })
    });

    let router = build_router(state);
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Relay listening");
    }

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    result
}
