//! Sandbox side of a relay channel.
//!
//! [`ChannelTransport`] opens a socket to the relay, joins a freshly generated
//! channel token and serves the requests that arrive on it. Each request runs
//! in its own task, so replies may complete out of order. A reply always
//! goes back on the connection that delivered its request; if that
//! connection is gone by then the reply is dropped.

use crate::config::PluginConfig;
use crate::dispatch::{ProgressReporter, Registry};
use crate::error::{Result, TransportError};
use easel_core::protocol::{generate_channel_token, generate_request_id};
use easel_core::{Backoff, CommandRequest, Envelope, Inbound, ProgressStream, ProgressUpdate};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Outgoing = mpsc::UnboundedSender<Message>;

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// The relay acknowledged the join.
    Joined { channel: String },
    /// Waiting `delay` before reconnect attempt `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
}

struct Session {
    generation: u64,
    channel: String,
    outgoing: Option<Outgoing>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    config: PluginConfig,
    registry: Arc<Registry>,
    progress: ProgressStream,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    generations: Mutex<u64>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    fn set_outgoing(&self, generation: u64, outgoing: Option<Outgoing>) {
        if let Some(session) = self.session.lock().as_mut() {
            if session.generation == generation {
                session.outgoing = outgoing;
            }
        }
    }
}

/// Sandbox-side channel transport.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<Inner>,
}

impl ChannelTransport {
    /// Create a transport serving `registry`.
    pub fn new(config: PluginConfig, registry: Registry) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Arc::new(registry),
                progress: ProgressStream::default(),
                state,
                session: Mutex::new(None),
                generations: Mutex::new(0),
            }),
        }
    }

    /// Connect to the relay on `port` and join a new channel.
    ///
    /// Does nothing if already connected. Returns the channel token to hand
    /// to the automation side. With auto-reconnect enabled a failed first
    /// attempt is retried in the background; without it the error is
    /// returned.
    pub async fn connect(&self, port: u16) -> Result<String> {
        if let Some(channel) = self.channel() {
            tracing::debug!(channel = %channel, "Already connected");
            return Ok(channel);
        }
        self.inner.config.validate()?;

        let url = self.inner.config.url(port);
        let channel = generate_channel_token();
        self.inner.set_state(ConnectionState::Connecting);
        tracing::info!(url = %url, channel = %channel, "Connecting to relay");

        let first = match open(&url, self.inner.config.connect_timeout).await {
            Ok(ws) => Some(ws),
            Err(e) if self.inner.config.auto_reconnect => {
                tracing::warn!(error = %e, "Initial connection failed, will retry");
                None
            }
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let generation = {
            let mut counter = self.inner.generations.lock();
            *counter += 1;
            *counter
        };

        let mut session = self.inner.session.lock();
        if let Some(existing) = session.as_ref() {
            // Lost a race with a concurrent connect.
            return Ok(existing.channel.clone());
        }
        let task = tokio::spawn(run_session(
            Arc::clone(&self.inner),
            generation,
            url,
            channel.clone(),
            first,
        ));
        *session = Some(Session {
            generation,
            channel: channel.clone(),
            outgoing: None,
            task: Some(task),
        });

        Ok(channel)
    }

    /// Close the socket and forget the channel.
    pub async fn disconnect(&self) {
        let Some(session) = self.inner.session.lock().take() else {
            return;
        };
        tracing::info!(channel = %session.channel, "Disconnecting from relay");

        if let Some(outgoing) = &session.outgoing {
            let _ = outgoing.send(Message::Close(None));
        }
        if let Some(task) = session.task {
            task.abort();
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Close the current socket as if the network had dropped it.
    ///
    /// The session survives: with auto-reconnect the transport reopens and
    /// rejoins the same channel. Requests still running lose their reply.
    pub fn drop_connection(&self) {
        let outgoing = self
            .inner
            .session
            .lock()
            .as_mut()
            .and_then(|s| s.outgoing.take());
        if let Some(outgoing) = outgoing {
            tracing::info!("Dropping relay connection");
            let _ = outgoing.send(Message::Close(None));
        }
    }

    /// Channel token of the current session.
    pub fn channel(&self) -> Option<String> {
        self.inner.session.lock().as_ref().map(|s| s.channel.clone())
    }

    /// Check if a socket to the relay is open.
    pub fn is_connected(&self) -> bool {
        self.inner
            .session
            .lock()
            .as_ref()
            .is_some_and(|s| s.outgoing.is_some())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the relay acknowledges a join. Returns the channel.
    pub async fn wait_joined(&self) -> Result<String> {
        let mut rx = self.watch_state();
        let state = rx
            .wait_for(|state| matches!(state, ConnectionState::Joined { .. }))
            .await
            .map_err(|_| TransportError::Connection("transport dropped".into()))?;
        match &*state {
            ConnectionState::Joined { channel } => Ok(channel.clone()),
            _ => Err(TransportError::Connection("not joined".into())),
        }
    }

    /// Progress updates emitted by local handlers and received from peers.
    pub fn progress(&self) -> &ProgressStream {
        &self.inner.progress
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }
}

/// Open one socket to the relay.
async fn open(url: &str, limit: Duration) -> Result<WsStream> {
    let (ws, _response) = timeout(limit, connect_async(url))
        .await
        .map_err(|_| TransportError::Connection(format!("connect timeout after {limit:?}")))??;
    Ok(ws)
}

/// Drive one session: run connections back to back, reconnecting with
/// backoff when enabled.
async fn run_session(
    inner: Arc<Inner>,
    generation: u64,
    url: String,
    channel: String,
    first: Option<WsStream>,
) {
    let mut backoff = Backoff::new(
        inner.config.reconnect_min_delay,
        inner.config.reconnect_max_delay,
    );
    let mut next = first;

    loop {
        let ws = match next.take() {
            Some(ws) => ws,
            None => {
                let delay = backoff.next_delay();
                let attempt = backoff.attempts();
                tracing::info!(
                    channel = %channel,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting to relay"
                );
                inner.set_state(ConnectionState::Reconnecting { attempt, delay });
                tokio::time::sleep(delay).await;

                inner.set_state(ConnectionState::Connecting);
                match open(&url, inner.config.connect_timeout).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "Reconnect failed");
                        continue;
                    }
                }
            }
        };

        backoff.reset();
        run_connection(&inner, generation, &channel, ws).await;
        inner.set_outgoing(generation, None);
        tracing::info!(channel = %channel, "Relay connection closed");

        if !inner.config.auto_reconnect || !inner.is_current(generation) {
            break;
        }
    }

    // Tear down unless disconnect() or a new session already did.
    let mut session = inner.session.lock();
    if session.as_ref().is_some_and(|s| s.generation == generation) {
        *session = None;
        inner.set_state(ConnectionState::Disconnected);
    }
}

/// Pump one socket until it closes.
async fn run_connection(inner: &Arc<Inner>, generation: u64, channel: &str, ws: WsStream) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                tracing::debug!(error = %e, "Relay write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Join on every open; the relay answers the correlated join directly.
    let join_id = generate_request_id();
    match Envelope::join(channel, Some(join_id.clone())).to_text() {
        Ok(text) => {
            let _ = tx.send(Message::Text(text));
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode join"),
    }
    inner.set_outgoing(generation, Some(tx.clone()));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(inner, channel, &tx, &join_id, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Relay read error");
                break;
            }
        }
    }

    writer.abort();
}

fn handle_text(inner: &Arc<Inner>, channel: &str, tx: &Outgoing, join_id: &str, text: &str) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "Discarding undecodable frame");
            return;
        }
    };

    match envelope.classify() {
        Inbound::Request(request) => spawn_dispatch(inner, channel, tx.clone(), request),
        Inbound::Reply(reply) if reply.id == join_id => {
            tracing::info!(channel, "Joined channel");
            inner.set_state(ConnectionState::Joined {
                channel: channel.to_string(),
            });
        }
        Inbound::Reply(reply) => {
            tracing::debug!(id = %reply.id, "Dropping reply; sandbox issues no calls")
        }
        Inbound::Progress(update) => {
            inner.progress.publish(update);
        }
        Inbound::Notice(text) => tracing::debug!(notice = %text, "Relay notice"),
        Inbound::RelayError(text) => tracing::warn!(error = %text, "Relay rejected a frame"),
        Inbound::Malformed(reason) => tracing::warn!(reason = %reason, "Malformed frame"),
        Inbound::Ignored => tracing::trace!("Ignoring frame"),
    }
}

/// Run one request in its own task and reply on `tx`.
fn spawn_dispatch(inner: &Arc<Inner>, channel: &str, tx: Outgoing, request: CommandRequest) {
    let registry = Arc::clone(&inner.registry);
    let reporter = progress_reporter(inner.progress.clone(), channel.to_string(), tx.clone());
    let channel = channel.to_string();

    tokio::spawn(async move {
        let reply = registry
            .dispatch(request, Some(channel.clone()), reporter)
            .await;
        let text = match Envelope::reply(&channel, &reply).and_then(|e| e.to_text()) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(id = %reply.id, error = %e, "Failed to encode reply");
                return;
            }
        };
        if tx.send(Message::Text(text)).is_err() {
            tracing::warn!(id = %reply.id, "Connection closed before reply; dropping it");
        }
    });
}

/// Reporter that forwards a handler's updates to the relay and republishes
/// them locally.
fn progress_reporter(local: ProgressStream, channel: String, tx: Outgoing) -> ProgressReporter {
    ProgressReporter::new(move |update: ProgressUpdate| {
        match Envelope::progress(&channel, &update).and_then(|e| e.to_text()) {
            Ok(text) => {
                if tx.send(Message::Text(text)).is_err() {
                    tracing::debug!(command_id = %update.command_id, "Dropping progress; connection closed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode progress"),
        }
        local.publish(update);
    })
}
