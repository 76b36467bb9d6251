//! Relay client used by the automation server.
//!
//! Opens a WebSocket to the relay, joins a channel, sends command envelopes
//! and awaits their correlated replies. Inbound frames are read by a single
//! background task that settles pending calls and republishes progress.
//! Outbound frames go through an unbounded queue drained by a writer task, so
//! callers never hold the socket.

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::correlation::{Correlator, PendingReply};
use crate::error::{RelayError, Result};
use crate::progress::{ProgressStream, ProgressUpdate};
use crate::protocol::{CommandRequest, Envelope, Inbound};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Snapshot of the client's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Socket to the relay is open.
    pub connected: bool,
    /// Channel joined (kept across reconnects).
    pub channel: Option<String>,
    /// Calls awaiting a reply.
    pub pending_calls: usize,
    /// Relay URL.
    pub url: String,
}

#[derive(Default)]
struct Session {
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    channel: Option<String>,
}

struct Inner {
    config: ClientConfig,
    correlator: Correlator,
    progress: ProgressStream,
    session: Mutex<Session>,
    closed: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Client side of a relay channel.
///
/// Cheap to clone; clones share the connection, the pending-call table and
/// the progress stream. Call [`close`](Self::close) to stop the background
/// tasks.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    /// Connect to the relay.
    ///
    /// The first connection attempt must succeed. Later drops are retried in
    /// the background when `auto_reconnect` is set. Without it, a drop
    /// closes the client and outstanding calls fail with
    /// [`RelayError::Disconnected`].
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the relay is unreachable
    /// within `connect_timeout`.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(url = %config.url, "Connecting to relay");

        let ws = open(&config).await?;
        tracing::info!(url = %config.url, "Connected to relay");

        let inner = Arc::new(Inner {
            correlator: Correlator::new(config.request_timeout)
                .with_max_extensions(config.keepalive_max_extensions),
            progress: ProgressStream::default(),
            session: Mutex::new(Session::default()),
            closed: AtomicBool::new(false),
            supervisor: Mutex::new(None),
            config,
        });

        // Install the writer before returning so callers can send right away.
        let (tx, rx) = mpsc::unbounded_channel();
        inner.session.lock().outgoing = Some(tx);

        let handle = tokio::spawn(supervise(Arc::clone(&inner), ws, rx));
        *inner.supervisor.lock() = Some(handle);

        Ok(Self { inner })
    }

    /// Join a channel, leaving any previous one.
    ///
    /// Resolves once the relay acknowledges the join.
    pub async fn join_channel(&self, channel: &str) -> Result<()> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(RelayError::Config("channel name must not be empty".into()));
        }
        let outgoing = self.outgoing()?;

        let pending = self.inner.correlator.register(None, "join")?;
        let envelope = Envelope::join(channel, Some(pending.id().to_string()));
        self.transmit(&outgoing, &pending, envelope)?;

        let ack = pending.await?;
        self.inner.session.lock().channel = Some(channel.to_string());
        tracing::info!(channel, ack = %ack, "Joined channel");
        Ok(())
    }

    /// Send a command and wait for its correlated result.
    pub async fn send_command(&self, command: &str, params: Value) -> Result<Value> {
        self.call(None, command, params, None).await
    }

    /// Send a command under a caller-chosen correlation id.
    pub async fn send_command_with_id(
        &self,
        id: impl Into<String>,
        command: &str,
        params: Value,
    ) -> Result<Value> {
        self.call(Some(id.into()), command, params, None).await
    }

    /// Send a command with a reply window other than the configured one.
    pub async fn send_command_with_timeout(
        &self,
        command: &str,
        params: Value,
        window: Duration,
    ) -> Result<Value> {
        self.call(None, command, params, Some(window)).await
    }

    async fn call(
        &self,
        id: Option<String>,
        command: &str,
        params: Value,
        window: Option<Duration>,
    ) -> Result<Value> {
        let outgoing = self.outgoing()?;
        let channel = self
            .channel()
            .ok_or_else(|| RelayError::NotConnected("no channel joined".into()))?;

        let pending = match window {
            Some(window) => self
                .inner
                .correlator
                .register_with_timeout(id, command, window)?,
            None => self.inner.correlator.register(id, command)?,
        };
        let request = CommandRequest::new(pending.id(), command, params);
        let envelope = Envelope::request(&channel, &request)?;

        tracing::debug!(id = %request.id, command, channel = %channel, "Sending command");
        self.transmit(&outgoing, &pending, envelope)?;
        pending.await
    }

    /// Queue an envelope for a registered call, failing the call if the
    /// connection is already gone.
    fn transmit(
        &self,
        outgoing: &mpsc::UnboundedSender<Message>,
        pending: &PendingReply,
        envelope: Envelope,
    ) -> Result<()> {
        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(e) => {
                self.inner
                    .correlator
                    .fail(pending.id(), RelayError::Connection(e.to_string()));
                return Err(e);
            }
        };
        if outgoing.send(Message::Text(text.into())).is_err() {
            self.inner.correlator.fail(
                pending.id(),
                RelayError::Connection("relay socket closed".into()),
            );
        }
        Ok(())
    }

    fn outgoing(&self) -> Result<mpsc::UnboundedSender<Message>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RelayError::Disconnected);
        }
        self.inner
            .session
            .lock()
            .outgoing
            .clone()
            .ok_or_else(|| RelayError::NotConnected("not connected to relay".into()))
    }

    /// Channel currently joined.
    pub fn channel(&self) -> Option<String> {
        self.inner.session.lock().channel.clone()
    }

    /// Check if the client was closed, or lost its socket with
    /// auto-reconnect off. A closed client never reconnects.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Check if the socket to the relay is open.
    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().outgoing.is_some()
    }

    /// Connection snapshot.
    pub fn status(&self) -> ConnectionStatus {
        let session = self.inner.session.lock();
        ConnectionStatus {
            connected: session.outgoing.is_some(),
            channel: session.channel.clone(),
            pending_calls: self.inner.correlator.len(),
            url: self.inner.config.url.clone(),
        }
    }

    /// Number of calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Progress stream fed by `progress_update` frames.
    pub fn progress(&self) -> &ProgressStream {
        &self.inner.progress
    }

    /// Subscribe to progress updates.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.inner.progress.subscribe()
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Close the connection for good.
    ///
    /// Stops reconnecting and rejects every outstanding call with
    /// [`RelayError::Disconnected`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(url = %self.inner.config.url, "Closing relay client");

        let outgoing = {
            let mut session = self.inner.session.lock();
            session.channel = None;
            session.outgoing.take()
        };
        if let Some(outgoing) = outgoing {
            let _ = outgoing.send(Message::Close(None));
        }

        let handle = self.inner.supervisor.lock().take();
        if let Some(mut handle) = handle {
            // The read loop ends once the relay answers the close frame.
            if timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                tracing::debug!("Relay did not finish closing in time");
                handle.abort();
            }
        }

        let failed = self.inner.correlator.fail_all(|| RelayError::Disconnected);
        if failed > 0 {
            tracing::debug!(failed, "Rejected outstanding calls on close");
        }
    }
}

/// Open one socket to the relay.
async fn open(config: &ClientConfig) -> Result<WsStream> {
    let (ws, _response) = timeout(config.connect_timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| {
            RelayError::Connection(format!(
                "connect timeout after {:?}",
                config.connect_timeout
            ))
        })??;
    Ok(ws)
}

/// Owns the socket for the client's lifetime: runs a connection until it
/// drops, then reconnects with backoff unless closed.
async fn supervise(inner: Arc<Inner>, ws: WsStream, rx: mpsc::UnboundedReceiver<Message>) {
    let mut backoff = Backoff::new(
        inner.config.reconnect_min_delay,
        inner.config.reconnect_max_delay,
    );
    let mut next = Some((ws, rx));

    loop {
        if let Some((ws, rx)) = next.take() {
            backoff.reset();
            run_connection(&inner, ws, rx).await;
            inner.session.lock().outgoing = None;
            tracing::info!(url = %inner.config.url, "Relay connection closed");
        }

        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        if !inner.config.auto_reconnect {
            shut_down(&inner);
            break;
        }

        let delay = backoff.next_delay();
        tracing::info!(
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to relay"
        );
        tokio::time::sleep(delay).await;
        if inner.closed.load(Ordering::Acquire) {
            break;
        }

        match open(&inner.config).await {
            Ok(ws) => {
                let (tx, rx) = mpsc::unbounded_channel();
                // The join goes first on the new queue; only then can callers
                // see the connection.
                let rejoin = inner.session.lock().channel.clone();
                if let Some(channel) = rejoin {
                    tracing::info!(channel = %channel, "Rejoining channel after reconnect");
                    if let Ok(text) = Envelope::join(channel, None).to_text() {
                        let _ = tx.send(Message::Text(text.into()));
                    }
                }
                inner.session.lock().outgoing = Some(tx);
                tracing::info!(url = %inner.config.url, "Reconnected to relay");
                next = Some((ws, rx));
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = backoff.attempts(), "Reconnect failed");
            }
        }
    }

    tracing::debug!("Relay supervisor exited");
}

/// The socket dropped and will not be reopened: settle every outstanding
/// call now and make later sends fail with `Disconnected`.
fn shut_down(inner: &Inner) {
    if inner.closed.swap(true, Ordering::AcqRel) {
        // close() got there first and fails the calls itself.
        return;
    }
    inner.session.lock().channel = None;
    let failed = inner.correlator.fail_all(|| RelayError::Disconnected);
    tracing::warn!(
        url = %inner.config.url,
        failed,
        "Relay connection lost and auto-reconnect is off"
    );
}

/// Pump one socket until it closes.
async fn run_connection(inner: &Arc<Inner>, ws: WsStream, mut rx: mpsc::UnboundedReceiver<Message>) {
    let (mut sink, mut stream) = ws.split();

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

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(inner, text.as_str()),
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

fn handle_text(inner: &Inner, text: &str) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "Discarding undecodable frame");
            return;
        }
    };

    match envelope.classify() {
        Inbound::Reply(reply) => {
            inner.correlator.resolve(reply);
        }
        Inbound::Progress(update) => {
            if inner.config.progress_keepalive {
                inner.correlator.extend(&update.command_id);
            }
            inner.progress.publish(update);
        }
        Inbound::Notice(text) => tracing::debug!(notice = %text, "Relay notice"),
        Inbound::RelayError(text) => tracing::warn!(error = %text, "Relay rejected a frame"),
        Inbound::Request(request) => {
            tracing::trace!(id = %request.id, command = %request.command, "Ignoring peer request")
        }
        Inbound::Malformed(reason) => tracing::warn!(reason = %reason, "Malformed frame"),
        Inbound::Ignored => tracing::trace!("Ignoring frame"),
    }
}
