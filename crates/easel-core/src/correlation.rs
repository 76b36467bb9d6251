//! Request/response correlation over a multiplexed channel.
//!
//! A [`Correlator`] owns the pending-call table. Each registered call gets a
//! unique id, a oneshot sender and its own deadline task. The first of
//! (matching reply, deadline, shutdown) settles the call and removes the
//! entry; anything arriving afterwards for that id is dropped.

use crate::error::{RelayError, Result};
use crate::protocol::{generate_request_id, CommandReply};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default reply window for a call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on keep-alive extensions per call.
pub const DEFAULT_MAX_EXTENSIONS: u32 = 10;

struct PendingCall {
    command: String,
    window: Duration,
    deadline: Instant,
    extensions: u32,
    tx: oneshot::Sender<Result<Value>>,
    timer: JoinHandle<()>,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingCall>>>;

/// Pending-call table with per-call deadlines.
///
/// Cloning shares the table.
#[derive(Clone)]
pub struct Correlator {
    pending: PendingTable,
    timeout: Duration,
    max_extensions: u32,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.len())
            .field("timeout", &self.timeout)
            .field("max_extensions", &self.max_extensions)
            .finish()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            max_extensions: DEFAULT_MAX_EXTENSIONS,
        }
    }

    /// Limit how many times [`extend`](Self::extend) may push out one
    /// call's deadline. A call lives at most `(max + 1)` windows.
    pub fn with_max_extensions(mut self, max: u32) -> Self {
        self.max_extensions = max;
        self
    }

    /// Reply window applied to new calls.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a call and start its deadline.
    ///
    /// With `id == None` a fresh id is generated. A caller-chosen id that is
    /// still outstanding is rejected.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(&self, id: Option<String>, command: &str) -> Result<PendingReply> {
        self.register_with_timeout(id, command, self.timeout)
    }

    /// Register a call with its own reply window.
    pub fn register_with_timeout(
        &self,
        id: Option<String>,
        command: &str,
        window: Duration,
    ) -> Result<PendingReply> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + window;

        let mut table = self.pending.lock();
        let id = match id {
            Some(id) if table.contains_key(&id) => return Err(RelayError::DuplicateId(id)),
            Some(id) => id,
            None => loop {
                let candidate = generate_request_id();
                if !table.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let timer = tokio::spawn(expire(
            Arc::clone(&self.pending),
            id.clone(),
            deadline,
            window,
        ));
        table.insert(
            id.clone(),
            PendingCall {
                command: command.to_string(),
                window,
                deadline,
                extensions: 0,
                tx,
                timer,
            },
        );
        tracing::trace!(id = %id, command, pending = table.len(), "Registered pending call");

        Ok(PendingReply { id, rx })
    }

    /// Settle the call a reply belongs to.
    ///
    /// Returns false (and does nothing) when no call with that id is pending.
    pub fn resolve(&self, reply: CommandReply) -> bool {
        let Some(call) = self.pending.lock().remove(&reply.id) else {
            tracing::trace!(id = %reply.id, "Dropping unmatched reply");
            return false;
        };
        call.timer.abort();

        tracing::debug!(
            id = %reply.id,
            command = %call.command,
            is_error = reply.is_error(),
            "Call settled by reply"
        );
        let _ = call.tx.send(reply.into_result().map_err(RelayError::Remote));
        true
    }

    /// Fail one call locally, e.g. when its request could not be written.
    pub fn fail(&self, id: &str, error: RelayError) -> bool {
        let Some(call) = self.pending.lock().remove(id) else {
            return false;
        };
        call.timer.abort();
        tracing::debug!(id, command = %call.command, error = %error, "Call failed locally");
        let _ = call.tx.send(Err(error));
        true
    }

    /// Push a call's deadline out by a full window.
    ///
    /// Returns false when no such call is pending or it has used up its
    /// extensions; the deadline is then left alone.
    pub fn extend(&self, id: &str) -> bool {
        let mut table = self.pending.lock();
        let Some(call) = table.get_mut(id) else {
            return false;
        };
        if call.extensions >= self.max_extensions {
            tracing::debug!(id, command = %call.command, "Keep-alive limit reached");
            return false;
        }
        call.extensions += 1;
        call.deadline = Instant::now() + call.window;
        tracing::trace!(
            id,
            command = %call.command,
            extensions = call.extensions,
            "Extended call deadline"
        );
        true
    }

    /// Fail every outstanding call. Returns how many were failed.
    pub fn fail_all(&self, error: impl Fn() -> RelayError) -> usize {
        let drained: Vec<(String, PendingCall)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (id, call) in drained {
            call.timer.abort();
            let err = error();
            tracing::debug!(id = %id, command = %call.command, error = %err, "Failing pending call");
            let _ = call.tx.send(Err(err));
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deadline task for one call. Re-arms itself when the deadline was extended.
async fn expire(pending: PendingTable, id: String, mut at: Instant, window: Duration) {
    loop {
        tokio::time::sleep_until(at).await;

        let expired = {
            let mut table = pending.lock();
            let deadline = match table.get(&id) {
                Some(call) => call.deadline,
                None => return,
            };
            if deadline > at {
                at = deadline;
                None
            } else {
                table.remove(&id)
            }
        };

        if let Some(call) = expired {
            tracing::warn!(
                id = %id,
                command = %call.command,
                timeout_ms = window.as_millis() as u64,
                "Call timed out"
            );
            let _ = call.tx.send(Err(RelayError::Timeout { id, after: window }));
            return;
        }
    }
}

/// Future for a registered call's outcome.
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    /// Correlation id of the call.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(RelayError::Disconnected)))
    }
}
