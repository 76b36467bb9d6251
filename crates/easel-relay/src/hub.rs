//! Channel membership and fan-out.
//!
//! A channel exists while it has members. Each connection belongs to at most
//! one channel; joining another channel leaves the first. Frames are
//! forwarded to every member except the sender.

use easel_core::Envelope;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Identifies one relay connection.
pub type ClientId = Uuid;

/// Queue of encoded frames for one connection.
pub type Outbox = mpsc::UnboundedSender<String>;

/// Notice sent to existing members when someone joins.
pub const PEER_JOINED: &str = "A new user has joined the channel";

/// Notice sent to members of an evicted channel.
pub const CHANNEL_EXPIRED: &str = "Channel closed due to inactivity";

/// Errors from hub operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("You must join a channel first")]
    NotMember,
}

struct ChannelState {
    members: HashMap<ClientId, Outbox>,
    last_activity: Instant,
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, ChannelState>,
    membership: HashMap<ClientId, String>,
}

/// Channel table shared by all connections.
#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `client` to `channel`, creating it if needed.
    ///
    /// Returns how many existing members were told about the join.
    pub fn join(&self, client: ClientId, channel: &str, outbox: Outbox) -> usize {
        let mut state = self.state.lock();
        if state.membership.get(&client).map(String::as_str) != Some(channel) {
            remove_member(&mut state, client);
        }

        let now = Instant::now();
        let entry = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                tracing::info!(channel, "Channel created");
                ChannelState {
                    members: HashMap::new(),
                    last_activity: now,
                }
            });
        entry.last_activity = now;

        let notice = encode(&Envelope::system(Some(channel.to_string()), json!(PEER_JOINED)));
        let mut notified = 0;
        for (member, member_outbox) in &entry.members {
            if *member != client && member_outbox.send(notice.clone()).is_ok() {
                notified += 1;
            }
        }
        entry.members.insert(client, outbox);
        let members = entry.members.len();
        state.membership.insert(client, channel.to_string());

        tracing::info!(%client, channel, members, "Client joined channel");
        notified
    }

    /// Remove `client` from its channel. Returns the channel it left.
    pub fn leave(&self, client: ClientId) -> Option<String> {
        let mut state = self.state.lock();
        remove_member(&mut state, client)
    }

    /// Channel `client` belongs to.
    pub fn channel_of(&self, client: ClientId) -> Option<String> {
        self.state.lock().membership.get(&client).cloned()
    }

    /// Send `envelope` to every member of `channel` except `from`.
    ///
    /// Fails if `from` is not a member of `channel`. Returns the number of
    /// members reached.
    pub fn forward(&self, from: ClientId, channel: &str, envelope: &Envelope) -> Result<usize, HubError> {
        let mut state = self.state.lock();
        if state.membership.get(&from).map(String::as_str) != Some(channel) {
            return Err(HubError::NotMember);
        }
        let Some(entry) = state.channels.get_mut(channel) else {
            return Err(HubError::NotMember);
        };
        entry.last_activity = Instant::now();

        let text = encode(envelope);
        let mut delivered = 0;
        for (member, outbox) in &entry.members {
            if *member != from && outbox.send(text.clone()).is_ok() {
                delivered += 1;
            }
        }
        tracing::trace!(%from, channel, delivered, "Forwarded frame");
        Ok(delivered)
    }

    /// Drop channels with no traffic for `idle`. Members are told and must
    /// join again.
    pub fn evict_idle(&self, idle: Duration) -> Vec<String> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let expired: Vec<String> = state
            .channels
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_activity) >= idle)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &expired {
            if let Some(channel) = state.channels.remove(name) {
                let notice = encode(&Envelope::system(Some(name.clone()), json!(CHANNEL_EXPIRED)));
                for (member, outbox) in channel.members {
                    let _ = outbox.send(notice.clone());
                    state.membership.remove(&member);
                }
                tracing::info!(channel = %name, "Evicted idle channel");
            }
        }
        expired
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().membership.len()
    }

    /// Member count of `channel` (0 if it doesn't exist).
    pub fn member_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel)
            .map_or(0, |c| c.members.len())
    }
}

fn remove_member(state: &mut HubState, client: ClientId) -> Option<String> {
    let channel = state.membership.remove(&client)?;
    let now_empty = match state.channels.get_mut(&channel) {
        Some(entry) => {
            entry.members.remove(&client);
            entry.members.is_empty()
        }
        None => false,
    };
    if now_empty {
        state.channels.remove(&channel);
        tracing::info!(channel = %channel, "Channel destroyed (empty)");
    }
    tracing::debug!(%client, channel = %channel, "Client left channel");
    Some(channel)
}

/// Encode a relay-generated envelope. These never fail to serialize.
pub(crate) fn encode(envelope: &Envelope) -> String {
    envelope
        .to_text()
        .unwrap_or_else(|_| Value::Null.to_string())
}
