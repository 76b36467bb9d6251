//! Wire protocol for Easel channels.
//!
//! Every frame on the relay socket is a single JSON object (an [`Envelope`]).
//! The `type` field says what the relay should do with it, the nested
//! `message` carries the command request, the correlated reply, or the
//! progress payload.

use crate::error::Result;
use crate::progress::ProgressUpdate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Length of a generated channel token.
pub const CHANNEL_TOKEN_LEN: usize = 8;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Message posted to a joiner when a join carried no correlation id.
pub fn joined_notice(channel: &str) -> String {
    format!("Joined channel: {channel}")
}

/// Result posted to a joiner when a join carried a correlation id.
pub fn connected_result(channel: &str) -> String {
    format!("Connected to channel: {channel}")
}

/// Envelope `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Join (or switch to) a channel.
    Join,
    /// Command request or reply addressed to a channel.
    Message,
    /// Out-of-band progress for a long-running command.
    ProgressUpdate,
    /// A `message` as forwarded by the relay to the other members.
    Broadcast,
    /// Relay notices and join acknowledgements.
    System,
    /// Relay-level rejection of a frame.
    Error,
    /// Anything else; kept so newer relays don't break older peers.
    #[serde(other)]
    Unknown,
}

/// The unit on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Call correlation id (requests and correlated joins).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Frame type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EnvelopeKind>,
    /// Target channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Set by the relay on forwarded frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Nested request, reply, progress payload or notice text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

/// A command request as carried inside `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Correlation id, equal to the outer envelope id.
    pub id: String,
    /// Registered command name.
    pub command: String,
    /// Handler parameters.
    #[serde(default)]
    pub params: Value,
}

impl CommandRequest {
    /// Build a request.
    pub fn new(id: impl Into<String>, command: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            params,
        }
    }
}

/// A correlated reply as carried inside `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    /// Inner id of the request being answered.
    pub id: String,
    /// Handler result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Stringified handler error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    /// Create a success reply.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error reply.
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Check if this reply carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The presence of `error` decides the outcome; a missing result is null.
    pub fn into_result(self) -> std::result::Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// What an inbound frame means to the receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A command to dispatch.
    Request(CommandRequest),
    /// A reply to settle a pending call with.
    Reply(CommandReply),
    /// A progress update for the progress stream.
    Progress(ProgressUpdate),
    /// Relay notice text.
    Notice(String),
    /// Relay rejected one of our frames.
    RelayError(String),
    /// Frame of a known shape whose payload didn't decode.
    Malformed(String),
    /// Nothing for the receiver to act on.
    Ignored,
}

impl Envelope {
    /// Join envelope. `id` makes the relay answer with a correlated reply.
    pub fn join(channel: impl Into<String>, id: Option<String>) -> Self {
        Self {
            id,
            kind: Some(EnvelopeKind::Join),
            channel: Some(channel.into()),
            ..Default::default()
        }
    }

    /// Request envelope for a command.
    pub fn request(channel: impl Into<String>, request: &CommandRequest) -> Result<Self> {
        Ok(Self {
            id: Some(request.id.clone()),
            kind: Some(EnvelopeKind::Message),
            channel: Some(channel.into()),
            message: Some(serde_json::to_value(request)?),
            ..Default::default()
        })
    }

    /// Reply envelope for a dispatched command.
    pub fn reply(channel: impl Into<String>, reply: &CommandReply) -> Result<Self> {
        Ok(Self {
            id: Some(reply.id.clone()),
            kind: Some(EnvelopeKind::Message),
            channel: Some(channel.into()),
            message: Some(serde_json::to_value(reply)?),
            ..Default::default()
        })
    }

    /// Progress envelope.
    pub fn progress(channel: impl Into<String>, update: &ProgressUpdate) -> Result<Self> {
        Ok(Self {
            id: Some(update.command_id.clone()),
            kind: Some(EnvelopeKind::ProgressUpdate),
            channel: Some(channel.into()),
            message: Some(json!({ "data": serde_json::to_value(update)? })),
            ..Default::default()
        })
    }

    /// Relay notice or join acknowledgement.
    pub fn system(channel: Option<String>, message: Value) -> Self {
        Self {
            kind: Some(EnvelopeKind::System),
            channel,
            message: Some(message),
            ..Default::default()
        }
    }

    /// Relay-level error.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: Some(EnvelopeKind::Error),
            message: Some(Value::String(message.into())),
            ..Default::default()
        }
    }

    /// A member's `message` as forwarded to the rest of the channel.
    pub fn broadcast(channel: impl Into<String>, message: Value) -> Self {
        Self {
            kind: Some(EnvelopeKind::Broadcast),
            channel: Some(channel.into()),
            sender: Some("peer".to_string()),
            message: Some(message),
            ..Default::default()
        }
    }

    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as a text frame.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Work out what this frame means to the receiver.
    pub fn classify(self) -> Inbound {
        match self.kind {
            Some(EnvelopeKind::ProgressUpdate) => {
                let data = match self.message {
                    Some(Value::Object(mut map)) => map.remove("data"),
                    _ => None,
                };
                match data.map(serde_json::from_value::<ProgressUpdate>) {
                    Some(Ok(update)) => Inbound::Progress(update),
                    Some(Err(e)) => Inbound::Malformed(format!("progress payload: {e}")),
                    None => Inbound::Malformed("progress update without data".into()),
                }
            }
            Some(EnvelopeKind::Error) => Inbound::RelayError(match self.message {
                Some(Value::String(text)) => text,
                Some(other) => other.to_string(),
                None => "unspecified relay error".into(),
            }),
            Some(EnvelopeKind::Join) => Inbound::Ignored,
            _ => match self.message {
                Some(Value::String(text)) => Inbound::Notice(text),
                Some(message @ Value::Object(_)) => classify_payload(message),
                _ => Inbound::Ignored,
            },
        }
    }
}

fn classify_payload(message: Value) -> Inbound {
    if message.get("command").is_some() {
        return match serde_json::from_value(message) {
            Ok(request) => Inbound::Request(request),
            Err(e) => Inbound::Malformed(format!("request payload: {e}")),
        };
    }
    if message.get("id").is_some() {
        return match serde_json::from_value(message) {
            Ok(reply) => Inbound::Reply(reply),
            Err(e) => Inbound::Malformed(format!("reply payload: {e}")),
        };
    }
    Inbound::Ignored
}

/// Generate a random channel token: 8 lowercase letters and digits.
pub fn generate_channel_token() -> String {
    uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(CHANNEL_TOKEN_LEN)
        .map(|b| TOKEN_ALPHABET[*b as usize % TOKEN_ALPHABET.len()] as char)
        .collect()
}

/// Generate a correlation id: millisecond timestamp prefix, random suffix.
pub fn generate_request_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis:x}-{}", &suffix[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressStatus;

    #[test]
    fn test_join_wire_shape() {
        let text = Envelope::join("abcd1234", None).to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "join", "channel": "abcd1234"}));
    }

    #[test]
    fn test_request_wire_shape() {
        let req = CommandRequest::new("a1", "echo", json!({"v": 1}));
        let env = Envelope::request("abcd1234", &req).unwrap();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "a1",
                "type": "message",
                "channel": "abcd1234",
                "message": {"id": "a1", "command": "echo", "params": {"v": 1}}
            })
        );
    }

    #[test]
    fn test_reply_omits_absent_fields() {
        let ok = serde_json::to_value(CommandReply::success("a1", json!(5))).unwrap();
        assert_eq!(ok, json!({"id": "a1", "result": 5}));

        let err = serde_json::to_value(CommandReply::failure("a1", "boom")).unwrap();
        assert_eq!(err, json!({"id": "a1", "error": "boom"}));
    }

    #[test]
    fn test_into_result() {
        assert_eq!(
            CommandReply::success("x", json!({"v": 1})).into_result(),
            Ok(json!({"v": 1}))
        );
        assert_eq!(
            CommandReply::failure("x", "nope").into_result(),
            Err("nope".to_string())
        );
        let bare = CommandReply {
            id: "x".into(),
            result: None,
            error: None,
        };
        assert_eq!(bare.into_result(), Ok(Value::Null));
    }

    #[test]
    fn test_classify_bare_reply() {
        let env = Envelope::parse(r#"{"message":{"id":"a1","result":{"v":1}}}"#).unwrap();
        assert_eq!(
            env.classify(),
            Inbound::Reply(CommandReply::success("a1", json!({"v": 1})))
        );
    }

    #[test]
    fn test_classify_broadcast_request() {
        let env = Envelope::parse(
            r#"{"type":"broadcast","sender":"peer","channel":"c",
                "message":{"id":"a1","command":"echo","params":{"v":1}}}"#,
        )
        .unwrap();
        assert_eq!(
            env.classify(),
            Inbound::Request(CommandRequest::new("a1", "echo", json!({"v": 1})))
        );
    }

    #[test]
    fn test_classify_request_without_params() {
        let env =
            Envelope::parse(r#"{"type":"message","message":{"id":"z","command":"ping"}}"#).unwrap();
        match env.classify() {
            Inbound::Request(req) => assert_eq!(req.params, Value::Null),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_system_and_error() {
        let notice = Envelope::system(Some("c".into()), json!("Joined channel: c"));
        assert_eq!(notice.classify(), Inbound::Notice("Joined channel: c".into()));

        let ack = Envelope::system(
            Some("c".into()),
            json!({"id": "j1", "result": connected_result("c")}),
        );
        assert!(matches!(ack.classify(), Inbound::Reply(r) if r.id == "j1"));

        let err = Envelope::error("You must join a channel first");
        assert_eq!(
            err.classify(),
            Inbound::RelayError("You must join a channel first".into())
        );
    }

    #[test]
    fn test_classify_progress() {
        let update = ProgressUpdate::new("scan-1", "scan_items", ProgressStatus::Started, "go");
        let env = Envelope::progress("c", &update).unwrap();
        let text = env.to_text().unwrap();
        let parsed = Envelope::parse(&text).unwrap();
        match parsed.classify() {
            Inbound::Progress(p) => {
                assert_eq!(p.command_id, "scan-1");
                assert_eq!(p.status, ProgressStatus::Started);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_malformed_progress() {
        let env = Envelope::parse(r#"{"type":"progress_update","message":{"data":{"x":1}}}"#)
            .unwrap();
        assert!(matches!(env.classify(), Inbound::Malformed(_)));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let env = Envelope::parse(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(env.kind, Some(EnvelopeKind::Unknown));
        assert_eq!(env.classify(), Inbound::Ignored);
    }

    #[test]
    fn test_channel_token_shape() {
        let token = generate_channel_token();
        assert_eq!(token.len(), CHANNEL_TOKEN_LEN);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| generate_request_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
