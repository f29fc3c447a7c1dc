use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use imkit_core::{ErrorCode, ImError, ImResult};

// ── Frame ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Session,
    Conv,
    Direct,
    Ack,
    Rcp,
    Patch,
    Unread,
    Presence,
    Logs,
    Read,
    Echo,
    Error,
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Session => "session",
            Self::Conv => "conv",
            Self::Direct => "direct",
            Self::Ack => "ack",
            Self::Rcp => "rcp",
            Self::Patch => "patch",
            Self::Unread => "unread",
            Self::Presence => "presence",
            Self::Logs => "logs",
            Self::Read => "read",
            Self::Echo => "echo",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Op {
    Open,
    Opened,
    Close,
    Closed,
    Start,
    Started,
    Query,
    Results,
    Update,
    Updated,
    Add,
    Added,
    Remove,
    Removed,
    Mute,
    Unmute,
    Count,
    MaxRead,
    Joined,
    Left,
    MembersJoined,
    MembersLeft,
    Modify,
    Modified,
}

/// One protocol frame: `{cmd, op?, i?, peerId?, body}`.
///
/// Requests carry a serial `i` that the response echoes. Pushes carry no
/// serial and are routed by `peerId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub cmd: CommandType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Op>,
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<u64>,
    #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl Frame {
    pub fn new(cmd: CommandType, op: Option<Op>, peer_id: Option<&str>, body: Value) -> Self {
        Self {
            cmd,
            op,
            serial: None,
            peer_id: peer_id.map(str::to_string),
            body,
        }
    }

    /// The failure this frame reports, if any.
    pub fn error(&self) -> Option<ImError> {
        let code = self.body.get("code").and_then(Value::as_u64);
        if self.cmd != CommandType::Error && code.is_none() {
            return None;
        }
        let code = code.map_or(ErrorCode::InternalError, ErrorCode::from_server);
        let detail = self
            .body
            .get("reason")
            .or_else(|| self.body.get("detail"))
            .and_then(Value::as_str);
        Some(match detail {
            Some(detail) => ImError::code(code, detail),
            None => ImError::bare(code),
        })
    }

    pub fn into_result(self) -> ImResult<Frame> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Look up a body field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }
}

/// Atomic counter for request serials.
pub(crate) struct SerialCounter {
    counter: AtomicU64,
}

impl SerialCounter {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

// ── Builders ──────────────────────────────────────────────────────────────────

/// Credentials attached to signed operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedFields {
    pub signature: String,
    pub timestamp: i64,
    pub nonce: String,
}

fn insert_signature(body: &mut Map<String, Value>, signed: Option<&SignedFields>) {
    if let Some(signed) = signed {
        body.insert("s".to_string(), Value::String(signed.signature.clone()));
        body.insert("t".to_string(), Value::from(signed.timestamp));
        body.insert("n".to_string(), Value::String(signed.nonce.clone()));
    }
}

/// Heartbeat (no serial, no reply expected).
pub(crate) fn build_echo() -> Frame {
    Frame::new(CommandType::Echo, None, None, json!({}))
}

pub(crate) struct SessionOpen<'a> {
    pub app_id: &'a str,
    pub peer_id: &'a str,
    pub tag: Option<&'a str>,
    pub session_token: Option<&'a str>,
    pub signed: Option<&'a SignedFields>,
    pub reconnect: bool,
    pub no_binary: bool,
    pub push_offline_messages: bool,
}

pub(crate) fn build_session_open(open: &SessionOpen<'_>) -> Frame {
    let mut body = Map::new();
    body.insert("appId".to_string(), Value::String(open.app_id.to_string()));
    body.insert(
        "ua".to_string(),
        Value::String(format!("imkit/{}", env!("CARGO_PKG_VERSION"))),
    );
    if let Some(tag) = open.tag {
        body.insert("tag".to_string(), Value::String(tag.to_string()));
    }
    if let Some(token) = open.session_token {
        body.insert("st".to_string(), Value::String(token.to_string()));
    }
    if open.reconnect {
        body.insert("r".to_string(), Value::Bool(true));
    }
    if open.no_binary {
        body.insert("noBinary".to_string(), Value::Bool(true));
    }
    if open.push_offline_messages {
        body.insert("pushOfflineMessages".to_string(), Value::Bool(true));
    }
    insert_signature(&mut body, open.signed);
    Frame::new(
        CommandType::Session,
        Some(Op::Open),
        Some(open.peer_id),
        Value::Object(body),
    )
}

pub(crate) fn build_session_close(peer_id: &str) -> Frame {
    Frame::new(CommandType::Session, Some(Op::Close), Some(peer_id), json!({}))
}

/// Any `conv` request. `body` must be an object.
pub(crate) fn build_conv(
    op: Op,
    peer_id: &str,
    body: Value,
    signed: Option<&SignedFields>,
) -> Frame {
    let mut body = match body {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    insert_signature(&mut body, signed);
    Frame::new(CommandType::Conv, Some(op), Some(peer_id), Value::Object(body))
}

/// Outgoing message. `envelope` is the message's JSON form.
pub(crate) fn build_direct(
    peer_id: &str,
    conversation_id: &str,
    envelope: Value,
    extra: Map<String, Value>,
) -> Frame {
    let mut body = match envelope {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    body.insert(
        "conversationId".to_string(),
        Value::String(conversation_id.to_string()),
    );
    body.extend(extra);
    Frame::new(CommandType::Direct, None, Some(peer_id), Value::Object(body))
}

/// Acknowledge an incoming message.
pub(crate) fn build_ack(peer_id: &str, conversation_id: &str, message_id: &str) -> Frame {
    Frame::new(
        CommandType::Ack,
        None,
        Some(peer_id),
        json!({ "conversationId": conversation_id, "id": message_id }),
    )
}

pub(crate) fn build_patch(peer_id: &str, patch: Value) -> Frame {
    Frame::new(
        CommandType::Patch,
        Some(Op::Modify),
        Some(peer_id),
        json!({ "patches": [patch] }),
    )
}

pub(crate) fn build_logs(peer_id: &str, conversation_id: &str, mut query: Map<String, Value>) -> Frame {
    query.insert(
        "conversationId".to_string(),
        Value::String(conversation_id.to_string()),
    );
    Frame::new(CommandType::Logs, None, Some(peer_id), Value::Object(query))
}

pub(crate) fn build_read(peer_id: &str, conversations: Vec<Value>) -> Frame {
    Frame::new(
        CommandType::Read,
        None,
        Some(peer_id),
        json!({ "convs": conversations }),
    )
}

pub(crate) fn build_presence_query(peer_id: &str, peer_ids: &[String]) -> Frame {
    Frame::new(
        CommandType::Presence,
        Some(Op::Query),
        Some(peer_id),
        json!({ "sessionPeerIds": peer_ids }),
    )
}
