use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use imkit_core::{time, ErrorCode, ImError, ImResult};
use imkit_message::Message;
use imkit_query::MAX_LIMIT;

use crate::conversation::Conversation;
use crate::signature::SignatureFactory;

// ── Connection State ──────────────────────────────────────────────────────────

/// Lifecycle of the shared connection owned by a `Realtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing connected yet; the first client triggers the connection.
    Idle,
    Connecting,
    Connected,
    /// The link dropped and the backoff loop is running.
    Reconnecting,
    /// Reconnection attempts are exhausted. `retry()` starts over.
    Offline,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Offline => write!(f, "offline"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Disconnect,
    /// A reconnect attempt is scheduled after `delay`.
    Schedule { attempt: u32, delay: Duration },
    Retry { attempt: u32 },
    Reconnect,
    /// Reconnection gave up; pending calls were failed with `code`.
    ReconnectError { code: ErrorCode },
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Message {
        conversation: Conversation,
        message: Message,
    },
    /// The local client was added to a conversation.
    Invited {
        conversation: Conversation,
        invited_by: Option<String>,
    },
    /// The local client was removed from a conversation.
    Kicked {
        conversation: Conversation,
        kicked_by: Option<String>,
    },
    MembersJoined {
        conversation: Conversation,
        members: Vec<String>,
        invited_by: Option<String>,
    },
    MembersLeft {
        conversation: Conversation,
        members: Vec<String>,
        kicked_by: Option<String>,
    },
    MessageRecall {
        conversation: Conversation,
        message: Message,
    },
    MessageUpdate {
        conversation: Conversation,
        message: Message,
    },
    UnreadMessagesCountUpdate(Vec<Conversation>),
    Disconnect,
    Reconnect,
    /// Another session for the same identity displaced this one.
    Conflict { reason: Option<String> },
    Close {
        code: ErrorCode,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Message(Message),
    /// A message sent with `receipt` reached its recipients.
    Receipt { message: Message },
    LastDeliveredAtUpdate(DateTime<Utc>),
    LastReadAtUpdate(DateTime<Utc>),
    MembersJoined {
        members: Vec<String>,
        invited_by: Option<String>,
    },
    MembersLeft {
        members: Vec<String>,
        kicked_by: Option<String>,
    },
    MessageRecall(Message),
    MessageUpdate(Message),
    UnreadMessagesCountUpdate { count: u32, mentioned: bool },
    InfoUpdated {
        attributes: Map<String, Value>,
        updated_by: Option<String>,
    },
}

// ── Conversation Kinds ────────────────────────────────────────────────────────

/// The conversation variant, derived from the `tr`/`sys` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationKind {
    #[default]
    Conversation,
    /// Transient, broadcast-style. No receipts, no unread counting.
    ChatRoom,
    /// System-managed. Membership cannot be changed by clients.
    ServiceConversation,
}

impl ConversationKind {
    pub fn from_flags(transient: bool, system: bool) -> Self {
        if system {
            Self::ServiceConversation
        } else if transient {
            Self::ChatRoom
        } else {
            Self::Conversation
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation => write!(f, "Conversation"),
            Self::ChatRoom => write!(f, "ChatRoom"),
            Self::ServiceConversation => write!(f, "ServiceConversation"),
        }
    }
}

/// Options for `IMClient::create_conversation`.
#[derive(Debug, Clone, Default)]
pub struct ConversationOptions {
    pub members: Vec<String>,
    pub name: Option<String>,
    pub transient: bool,
    /// Return the existing conversation with the same member set, if any.
    pub unique: bool,
    pub attributes: Map<String, Value>,
}

impl ConversationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Read-state markers fetched by `fetch_receipt_timestamps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiptTimestamps {
    pub last_delivered_at: Option<DateTime<Utc>>,
    pub last_read_at: Option<DateTime<Utc>>,
}

// ── Client Options ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Device tag. Sessions sharing a tag displace each other.
    pub tag: Option<String>,
    pub signature_factory: Option<SignatureFactory>,
    pub conversation_signature_factory: Option<SignatureFactory>,
    /// Opaque token from the authentication collaborator.
    pub session_token: Option<String>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn signature_factory(mut self, factory: SignatureFactory) -> Self {
        self.signature_factory = Some(factory);
        self
    }

    pub fn conversation_signature_factory(mut self, factory: SignatureFactory) -> Self {
        self.conversation_signature_factory = Some(factory);
        self
    }

    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

// ── Sending ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePriority {
    Low,
    Normal,
    High,
}

impl MessagePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Ask for a delivery receipt. Ignored for chat rooms.
    pub receipt: bool,
    /// Send without persisting or pushing offline.
    pub transient: bool,
    /// Deliver to other members if this session drops unexpectedly.
    pub will: bool,
    /// Only honoured for chat rooms.
    pub priority: Option<MessagePriority>,
    pub push_data: Option<Value>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receipt(mut self, receipt: bool) -> Self {
        self.receipt = receipt;
        self
    }

    pub fn transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn will(mut self, will: bool) -> Self {
        self.will = will;
        self
    }

    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn push_data(mut self, data: Value) -> Self {
        self.push_data = Some(data);
        self
    }
}

// ── Message History ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageQueryDirection {
    #[default]
    NewToOld,
    OldToNew,
}

impl MessageQueryDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::NewToOld => "newToOld",
            Self::OldToNew => "oldToNew",
        }
    }
}

/// History query for `Conversation::query_messages`.
///
/// Use either the `before_*`/`after_*` form or the `start_*`/`end_*` form
/// with a direction; mixing them is rejected.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    pub before_time: Option<DateTime<Utc>>,
    pub before_message_id: Option<String>,
    pub after_time: Option<DateTime<Utc>>,
    pub after_message_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub start_message_id: Option<String>,
    pub start_closed: bool,
    pub end_time: Option<DateTime<Utc>>,
    pub end_message_id: Option<String>,
    pub end_closed: bool,
    pub direction: Option<MessageQueryDirection>,
    /// Only messages of this typed discriminant.
    pub message_type: Option<i32>,
}

impl MessageQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn before(mut self, time: DateTime<Utc>, message_id: Option<String>) -> Self {
        self.before_time = Some(time);
        self.before_message_id = message_id;
        self
    }

    pub fn after(mut self, time: DateTime<Utc>, message_id: Option<String>) -> Self {
        self.after_time = Some(time);
        self.after_message_id = message_id;
        self
    }

    pub fn start(mut self, time: DateTime<Utc>, message_id: Option<String>, closed: bool) -> Self {
        self.start_time = Some(time);
        self.start_message_id = message_id;
        self.start_closed = closed;
        self
    }

    pub fn end(mut self, time: DateTime<Utc>, message_id: Option<String>, closed: bool) -> Self {
        self.end_time = Some(time);
        self.end_message_id = message_id;
        self.end_closed = closed;
        self
    }

    pub fn direction(mut self, direction: MessageQueryDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn message_type(mut self, kind: i32) -> Self {
        self.message_type = Some(kind);
        self
    }

    /// Validate and encode as the `logs` request body.
    pub(crate) fn to_body(&self) -> ImResult<Map<String, Value>> {
        let legacy = self.before_time.is_some()
            || self.before_message_id.is_some()
            || self.after_time.is_some()
            || self.after_message_id.is_some();
        let ranged = self.start_time.is_some()
            || self.start_message_id.is_some()
            || self.end_time.is_some()
            || self.end_message_id.is_some()
            || self.direction.is_some();
        if legacy && ranged {
            return Err(ImError::validation(
                "before/after and start/end/direction cannot be combined",
            ));
        }
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_LIMIT {
                return Err(ImError::validation(format!(
                    "limit must be within 1..={MAX_LIMIT}, got {limit}"
                )));
            }
        }
        let bounds = [
            (&self.before_time, &self.before_message_id, "before"),
            (&self.after_time, &self.after_message_id, "after"),
            (&self.start_time, &self.start_message_id, "start"),
            (&self.end_time, &self.end_message_id, "end"),
        ];
        for (time, id, name) in bounds {
            if time.is_none() && id.is_some() {
                return Err(ImError::validation(format!(
                    "{name} message id requires a {name} timestamp"
                )));
            }
        }

        let mut body = Map::new();
        let (upper, lower) = if legacy {
            (
                (&self.before_time, &self.before_message_id, false),
                (&self.after_time, &self.after_message_id, false),
            )
        } else {
            (
                (&self.start_time, &self.start_message_id, self.start_closed),
                (&self.end_time, &self.end_message_id, self.end_closed),
            )
        };
        insert_bound(&mut body, ("t", "mid", "tIncluded"), upper);
        insert_bound(&mut body, ("tt", "tmid", "ttIncluded"), lower);
        if let Some(direction) = self.direction {
            body.insert("direction".to_string(), Value::from(direction.as_str()));
        }
        if let Some(limit) = self.limit {
            body.insert("l".to_string(), Value::from(limit));
        }
        if let Some(kind) = self.message_type {
            body.insert("lctype".to_string(), Value::from(kind));
        }
        Ok(body)
    }
}

fn insert_bound(
    body: &mut Map<String, Value>,
    keys: (&str, &str, &str),
    bound: (&Option<DateTime<Utc>>, &Option<String>, bool),
) {
    let (time_key, id_key, closed_key) = keys;
    let (at, id, closed) = bound;
    if let Some(at) = at {
        body.insert(time_key.to_string(), Value::from(time::to_millis(at)));
    }
    if let Some(id) = id {
        body.insert(id_key.to_string(), Value::String(id.clone()));
    }
    if closed {
        body.insert(closed_key.to_string(), Value::Bool(true));
    }
}
