//! The message envelope and its JSON shapes.
//!
//! Every message carries either a plain payload (text, structured JSON or
//! bytes) or a typed sub-envelope whose integer discriminant selects a
//! registered [`MessageClass`](crate::MessageClass).

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use imkit_core::time;
use imkit_core::{ImError, ImResult};

use crate::payload::{
    Payload, PayloadKind, TypedContent, PAYLOAD_KIND_KEY, RECALLED_MESSAGE_TYPE, TEXT_MESSAGE_TYPE,
};
use crate::status::{Delivery, MessageStatus};

/// Body of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Plain(Payload),
    Typed(TypedContent),
}

#[derive(Debug, Clone)]
pub struct Message {
    pub(crate) content: Content,
    pub(crate) id: Option<String>,
    pub(crate) cid: Option<String>,
    pub(crate) from: Option<String>,
    pub(crate) conversation_id: Option<String>,
    pub(crate) timestamp: Option<DateTime<Utc>>,
    pub(crate) updated_at: Option<DateTime<Utc>>,
    pub(crate) mention_list: Vec<String>,
    pub(crate) mentioned_all: bool,
    pub(crate) transient: bool,
    pub(crate) delivery: Delivery,
}

impl Message {
    /// A generic message carrying the given payload.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self::with_content(Content::Plain(payload.into()))
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Payload::Binary(bytes.into()))
    }

    /// A `TextMessage`.
    pub fn text(text: impl Into<String>) -> Self {
        let mut content = TypedContent::new(TEXT_MESSAGE_TYPE);
        content.set_text(text);
        Self::from_typed(content)
    }

    pub fn from_typed(content: TypedContent) -> Self {
        Self::with_content(Content::Typed(content))
    }

    pub(crate) fn with_content(content: Content) -> Self {
        Self {
            content,
            id: None,
            cid: None,
            from: None,
            conversation_id: None,
            timestamp: None,
            updated_at: None,
            mention_list: Vec::new(),
            mentioned_all: false,
            transient: false,
            delivery: Delivery::default(),
        }
    }

    /// A recall tombstone standing in for the message at `pointer`.
    pub fn recalled(pointer: &MessagePointer, updated_at: Option<DateTime<Utc>>) -> Self {
        let mut message = Self::from_typed(TypedContent::new(RECALLED_MESSAGE_TYPE));
        message.id = Some(pointer.id.clone());
        message.cid = pointer.cid.clone();
        message.timestamp = Some(pointer.timestamp);
        message.updated_at = updated_at;
        message.delivery = Delivery::with_status(MessageStatus::Sent);
        message
    }

    /// The payload as exposed to applications. Typed messages expose their
    /// sub-envelope as structured JSON.
    pub fn payload(&self) -> Payload {
        match &self.content {
            Content::Plain(payload) => payload.clone(),
            Content::Typed(typed) => Payload::Json(typed.to_json_value()),
        }
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn payload_kind(&self) -> PayloadKind {
        match &self.content {
            Content::Plain(payload) => payload.kind(),
            Content::Typed(_) => PayloadKind::Typed,
        }
    }

    pub fn typed(&self) -> Option<&TypedContent> {
        match &self.content {
            Content::Typed(typed) => Some(typed),
            Content::Plain(_) => None,
        }
    }

    pub fn typed_mut(&mut self) -> Option<&mut TypedContent> {
        match &mut self.content {
            Content::Typed(typed) => Some(typed),
            Content::Plain(_) => None,
        }
    }

    /// Discriminant of a typed message.
    pub fn kind(&self) -> Option<i32> {
        self.typed().map(TypedContent::kind)
    }

    pub fn is_recalled(&self) -> bool {
        self.kind() == Some(RECALLED_MESSAGE_TYPE)
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Client-generated idempotency key, kept across resends.
    pub fn cid(&self) -> Option<&str> {
        self.cid.as_deref()
    }

    pub fn set_cid(&mut self, cid: impl Into<String>) {
        self.cid = Some(cid.into());
    }

    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivery.delivered_at()
    }

    pub fn status(&self) -> MessageStatus {
        self.delivery.status()
    }

    pub fn transient(&self) -> bool {
        self.transient
    }

    pub fn mention_list(&self) -> &[String] {
        &self.mention_list
    }

    pub fn mentioned_all(&self) -> bool {
        self.mentioned_all
    }

    pub fn set_mention_list<I, S>(&mut self, ids: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mention_list = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn mention_all(&mut self, enabled: bool) -> &mut Self {
        self.mentioned_all = enabled;
        self
    }

    /// Whether `client_id` is mentioned. Computed on every call.
    pub fn mentioned(&self, client_id: &str) -> bool {
        self.mentioned_all || self.mention_list.iter().any(|id| id == client_id)
    }

    /// A fresh unsent copy with the same content and `cid`. The original
    /// keeps its terminal status.
    pub fn for_resend(&self) -> Self {
        let mut copy = Self::with_content(self.content.clone());
        copy.cid = self.cid.clone();
        copy.mention_list = self.mention_list.clone();
        copy.mentioned_all = self.mentioned_all;
        copy.transient = self.transient;
        copy
    }

    /// Session-layer transition `None → Sending`. Assigns a `cid` when the
    /// message has none.
    #[doc(hidden)]
    pub fn begin_send(&mut self, from: &str, conversation_id: &str, transient: bool) -> ImResult<()> {
        self.delivery.advance(MessageStatus::Sending)?;
        if self.cid.is_none() {
            self.cid = Some(uuid::Uuid::new_v4().to_string());
        }
        self.from = Some(from.to_string());
        self.conversation_id = Some(conversation_id.to_string());
        self.transient = transient;
        Ok(())
    }

    /// Session-layer transition `Sending → Sent`.
    #[doc(hidden)]
    pub fn acknowledge(&mut self, id: Option<String>, timestamp: Option<DateTime<Utc>>) -> ImResult<()> {
        self.delivery.advance(MessageStatus::Sent)?;
        if id.is_some() {
            self.id = id;
        }
        self.timestamp = timestamp.or(self.timestamp);
        Ok(())
    }

    /// Session-layer transition `Sending → Failed`.
    #[doc(hidden)]
    pub fn fail(&self) -> ImResult<()> {
        self.delivery.advance(MessageStatus::Failed)
    }

    /// Session-layer transition `Sent → Delivered`. Visible through every
    /// clone of this message.
    #[doc(hidden)]
    pub fn confirm_delivery(&self, at: DateTime<Utc>) -> ImResult<()> {
        self.delivery.mark_delivered(at)
    }

    /// Turn new content into the replacement for the message at `pointer`.
    #[doc(hidden)]
    pub fn into_replacement(
        mut self,
        pointer: &MessagePointer,
        conversation_id: &str,
        from: Option<String>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.id = Some(pointer.id.clone());
        self.cid = pointer.cid.clone().or(self.cid);
        self.timestamp = Some(pointer.timestamp);
        self.conversation_id = Some(conversation_id.to_string());
        self.from = from.or(self.from);
        self.updated_at = updated_at;
        self.delivery = Delivery::with_status(MessageStatus::Sent);
        self
    }

    #[doc(hidden)]
    pub fn set_conversation_id(&mut self, conversation_id: &str) {
        self.conversation_id = Some(conversation_id.to_string());
    }

    /// The transmitted shape. Dates are RFC 3339 strings; `binary` appears
    /// only for binary payloads.
    pub fn to_json(&self) -> Value {
        let mut map = self.base_json(|dt| Value::String(time::to_rfc3339(dt)));
        if self.payload().is_binary() {
            map.insert("binary".to_string(), Value::Bool(true));
        }
        Value::Object(map)
    }

    /// The persisted shape: everything `parse` needs to rebuild the message,
    /// with dates as epoch milliseconds and the delivery status included.
    /// `payloadKind` pins how `data` is read back, so a plain object that
    /// happens to carry a registered `type` stays plain.
    pub fn to_full_json(&self) -> Value {
        let mut map = self.base_json(|dt| Value::from(time::to_millis(dt)));
        let kind = self.payload_kind();
        map.insert("binary".to_string(), Value::Bool(kind == PayloadKind::Binary));
        map.insert(PAYLOAD_KIND_KEY.to_string(), serde_json::json!(kind));
        map.insert(
            "status".to_string(),
            Value::String(self.status().as_str().to_string()),
        );
        if let Some(at) = self.delivered_at() {
            map.insert("deliveredAt".to_string(), Value::from(time::to_millis(&at)));
        }
        Value::Object(map)
    }

    fn base_json(&self, date: impl Fn(&DateTime<Utc>) -> Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("data".to_string(), self.payload().to_json_value());
        insert_opt(&mut map, "id", self.id.as_deref());
        insert_opt(&mut map, "cid", self.cid.as_deref());
        insert_opt(&mut map, "from", self.from.as_deref());
        insert_opt(&mut map, "conversationId", self.conversation_id.as_deref());
        if let Some(ts) = &self.timestamp {
            map.insert("timestamp".to_string(), date(ts));
        }
        if let Some(ts) = &self.updated_at {
            map.insert("updatedAt".to_string(), date(ts));
        }
        if !self.mention_list.is_empty() {
            map.insert(
                "mentionList".to_string(),
                Value::from(self.mention_list.clone()),
            );
        }
        if self.mentioned_all {
            map.insert("mentionedAll".to_string(), Value::Bool(true));
        }
        if self.transient {
            map.insert("transient".to_string(), Value::Bool(true));
        }
        map
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
}

/// Minimal addressing for one stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePointer {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub cid: Option<String>,
}

impl MessagePointer {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            timestamp,
            cid: None,
        }
    }
}

impl TryFrom<&Message> for MessagePointer {
    type Error = ImError;

    /// Only messages the server has accepted can be addressed.
    fn try_from(message: &Message) -> ImResult<Self> {
        let status = message.status();
        if !matches!(status, MessageStatus::Sent | MessageStatus::Delivered) {
            return Err(ImError::InvalidMessageState {
                expected: "sent or delivered",
                actual: status.as_str(),
            });
        }
        match (&message.id, message.timestamp) {
            (Some(id), Some(timestamp)) => Ok(Self {
                id: id.clone(),
                timestamp,
                cid: message.cid.clone(),
            }),
            _ => Err(ImError::validation(
                "message has no server id or timestamp to point at",
            )),
        }
    }
}
