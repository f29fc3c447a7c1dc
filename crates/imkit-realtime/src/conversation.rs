//! Conversations: the cached per-id record plus every operation that acts on
//! one conversation.
//!
//! A [`Conversation`] is a cheap handle. The owning client hands out exactly
//! one instance per id, so state written by pushes is visible to every
//! holder.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, trace, warn};

use imkit_core::{time, ErrorCode, EventEmitter, ImError, ImResult, ListenerId};
use imkit_message::{Message, MessagePointer};
use imkit_query::{Filterable, Modifiable};

use crate::client::{string_list, ClientInner, IMClient};
use crate::protocol::{self, Op};
use crate::signature::SignatureAction;
use crate::types::{
    ConversationEvent, ConversationKind, MessageQuery, ReceiptTimestamps, SendOptions,
};

/// Fields the server owns. `set` and custom attributes may not use them.
const RESERVED_KEYS: &[&str] = &[
    "objectId",
    "id",
    "cid",
    "c",
    "creator",
    "m",
    "members",
    "mu",
    "mutedMembers",
    "tr",
    "transient",
    "sys",
    "system",
    "unique",
    "uniqueId",
    "createdAt",
    "updatedAt",
    "lm",
    "lastMessageAt",
    "msg",
    "lastMessage",
    "lastDeliveredAt",
    "lastReadAt",
    "unreadMessagesCount",
    "unreadMessagesMentioned",
];

pub(crate) fn is_reserved_key(key: &str) -> bool {
    key.is_empty() || RESERVED_KEYS.contains(&key)
}

/// The server-side shape of a conversation. Accepts both the compact wire
/// keys and their long names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    #[serde(rename = "objectId", alias = "id", alias = "cid", default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "c", alias = "creator", default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(rename = "m", alias = "members", default)]
    pub members: Vec<String>,
    #[serde(rename = "mu", alias = "mutedMembers", default)]
    pub muted_members: Vec<String>,
    #[serde(rename = "tr", alias = "transient", default)]
    pub transient: bool,
    #[serde(rename = "sys", alias = "system", default)]
    pub system: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    #[serde(default, with = "imkit_core::time::millis_opt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "imkit_core::time::millis_opt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "lm",
        alias = "lastMessageAt",
        default,
        with = "imkit_core::time::millis_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message_at: Option<DateTime<Utc>>,
    /// Raw envelope; parsed by the owning client.
    #[serde(rename = "msg", alias = "lastMessage", default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Value>,
    #[serde(default, with = "imkit_core::time::millis_opt", skip_serializing_if = "Option::is_none")]
    pub last_delivered_at: Option<DateTime<Utc>>,
    #[serde(default, with = "imkit_core::time::millis_opt", skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_messages_count: u32,
    #[serde(default)]
    pub unread_messages_mentioned: bool,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl ConversationRecord {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn kind(&self) -> ConversationKind {
        ConversationKind::from_flags(self.transient, self.system)
    }

    fn set_attribute(&mut self, key: &str, value: Value) {
        if key == "name" {
            self.name = value.as_str().map(str::to_string);
        } else {
            self.attributes.insert(key.to_string(), value);
        }
    }

    /// lastReadAt never runs ahead of lastDeliveredAt.
    fn normalize_markers(&mut self) -> bool {
        match (self.last_read_at, self.last_delivered_at) {
            (Some(read), Some(delivered)) if read > delivered => {
                self.last_delivered_at = Some(read);
                true
            }
            (Some(read), None) => {
                self.last_delivered_at = Some(read);
                true
            }
            _ => false,
        }
    }
}

struct ConversationState {
    record: ConversationRecord,
    last_message: Option<Message>,
}

struct ConversationInner {
    id: String,
    kind: ConversationKind,
    client: Weak<ClientInner>,
    state: RwLock<ConversationState>,
    /// Local attribute edits not yet saved.
    pending: Mutex<Map<String, Value>>,
    /// Serializes save, membership and read operations.
    op_lock: tokio::sync::Mutex<()>,
    events: EventEmitter<ConversationEvent>,
}

#[derive(Clone)]
pub struct Conversation {
    inner: Arc<ConversationInner>,
}

impl Conversation {
    pub(crate) fn new(
        client: Weak<ClientInner>,
        mut record: ConversationRecord,
        last_message: Option<Message>,
    ) -> Self {
        record.last_message = None;
        record.normalize_markers();
        Self {
            inner: Arc::new(ConversationInner {
                id: record.id.clone(),
                kind: record.kind(),
                client,
                state: RwLock::new(ConversationState {
                    record,
                    last_message,
                }),
                pending: Mutex::new(Map::new()),
                op_lock: tokio::sync::Mutex::new(()),
                events: EventEmitter::new(),
            }),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Fixed at construction.
    pub fn kind(&self) -> ConversationKind {
        self.inner.kind
    }

    pub fn name(&self) -> Option<String> {
        self.inner.state.read().record.name.clone()
    }

    pub fn creator(&self) -> Option<String> {
        self.inner.state.read().record.creator.clone()
    }

    pub fn members(&self) -> Vec<String> {
        self.inner.state.read().record.members.clone()
    }

    pub fn muted_members(&self) -> Vec<String> {
        self.inner.state.read().record.muted_members.clone()
    }

    /// Whether the local client has muted offline notifications here.
    pub fn muted(&self) -> bool {
        match self.inner.client.upgrade() {
            Some(client) => {
                let client = IMClient::from_inner(client);
                self.inner
                    .state
                    .read()
                    .record
                    .muted_members
                    .iter()
                    .any(|id| id == client.id())
            }
            None => false,
        }
    }

    pub fn transient(&self) -> bool {
        self.inner.state.read().record.transient
    }

    pub fn system(&self) -> bool {
        self.inner.state.read().record.system
    }

    pub fn unique(&self) -> bool {
        self.inner.state.read().record.unique
    }

    pub fn unique_id(&self) -> Option<String> {
        self.inner.state.read().record.unique_id.clone()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().record.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().record.updated_at
    }

    pub fn last_message(&self) -> Option<Message> {
        self.inner.state.read().last_message.clone()
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().record.last_message_at
    }

    pub fn last_delivered_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().record.last_delivered_at
    }

    pub fn last_read_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().record.last_read_at
    }

    pub fn unread_messages_count(&self) -> u32 {
        self.inner.state.read().record.unread_messages_count
    }

    pub fn unread_messages_mentioned(&self) -> bool {
        self.inner.state.read().record.unread_messages_mentioned
    }

    pub fn attributes(&self) -> Map<String, Value> {
        self.inner.state.read().record.attributes.clone()
    }

    pub fn receipt_timestamps(&self) -> ReceiptTimestamps {
        let state = self.inner.state.read();
        ReceiptTimestamps {
            last_delivered_at: state.record.last_delivered_at,
            last_read_at: state.record.last_read_at,
        }
    }

    /// Read one attribute, including unsaved local edits.
    pub fn get(&self, key: &str) -> Option<Value> {
        let state = self.inner.state.read();
        if key == "name" {
            return state.record.name.clone().map(Value::String);
        }
        state.record.attributes.get(key).cloned()
    }

    /// Stage a local attribute edit. Nothing is sent until [`save`](Self::save).
    pub fn set(&self, key: &str, value: Value) -> ImResult<&Self> {
        if is_reserved_key(key) {
            return Err(ImError::validation(format!(
                "`{key}` is a reserved conversation field"
            )));
        }
        if key == "name" && !value.is_string() {
            return Err(ImError::validation("name must be a string"));
        }
        self.inner.state.write().record.set_attribute(key, value.clone());
        self.inner.pending.lock().insert(key.to_string(), value);
        Ok(self)
    }

    /// The persisted shape, last message included.
    pub fn to_json(&self) -> ImResult<Value> {
        let record = {
            let state = self.inner.state.read();
            let mut record = state.record.clone();
            record.last_message = state.last_message.as_ref().map(Message::to_full_json);
            record
        };
        Ok(serde_json::to_value(&record)?)
    }

    pub fn on<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ConversationEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(callback)
    }

    pub fn once<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ConversationEvent) + Send + Sync + 'static,
    {
        self.inner.events.once(callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    // ── Remote operations ─────────────────────────────────────────────────────

    fn session(&self) -> ImResult<IMClient> {
        let client = self
            .inner
            .client
            .upgrade()
            .map(IMClient::from_inner)
            .ok_or_else(|| ImError::code(ErrorCode::SessionRequired, "client is gone"))?;
        client.check_open()?;
        Ok(client)
    }

    fn not_allowed(&self, operation: &str) -> ImError {
        ImError::code(
            ErrorCode::ConversationNotAllowed,
            format!("{operation} is not supported by a {}", self.inner.kind),
        )
    }

    /// Send a message. On success the message is `Sent` and carries its
    /// server id and timestamp; on failure it is `Failed`.
    pub async fn send(&self, message: &mut Message, options: SendOptions) -> ImResult<()> {
        let client = self.session()?;
        let transient = options.transient || message.transient();
        message.begin_send(client.id(), &self.inner.id, transient)?;
        let _in_flight = client.track_send();

        // Chat rooms never produce receipts.
        let receipt =
            options.receipt && !transient && self.inner.kind != ConversationKind::ChatRoom;
        if receipt {
            client.expect_receipt(message);
        }

        let mut extra = Map::new();
        if receipt {
            extra.insert("r".to_string(), Value::Bool(true));
        }
        if options.will {
            extra.insert("will".to_string(), Value::Bool(true));
        }
        if let (Some(priority), ConversationKind::ChatRoom) = (options.priority, self.inner.kind) {
            extra.insert("level".to_string(), Value::from(priority.as_str()));
        }
        if let Some(push_data) = options.push_data {
            extra.insert("pushData".to_string(), push_data);
        }

        let frame = protocol::build_direct(client.id(), &self.inner.id, message.to_json(), extra);
        let timeout = client.realtime().config().send_timeout;
        match client.request_with_timeout(frame, timeout).await {
            Ok(ack) => {
                let id = ack.str_field("id").map(str::to_string);
                let timestamp = ack.field("timestamp").and_then(time::from_value);
                message.acknowledge(id, timestamp)?;
                trace!(conversation_id = %self.inner.id, message_id = ?message.id(), "Message sent");
                if !transient {
                    self.record_outgoing(message);
                }
                if receipt {
                    if let Some(delivered) = client.acknowledged(message) {
                        self.emit(ConversationEvent::Receipt { message: delivered });
                    }
                }
                Ok(())
            }
            Err(err) => {
                if receipt {
                    client.forget_receipt(message);
                }
                if let Err(state_err) = message.fail() {
                    debug!(error = %state_err, "Message already settled");
                }
                let err = match err {
                    ImError::Timeout(after) => ImError::code(
                        ErrorCode::SendMessageTimeout,
                        format!("no acknowledgement after {after:?}"),
                    ),
                    other => other,
                };
                warn!(conversation_id = %self.inner.id, error = %err, "Send failed");
                Err(err)
            }
        }
    }

    /// Replace the stored message at `pointer` with `message`'s content.
    /// Runs in order with `recall` and the other mutations of this
    /// conversation.
    pub async fn update(&self, pointer: &MessagePointer, message: Message) -> ImResult<Message> {
        let client = self.session()?;
        let _op = self.inner.op_lock.lock().await;
        let mut patch = message.to_json();
        if let Value::Object(map) = &mut patch {
            insert_pointer(map, &self.inner.id, pointer);
            map.insert("recall".to_string(), Value::Bool(false));
        }
        let response = client
            .request(protocol::build_patch(client.id(), patch))
            .await?;
        let updated_at = response.field("lastPatchTime").and_then(time::from_value);
        let replacement = message.into_replacement(
            pointer,
            &self.inner.id,
            Some(client.id().to_string()),
            updated_at,
        );
        self.replace_message(&replacement);
        debug!(conversation_id = %self.inner.id, message_id = %pointer.id, "Message updated");
        Ok(replacement)
    }

    /// Recall the stored message at `pointer`, leaving a tombstone.
    pub async fn recall(&self, pointer: &MessagePointer) -> ImResult<Message> {
        let client = self.session()?;
        let _op = self.inner.op_lock.lock().await;
        let mut patch = Map::new();
        insert_pointer(&mut patch, &self.inner.id, pointer);
        patch.insert("recall".to_string(), Value::Bool(true));
        let response = client
            .request(protocol::build_patch(client.id(), Value::Object(patch)))
            .await?;
        let updated_at = response.field("lastPatchTime").and_then(time::from_value);
        let mut tombstone = Message::recalled(pointer, updated_at);
        tombstone.set_conversation_id(&self.inner.id);
        self.replace_message(&tombstone);
        debug!(conversation_id = %self.inner.id, message_id = %pointer.id, "Message recalled");
        Ok(tombstone)
    }

    /// Persist staged attribute edits. Concurrent saves run one at a time;
    /// a key edited again while a save is in flight stays staged.
    pub async fn save(&self) -> ImResult<Self> {
        let client = self.session()?;
        let _op = self.inner.op_lock.lock().await;
        let snapshot = self.inner.pending.lock().clone();
        if snapshot.is_empty() {
            return Ok(self.clone());
        }

        let body = json!({ "cid": self.inner.id, "attr": snapshot });
        let response = client
            .request(protocol::build_conv(Op::Update, client.id(), body, None))
            .await?;

        self.inner
            .pending
            .lock()
            .retain(|key, value| snapshot.get(key) != Some(value));
        // Keys edited again meanwhile keep their newer local value.
        let confirmed: Map<String, Value> = {
            let pending = self.inner.pending.lock();
            response
                .field("attr")
                .and_then(Value::as_object)
                .into_iter()
                .flatten()
                .filter(|(key, _)| !pending.contains_key(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };
        let updated_at = response.field("udate").and_then(time::from_value);
        self.apply_remote_attributes(&confirmed, updated_at);
        debug!(conversation_id = %self.inner.id, keys = snapshot.len(), "Conversation saved");
        Ok(self.clone())
    }

    /// Refresh the record from the server, keeping unsaved edits.
    pub async fn fetch(&self) -> ImResult<Self> {
        let client = self.session()?;
        let descriptor = client
            .get_query()
            .equal_to("objectId", self.inner.id.as_str())
            .limit(1)
            .compile()?;
        let response = client
            .request(protocol::build_conv(
                Op::Query,
                client.id(),
                descriptor.to_json(),
                None,
            ))
            .await?;
        let raw = response
            .field("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .cloned()
            .ok_or_else(|| {
                ImError::code(
                    ErrorCode::ConversationNotFound,
                    format!("conversation {} not found", self.inner.id),
                )
            })?;
        let mut record: ConversationRecord = serde_json::from_value(raw)?;
        let last_message = client.take_last_message(&mut record);
        self.merge_record(record, last_message);
        Ok(self.clone())
    }

    pub async fn add<I, S>(&self, client_ids: I) -> ImResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.inner.kind == ConversationKind::ServiceConversation {
            return Err(self.not_allowed("add"));
        }
        let ids = member_ids(client_ids)?;
        self.change_members(Op::Add, ids, SignatureAction::Invite).await
    }

    pub async fn remove<I, S>(&self, client_ids: I) -> ImResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.inner.kind == ConversationKind::ServiceConversation {
            return Err(self.not_allowed("remove"));
        }
        let ids = member_ids(client_ids)?;
        self.change_members(Op::Remove, ids, SignatureAction::Kick).await
    }

    pub async fn join(&self) -> ImResult<Self> {
        let me = self.session()?.id().to_string();
        self.change_members(Op::Add, vec![me], SignatureAction::Invite).await
    }

    pub async fn quit(&self) -> ImResult<Self> {
        let me = self.session()?.id().to_string();
        self.change_members(Op::Remove, vec![me], SignatureAction::Kick).await
    }

    async fn change_members(
        &self,
        op: Op,
        ids: Vec<String>,
        action: SignatureAction,
    ) -> ImResult<Self> {
        let client = self.session()?;
        let signed = client
            .sign_conversation(Some(&self.inner.id), &ids, action)
            .await?;
        let _op = self.inner.op_lock.lock().await;
        let body = json!({ "cid": self.inner.id, "m": ids });
        let response = client
            .request(protocol::build_conv(op, client.id(), body, signed.as_ref()))
            .await?;

        if let Some(failed) = string_list(response.field("failedPids")) {
            if !failed.is_empty() {
                warn!(conversation_id = %self.inner.id, ?failed, "Some members were not changed");
            }
        }
        match string_list(response.field("m")) {
            Some(members) => self.inner.state.write().record.members = members,
            None if op == Op::Add => self.add_members_locally(&ids),
            None => self.remove_members_locally(&ids),
        }
        debug!(conversation_id = %self.inner.id, ?op, count = ids.len(), "Members changed");
        Ok(self.clone())
    }

    pub async fn mute(&self) -> ImResult<Self> {
        self.set_muted(true).await
    }

    pub async fn unmute(&self) -> ImResult<Self> {
        self.set_muted(false).await
    }

    async fn set_muted(&self, muted: bool) -> ImResult<Self> {
        let client = self.session()?;
        let _op = self.inner.op_lock.lock().await;
        let op = if muted { Op::Mute } else { Op::Unmute };
        let response = client
            .request(protocol::build_conv(
                op,
                client.id(),
                json!({ "cid": self.inner.id }),
                None,
            ))
            .await?;

        let mut state = self.inner.state.write();
        match string_list(response.field("mu")) {
            Some(list) => state.record.muted_members = list,
            None => {
                let me = client.id().to_string();
                state.record.muted_members.retain(|id| *id != me);
                if muted {
                    state.record.muted_members.push(me);
                }
            }
        }
        Ok(self.clone())
    }

    /// Mark everything up to the last message as read. Repeating it is a
    /// no-op for the counters.
    pub async fn read(&self) -> ImResult<Self> {
        let client = self.session()?;
        let _op = self.inner.op_lock.lock().await;
        let entry = self.begin_read();
        let response = client
            .request(protocol::build_read(client.id(), vec![entry]))
            .await?;
        self.reconcile_read(&response.body);
        Ok(self.clone())
    }

    /// Number of members, as counted by the server.
    pub async fn count(&self) -> ImResult<u64> {
        let client = self.session()?;
        let response = client
            .request(protocol::build_conv(
                Op::Count,
                client.id(),
                json!({ "cid": self.inner.id }),
                None,
            ))
            .await?;
        response
            .field("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| ImError::code(ErrorCode::InternalError, "count response has no count"))
    }

    /// Refresh lastDeliveredAt and lastReadAt from the server.
    pub async fn fetch_receipt_timestamps(&self) -> ImResult<ReceiptTimestamps> {
        if self.inner.kind == ConversationKind::ChatRoom {
            return Err(self.not_allowed("receipt timestamps"));
        }
        let client = self.session()?;
        let response = client
            .request(protocol::build_conv(
                Op::MaxRead,
                client.id(),
                json!({ "cid": self.inner.id }),
                None,
            ))
            .await?;
        self.advance_read_markers(
            response.field("maxAckTimestamp").and_then(time::from_value),
            response.field("maxReadTimestamp").and_then(time::from_value),
        );
        Ok(self.receipt_timestamps())
    }

    /// Stored history, oldest first.
    pub async fn query_messages(&self, query: MessageQuery) -> ImResult<Vec<Message>> {
        let body = query.to_body()?;
        let client = self.session()?;
        let response = client
            .request(protocol::build_logs(client.id(), &self.inner.id, body))
            .await?;
        let logs = response
            .field("logs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut messages = Vec::with_capacity(logs.len());
        for raw in logs {
            if let Some(mut message) = client.parse_message(raw)? {
                if message.conversation_id().is_none() {
                    message.set_conversation_id(&self.inner.id);
                }
                messages.push(message);
            }
        }
        messages.sort_by_key(Message::timestamp);
        Ok(messages)
    }

    /// Page backwards through history, `limit` messages at a time.
    pub fn create_messages_iterator(&self, limit: u32) -> ImResult<MessagesIterator> {
        if limit == 0 || limit > imkit_query::MAX_LIMIT {
            return Err(ImError::validation(format!(
                "limit must be within 1..={}, got {limit}",
                imkit_query::MAX_LIMIT
            )));
        }
        Ok(MessagesIterator {
            conversation: self.clone(),
            limit,
            cursor: None,
            done: false,
        })
    }

    // ── Local state, driven by pushes and by the client ───────────────────────

    pub(crate) fn emit(&self, event: ConversationEvent) {
        self.inner.events.emit(&event);
    }

    pub(crate) fn emit_unread(&self) {
        let (count, mentioned) = {
            let state = self.inner.state.read();
            (
                state.record.unread_messages_count,
                state.record.unread_messages_mentioned,
            )
        };
        self.emit(ConversationEvent::UnreadMessagesCountUpdate { count, mentioned });
    }

    /// Record a pushed message. Returns whether the unread counters changed.
    pub(crate) fn apply_incoming(&self, message: &Message, own_id: &str) -> bool {
        let mut state = self.inner.state.write();
        if newer_than_last(&state, message) {
            state.record.last_message_at = message.timestamp().or(state.record.last_message_at);
            state.last_message = Some(message.clone());
        }
        let counts = message.from() != Some(own_id)
            && !message.transient()
            && self.inner.kind != ConversationKind::ChatRoom;
        if !counts {
            return false;
        }
        state.record.unread_messages_count = state.record.unread_messages_count.saturating_add(1);
        if message.mentioned(own_id) {
            state.record.unread_messages_mentioned = true;
        }
        true
    }

    fn record_outgoing(&self, message: &Message) {
        let mut state = self.inner.state.write();
        if newer_than_last(&state, message) {
            state.record.last_message_at = message.timestamp().or(state.record.last_message_at);
            state.last_message = Some(message.clone());
        }
    }

    /// Swap in a patched message if it is the current last message.
    pub(crate) fn replace_message(&self, message: &Message) {
        let mut state = self.inner.state.write();
        let is_last = match (&state.last_message, message.id()) {
            (Some(last), Some(id)) => last.id() == Some(id),
            _ => false,
        };
        if is_last {
            state.last_message = Some(message.clone());
        }
    }

    pub(crate) fn add_members_locally(&self, ids: &[String]) {
        let mut state = self.inner.state.write();
        for id in ids {
            if !state.record.members.contains(id) {
                state.record.members.push(id.clone());
            }
        }
    }

    pub(crate) fn remove_members_locally(&self, ids: &[String]) {
        self.inner
            .state
            .write()
            .record
            .members
            .retain(|member| !ids.contains(member));
    }

    pub(crate) fn apply_remote_attributes(
        &self,
        attributes: &Map<String, Value>,
        updated_at: Option<DateTime<Utc>>,
    ) {
        let mut state = self.inner.state.write();
        for (key, value) in attributes {
            state.record.set_attribute(key, value.clone());
        }
        if updated_at.is_some() {
            state.record.updated_at = updated_at;
        }
    }

    pub(crate) fn set_unread(&self, count: u32, mentioned: bool, last_message: Option<Message>) {
        let mut state = self.inner.state.write();
        state.record.unread_messages_count = count;
        state.record.unread_messages_mentioned = mentioned;
        if let Some(message) = last_message {
            if newer_than_last(&state, &message) {
                state.record.last_message_at = message.timestamp().or(state.record.last_message_at);
                state.last_message = Some(message);
            }
        }
    }

    /// Move the receipt markers forward, never back, and emit an update for
    /// each one that moved.
    pub(crate) fn advance_read_markers(
        &self,
        delivered: Option<DateTime<Utc>>,
        read: Option<DateTime<Utc>>,
    ) {
        let (delivered_at, read_at) = {
            let mut state = self.inner.state.write();
            let record = &mut state.record;
            let before = (record.last_delivered_at, record.last_read_at);
            if let Some(at) = delivered {
                if record.last_delivered_at.map_or(true, |current| at > current) {
                    record.last_delivered_at = Some(at);
                }
            }
            if let Some(at) = read {
                if record.last_read_at.map_or(true, |current| at > current) {
                    record.last_read_at = Some(at);
                }
            }
            record.normalize_markers();
            (
                record.last_delivered_at.filter(|_| record.last_delivered_at != before.0),
                record.last_read_at.filter(|_| record.last_read_at != before.1),
            )
        };
        if let Some(at) = delivered_at {
            self.emit(ConversationEvent::LastDeliveredAtUpdate(at));
        }
        if let Some(at) = read_at {
            self.emit(ConversationEvent::LastReadAtUpdate(at));
        }
    }

    /// Zero the unread counters locally and build this conversation's entry
    /// for a read request.
    pub(crate) fn begin_read(&self) -> Value {
        let now = Utc::now();
        let (entry, had_unread) = {
            let mut state = self.inner.state.write();
            let had_unread = state.record.unread_messages_count != 0
                || state.record.unread_messages_mentioned;
            state.record.unread_messages_count = 0;
            state.record.unread_messages_mentioned = false;

            let mut entry = json!({ "cid": self.inner.id });
            if let Some(last) = &state.last_message {
                if let Some(id) = last.id() {
                    entry["mid"] = Value::from(id);
                }
                if let Some(ts) = last.timestamp() {
                    entry["timestamp"] = Value::from(time::to_millis(&ts));
                }
            }
            (entry, had_unread)
        };
        if had_unread {
            self.emit_unread();
        }
        self.advance_read_markers(None, Some(now));
        entry
    }

    /// Apply whatever the server reports back for this conversation.
    pub(crate) fn reconcile_read(&self, body: &Value) {
        let Some(entry) = body
            .get("convs")
            .and_then(Value::as_array)
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|e| e.get("cid").and_then(Value::as_str) == Some(self.inner.id.as_str()))
            })
        else {
            return;
        };
        {
            let mut state = self.inner.state.write();
            if let Some(count) = entry.get("unreadMessagesCount").and_then(Value::as_u64) {
                state.record.unread_messages_count = u32::try_from(count).unwrap_or(u32::MAX);
            }
            if let Some(mentioned) = entry.get("unreadMessagesMentioned").and_then(Value::as_bool) {
                state.record.unread_messages_mentioned = mentioned;
            }
        }
        if let Some(at) = entry.get("lastReadAt").and_then(time::from_value) {
            self.advance_read_markers(None, Some(at));
        }
    }

    /// Replace the record with a fresher one, re-applying unsaved edits.
    pub(crate) fn merge_record(&self, mut record: ConversationRecord, last_message: Option<Message>) {
        let pending = self.inner.pending.lock().clone();
        for (key, value) in pending {
            record.set_attribute(&key, value);
        }
        record.id = self.inner.id.clone();
        record.last_message = None;

        let mut state = self.inner.state.write();
        // Receipt markers only move forward.
        record.last_delivered_at = record.last_delivered_at.max(state.record.last_delivered_at);
        record.last_read_at = record.last_read_at.max(state.record.last_read_at);
        record.normalize_markers();
        state.record = record;
        if let Some(message) = last_message {
            if newer_than_last(&state, &message) {
                state.last_message = Some(message);
            }
        }
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl PartialEq for Conversation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Pages backwards through a conversation's history.
#[derive(Debug)]
pub struct MessagesIterator {
    conversation: Conversation,
    limit: u32,
    cursor: Option<(DateTime<Utc>, Option<String>)>,
    done: bool,
}

impl MessagesIterator {
    /// The next older page, oldest first within the page. `None` once the
    /// start of history has been reached.
    pub async fn next_page(&mut self) -> ImResult<Option<Vec<Message>>> {
        if self.done {
            return Ok(None);
        }
        let mut query = MessageQuery::new().limit(self.limit);
        if let Some((before, id)) = &self.cursor {
            query = query.before(*before, id.clone());
        }
        let page = self.conversation.query_messages(query).await?;
        if page.len() < self.limit as usize {
            self.done = true;
        }
        if page.is_empty() {
            return Ok(None);
        }
        if let Some(oldest) = page.first() {
            if let Some(ts) = oldest.timestamp() {
                self.cursor = Some((ts, oldest.id().map(str::to_string)));
            } else {
                self.done = true;
            }
        }
        Ok(Some(page))
    }
}

fn newer_than_last(state: &ConversationState, message: &Message) -> bool {
    match (&state.last_message, message.timestamp()) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(last), Some(ts)) => last.timestamp().map_or(true, |current| ts >= current),
    }
}

fn insert_pointer(map: &mut Map<String, Value>, conversation_id: &str, pointer: &MessagePointer) {
    map.insert("conversationId".to_string(), Value::from(conversation_id));
    map.insert("id".to_string(), Value::from(pointer.id.as_str()));
    map.insert(
        "timestamp".to_string(),
        Value::from(time::to_millis(&pointer.timestamp)),
    );
    if let Some(cid) = &pointer.cid {
        map.insert("cid".to_string(), Value::from(cid.as_str()));
    }
}

fn member_ids<I, S>(client_ids: I) -> ImResult<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut ids: Vec<String> = Vec::new();
    for id in client_ids.into_iter().map(Into::into) {
        if id.is_empty() {
            return Err(ImError::validation("client id must not be empty"));
        }
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(ImError::validation("at least one client id is required"));
    }
    Ok(ids)
}
