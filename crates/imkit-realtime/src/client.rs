use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use imkit_core::platform::{self, TaskHandle};
use imkit_core::{time, ErrorCode, EventEmitter, Flow, ImError, ImResult, ListenerId};
use imkit_message::{Message, MessagePointer, MessageStatus};
use imkit_query::{ConversationQuery, Filterable, Modifiable, QueryBackend, QueryDescriptor};

use crate::conversation::{is_reserved_key, Conversation, ConversationRecord};
use crate::plugin::DispatchContext;
use crate::protocol::{self, CommandType, Frame, Op, SessionOpen, SignedFields};
use crate::realtime::Realtime;
use crate::signature::{SignatureAction, SignatureRequest};
use crate::types::{ClientEvent, ClientOptions, ConversationEvent, ConversationOptions};

/// Most ids a single `ping` may probe.
pub const MAX_PING_IDS: usize = 20;

/// How long a sent message waits for its delivery receipt before it is
/// dropped from the receipt book.
const RECEIPT_TTL: Duration = Duration::from_secs(10 * 60);

/// Most receipt-awaiting messages kept at once; the oldest go first.
const MAX_AWAITING_RECEIPTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Sent messages waiting for a delivery receipt, keyed by both `cid` and
/// server id. Receipts that overtake the send acknowledgement park in
/// `early` until the acknowledgement lands.
///
/// Receipts may never come (the peer stays offline, or the room sends
/// none), so entries expire after `ttl` and at most `capacity` messages
/// are held.
struct ReceiptBook {
    awaiting: HashMap<String, Awaiting>,
    early: HashMap<String, DateTime<Utc>>,
    ttl: Duration,
    capacity: usize,
}

struct Awaiting {
    message: Message,
    since: Instant,
}

impl Default for ReceiptBook {
    fn default() -> Self {
        Self::new(RECEIPT_TTL, MAX_AWAITING_RECEIPTS)
    }
}

impl ReceiptBook {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            awaiting: HashMap::new(),
            early: HashMap::new(),
            ttl,
            capacity,
        }
    }

    fn get(&self, key: &str) -> Option<&Message> {
        self.awaiting.get(key).map(|entry| &entry.message)
    }

    /// Start waiting for `message`, keyed by its `cid`.
    fn expect(&mut self, message: &Message, now: Instant) {
        let Some(cid) = message.cid() else {
            return;
        };
        self.prune(now);
        self.awaiting.insert(
            cid.to_string(),
            Awaiting {
                message: message.clone(),
                since: now,
            },
        );
        self.evict_over_capacity();
    }

    /// Re-key an acknowledged message under both `cid` and server id,
    /// keeping its original wait start.
    fn index(&mut self, message: &Message) -> bool {
        let Some(since) = message
            .cid()
            .and_then(|cid| self.awaiting.get(cid))
            .map(|entry| entry.since)
        else {
            return false;
        };
        for key in [message.cid(), message.id()].into_iter().flatten() {
            self.awaiting.insert(
                key.to_string(),
                Awaiting {
                    message: message.clone(),
                    since,
                },
            );
        }
        true
    }

    fn forget(&mut self, message: &Message) {
        for key in [message.cid(), message.id()].into_iter().flatten() {
            self.awaiting.remove(key);
            self.early.remove(key);
        }
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        let before = self.awaiting.len();
        self.awaiting
            .retain(|_, entry| now.saturating_duration_since(entry.since) < ttl);
        if self.awaiting.len() != before {
            let awaiting = &self.awaiting;
            self.early.retain(|key, _| awaiting.contains_key(key));
            trace!(expired = before - self.awaiting.len(), "Receipt wait expired");
        }
    }

    fn evict_over_capacity(&mut self) {
        while self.len() > self.capacity {
            let Some(oldest) = self
                .awaiting
                .values()
                .min_by_key(|entry| entry.since)
                .map(|entry| entry.message.clone())
            else {
                return;
            };
            trace!(cid = ?oldest.cid(), "Receipt book full, dropping oldest");
            self.forget(&oldest);
        }
    }

    /// Messages waiting, counting a message indexed under two keys once.
    fn len(&self) -> usize {
        self.awaiting
            .iter()
            .filter(|(key, entry)| entry.message.cid() == Some(key.as_str()))
            .count()
    }
}

pub(crate) struct ClientInner {
    id: String,
    options: ClientOptions,
    realtime: Realtime,
    session_token: Mutex<Option<String>>,
    state: Mutex<SessionState>,
    conversations: Mutex<HashMap<String, Conversation>>,
    events: EventEmitter<ClientEvent>,
    in_flight: watch::Sender<usize>,
    receipts: Mutex<ReceiptBook>,
    dispatcher: Mutex<Option<TaskHandle>>,
}

/// Counts a send as in flight until dropped, so `close` can drain.
pub(crate) struct InFlight<'a>(&'a watch::Sender<usize>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// One identity's session over a shared [`Realtime`] connection.
///
/// Owns the conversation cache and routes pushes for this identity to the
/// matching [`Conversation`], in arrival order.
#[derive(Clone)]
pub struct IMClient {
    inner: Arc<ClientInner>,
}

impl IMClient {
    pub(crate) fn new(
        id: String,
        options: ClientOptions,
        realtime: Realtime,
        pushes: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        let client = Self {
            inner: Arc::new(ClientInner {
                session_token: Mutex::new(options.session_token.clone()),
                id,
                options,
                realtime,
                state: Mutex::new(SessionState::Open),
                conversations: Mutex::new(HashMap::new()),
                events: EventEmitter::new(),
                in_flight,
                receipts: Mutex::new(ReceiptBook::default()),
                dispatcher: Mutex::new(None),
            }),
        };
        let dispatcher = spawn_dispatcher(client.downgrade(), pushes);
        *client.inner.dispatcher.lock() = Some(dispatcher);
        client
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn realtime(&self) -> &Realtime {
        &self.inner.realtime
    }

    pub fn is_open(&self) -> bool {
        *self.inner.state.lock() == SessionState::Open
    }

    pub fn on<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(callback)
    }

    pub fn once<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.once(callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        self.inner.events.emit(&event);
    }

    pub(crate) fn check_open(&self) -> ImResult<()> {
        match *self.inner.state.lock() {
            SessionState::Open => Ok(()),
            SessionState::Closing | SessionState::Closed => {
                Err(ImError::code(ErrorCode::SessionRequired, "client is closed"))
            }
        }
    }

    // ── Session ───────────────────────────────────────────────────────────────

    /// Open (or, with `via`, re-open on a new link) this identity's session.
    pub(crate) async fn open_session(
        &self,
        via: Option<&mpsc::UnboundedSender<Frame>>,
    ) -> ImResult<()> {
        let reconnect = via.is_some();
        let token = self.inner.session_token.lock().clone();
        let signed = match (&token, &self.inner.options.signature_factory) {
            (None, Some(factory)) => {
                let request = SignatureRequest {
                    client_id: self.inner.id.clone(),
                    conversation_id: None,
                    member_ids: Vec::new(),
                    action: SignatureAction::Open,
                };
                Some(factory.sign(request, ErrorCode::InvalidLogin).await?)
            }
            _ => None,
        };

        let config = self.inner.realtime.config();
        let frame = protocol::build_session_open(&SessionOpen {
            app_id: &config.app_id,
            peer_id: &self.inner.id,
            tag: self.inner.options.tag.as_deref(),
            session_token: token.as_deref(),
            signed: signed.as_ref(),
            reconnect,
            no_binary: config.no_binary,
            push_offline_messages: config.push_offline_messages,
        });
        let response = match via {
            Some(outbound) => {
                self.inner
                    .realtime
                    .request_on(outbound, frame, config.request_timeout)
                    .await?
            }
            None => self.request(frame).await?,
        };
        if let Some(token) = response.str_field("st") {
            *self.inner.session_token.lock() = Some(token.to_string());
        }
        debug!(client_id = %self.inner.id, reconnect, "Session opened");
        Ok(())
    }

    /// Re-open after reconnection. A fatal refusal closes this client
    /// instead of failing the whole reconnect.
    pub(crate) async fn reopen(&self, via: &mpsc::UnboundedSender<Frame>) -> ImResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        match self.open_session(Some(via)).await {
            Ok(()) => Ok(()),
            Err(err) => match err.error_code() {
                Some(code) if code.is_fatal_to_session() => {
                    warn!(client_id = %self.inner.id, %code, "Session refused on reconnect");
                    self.shutdown(code, Some(err.to_string()));
                    Ok(())
                }
                _ => Err(err),
            },
        }
    }

    /// Close the session. In-flight sends get `close_drain_timeout` to be
    /// acknowledged; the rest fail.
    pub async fn close(&self) -> ImResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Open {
                return Ok(());
            }
            *state = SessionState::Closing;
        }
        debug!(client_id = %self.inner.id, "Closing client");

        let mut in_flight = self.inner.in_flight.subscribe();
        let drain = self.inner.realtime.config().close_drain_timeout;
        if platform::timeout(drain, in_flight.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            debug!(
                client_id = %self.inner.id,
                remaining = *in_flight.borrow(),
                "Drain timed out"
            );
        }

        self.inner
            .realtime
            .send_oneway(protocol::build_session_close(&self.inner.id));
        self.shutdown(ErrorCode::CloseNormal, None);
        self.abort_dispatcher();
        Ok(())
    }

    /// Local teardown. No network traffic.
    fn shutdown(&self, code: ErrorCode, reason: Option<String>) {
        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.inner.realtime.detach_client(&self.inner.id);
        self.inner.realtime.fail_pending(Some(&self.inner.id), code);
        self.inner.conversations.lock().clear();
        *self.inner.receipts.lock() = ReceiptBook::default();
        debug!(client_id = %self.inner.id, %code, "Client closed");
        self.emit(ClientEvent::Close { code, reason });
    }

    pub(crate) fn abort_dispatcher(&self) {
        if let Some(dispatcher) = self.inner.dispatcher.lock().take() {
            dispatcher.abort();
        }
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    pub(crate) async fn request(&self, frame: Frame) -> ImResult<Frame> {
        let timeout = self.inner.realtime.config().request_timeout;
        self.request_with_timeout(frame, timeout).await
    }

    pub(crate) async fn request_with_timeout(
        &self,
        frame: Frame,
        timeout: Duration,
    ) -> ImResult<Frame> {
        self.inner.realtime.request(frame, timeout).await
    }

    pub(crate) fn track_send(&self) -> InFlight<'_> {
        self.inner.in_flight.send_modify(|n| *n += 1);
        InFlight(&self.inner.in_flight)
    }

    pub(crate) async fn sign_conversation(
        &self,
        conversation_id: Option<&str>,
        member_ids: &[String],
        action: SignatureAction,
    ) -> ImResult<Option<SignedFields>> {
        let Some(factory) = &self.inner.options.conversation_signature_factory else {
            return Ok(None);
        };
        let request = SignatureRequest {
            client_id: self.inner.id.clone(),
            conversation_id: conversation_id.map(str::to_string),
            member_ids: member_ids.to_vec(),
            action,
        };
        factory
            .sign(request, ErrorCode::ConversationSignatureFailed)
            .await
            .map(Some)
    }

    // ── Receipts ──────────────────────────────────────────────────────────────

    pub(crate) fn expect_receipt(&self, message: &Message) {
        self.inner.receipts.lock().expect(message, Instant::now());
    }

    /// Messages still waiting for a delivery receipt.
    #[doc(hidden)]
    pub fn awaiting_receipts(&self) -> usize {
        self.inner.receipts.lock().len()
    }

    pub(crate) fn forget_receipt(&self, message: &Message) {
        self.inner.receipts.lock().forget(message);
    }

    /// Index an acknowledged message by its server id. Returns the message if
    /// its receipt already arrived and it is now delivered.
    pub(crate) fn acknowledged(&self, message: &Message) -> Option<Message> {
        let delivered_at = {
            let mut book = self.inner.receipts.lock();
            if !book.index(message) {
                return None;
            }
            let early = [message.cid(), message.id()]
                .into_iter()
                .flatten()
                .find_map(|key| book.early.get(key).copied())?;
            book.forget(message);
            early
        };
        match message.confirm_delivery(delivered_at) {
            Ok(()) => Some(message.clone()),
            Err(e) => {
                debug!(error = %e, "Early receipt not applied");
                None
            }
        }
    }

    fn confirm_receipt(&self, keys: &[&str], at: DateTime<Utc>) -> Option<Message> {
        let message = {
            let mut book = self.inner.receipts.lock();
            let message = keys
                .iter()
                .find_map(|key| book.get(key).cloned());
            match message {
                Some(message) if message.status() == MessageStatus::Sending => {
                    for key in keys {
                        book.early.insert((*key).to_string(), at);
                    }
                    return None;
                }
                Some(message) => {
                    book.forget(&message);
                    message
                }
                None => {
                    trace!(?keys, "Receipt for unknown message");
                    return None;
                }
            }
        };
        match message.confirm_delivery(at) {
            Ok(()) => Some(message),
            Err(e) => {
                debug!(error = %e, "Receipt not applied");
                None
            }
        }
    }

    // ── Conversations ─────────────────────────────────────────────────────────

    /// Create a conversation. The local client is always a member.
    pub async fn create_conversation(&self, options: ConversationOptions) -> ImResult<Conversation> {
        self.check_open()?;
        if let Some(key) = options.attributes.keys().find(|key| is_reserved_key(key)) {
            return Err(ImError::validation(format!(
                "`{key}` is a reserved conversation field"
            )));
        }
        let mut members: Vec<String> = Vec::new();
        for id in options
            .members
            .iter()
            .cloned()
            .chain(std::iter::once(self.inner.id.clone()))
        {
            if !members.contains(&id) {
                members.push(id);
            }
        }

        let signed = self
            .sign_conversation(None, &members, SignatureAction::Start)
            .await?;
        let mut body = Map::new();
        body.insert("m".to_string(), json!(members));
        if let Some(name) = &options.name {
            body.insert("name".to_string(), Value::String(name.clone()));
        }
        if options.transient {
            body.insert("tr".to_string(), Value::Bool(true));
        }
        if options.unique {
            body.insert("unique".to_string(), Value::Bool(true));
        }
        if !options.attributes.is_empty() {
            body.insert("attr".to_string(), Value::Object(options.attributes.clone()));
        }

        let frame = protocol::build_conv(Op::Start, &self.inner.id, Value::Object(body), signed.as_ref());
        let response = self.request(frame).await?;
        let id = response
            .str_field("cid")
            .ok_or_else(|| ImError::code(ErrorCode::InternalError, "start response has no cid"))?
            .to_string();
        let created_at = response.field("cdate").and_then(time::from_value);
        debug!(client_id = %self.inner.id, conversation_id = %id, "Conversation created");

        let record = ConversationRecord {
            id,
            name: options.name,
            creator: Some(self.inner.id.clone()),
            members,
            transient: options.transient,
            unique: options.unique,
            unique_id: response.str_field("uniqueId").map(str::to_string),
            created_at,
            updated_at: created_at,
            attributes: options.attributes,
            ..ConversationRecord::default()
        };
        Ok(self.upsert(record))
    }

    pub async fn create_chat_room(
        &self,
        name: impl Into<String>,
        attributes: Map<String, Value>,
    ) -> ImResult<Conversation> {
        let mut options = ConversationOptions::new().name(name).transient(true);
        options.attributes = attributes;
        self.create_conversation(options).await
    }

    /// Look up a conversation, from the cache unless `no_cache` is set.
    pub async fn get_conversation(&self, id: &str, no_cache: bool) -> ImResult<Conversation> {
        self.check_open()?;
        if !no_cache {
            if let Some(cached) = self.cached(id) {
                return Ok(cached);
            }
        }
        self.get_query()
            .equal_to("objectId", id)
            .limit(1)
            .find()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ImError::code(
                    ErrorCode::ConversationNotFound,
                    format!("conversation {id} not found"),
                )
            })
    }

    pub fn get_query(&self) -> ConversationQuery<IMClient> {
        ConversationQuery::new(self.clone())
    }

    /// Mark every given conversation read with a single request.
    pub async fn mark_all_as_read(&self, conversations: &[Conversation]) -> ImResult<Vec<Conversation>> {
        self.check_open()?;
        if conversations.is_empty() {
            return Ok(Vec::new());
        }
        let entries: Vec<Value> = conversations.iter().map(Conversation::begin_read).collect();
        let response = self
            .request(protocol::build_read(&self.inner.id, entries))
            .await?;
        for conversation in conversations {
            conversation.reconcile_read(&response.body);
        }
        Ok(conversations.to_vec())
    }

    /// Which of `client_ids` are online. At most [`MAX_PING_IDS`] ids.
    pub async fn ping<I, S>(&self, client_ids: I) -> ImResult<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = client_ids.into_iter().map(Into::into).collect();
        if ids.len() > MAX_PING_IDS {
            return Err(ImError::validation(format!(
                "ping accepts at most {MAX_PING_IDS} ids, got {}",
                ids.len()
            )));
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.check_open()?;
        let response = self
            .request(protocol::build_presence_query(&self.inner.id, &ids))
            .await?;
        let online = string_list(response.field("onlineSessionPeerIds")).unwrap_or_default();
        Ok(ids.into_iter().filter(|id| online.contains(id)).collect())
    }

    /// Parse a message envelope the same way pushed messages are parsed.
    /// `None` when a plugin hook rejected it.
    pub fn parse_message(&self, raw: Value) -> ImResult<Option<Message>> {
        self.inner.realtime.parse_message(raw).map(Flow::into_option)
    }

    /// Parse a conversation record into the cached instance for its id.
    pub fn parse_conversation(&self, raw: Value) -> ImResult<Conversation> {
        let record: ConversationRecord = serde_json::from_value(raw)?;
        if record.id.is_empty() {
            return Err(ImError::validation("conversation record has no id"));
        }
        Ok(self.upsert(record))
    }

    pub fn is_mentioned(&self, message: &Message) -> bool {
        message.mentioned(&self.inner.id)
    }

    pub(crate) fn cached(&self, id: &str) -> Option<Conversation> {
        self.inner.conversations.lock().get(id).cloned()
    }

    /// Split the raw last message off a record and parse it.
    pub(crate) fn take_last_message(&self, record: &mut ConversationRecord) -> Option<Message> {
        let raw = record.last_message.take()?;
        match self.parse_message(raw) {
            Ok(Some(mut message)) => {
                if message.conversation_id().is_none() {
                    message.set_conversation_id(&record.id);
                }
                Some(message)
            }
            Ok(None) => None,
            Err(e) => {
                debug!(conversation_id = %record.id, error = %e, "Ignoring unparsable last message");
                None
            }
        }
    }

    /// The single path from a record to a conversation: merge into the cached
    /// instance, or create, cache and decorate a new one.
    pub(crate) fn upsert(&self, mut record: ConversationRecord) -> Conversation {
        let last_message = self.take_last_message(&mut record);
        let existing = self.cached(&record.id);
        if let Some(existing) = existing {
            existing.merge_record(record, last_message);
            return existing;
        }
        let conversation = {
            let mut cache = self.inner.conversations.lock();
            match cache.get(&record.id) {
                Some(raced) => return raced.clone(),
                None => {
                    let id = record.id.clone();
                    let conversation = Conversation::new(self.downgrade(), record, last_message);
                    cache.insert(id, conversation.clone());
                    conversation
                }
            }
        };
        self.inner
            .realtime
            .hooks()
            .on_conversation_create
            .apply(&conversation);
        conversation
    }

    /// Cached conversation, or fetched, or a bare local one as last resort.
    /// Fetch `id` into the cache off the dispatch path, then report it on
    /// `loaded`. A failed fetch leaves a placeholder behind.
    fn load_in_background(&self, id: String, loaded: mpsc::UnboundedSender<String>) {
        let client = self.downgrade();
        platform::spawn("imkit-conversation-load", async move {
            if let Some(inner) = client.upgrade() {
                IMClient { inner }.conversation_for(&id).await;
            }
            let _ = loaded.send(id);
        });
    }

    async fn conversation_for(&self, id: &str) -> Conversation {
        if let Some(cached) = self.cached(id) {
            return cached;
        }
        match self.get_conversation(id, true).await {
            Ok(conversation) => conversation,
            Err(e) => {
                debug!(conversation_id = %id, error = %e, "Using a local placeholder conversation");
                self.upsert(ConversationRecord::with_id(id))
            }
        }
    }

    // ── Push dispatch ─────────────────────────────────────────────────────────

    async fn dispatch(&self, frame: Frame) {
        if !self.is_open() {
            return;
        }
        trace!(client_id = %self.inner.id, cmd = %frame.cmd, op = ?frame.op, "Dispatching push");
        match (frame.cmd, frame.op) {
            (CommandType::Direct, _) => self.on_direct(frame.body).await,
            (CommandType::Rcp, _) => self.on_receipt(&frame.body),
            (CommandType::Conv, Some(op)) => self.on_conv(op, &frame.body).await,
            (CommandType::Patch, _) => self.on_patch(&frame.body).await,
            (CommandType::Unread, _) => self.on_unread(&frame.body).await,
            (CommandType::Session, Some(Op::Closed)) => self.on_session_closed(&frame.body),
            (cmd, op) => debug!(%cmd, ?op, "Unhandled push"),
        }
    }

    async fn on_direct(&self, body: Value) {
        let Some(conversation_id) = str_field(&body, "conversationId") else {
            warn!("Message push without conversationId");
            return;
        };
        // Acknowledge first: a message dropped by a hook is still consumed.
        if let Some(message_id) = body.get("id").and_then(Value::as_str) {
            self.inner.realtime.send_oneway(protocol::build_ack(
                &self.inner.id,
                &conversation_id,
                message_id,
            ));
        }
        let message = match self.parse_message(body) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Dropping malformed message");
                return;
            }
        };

        let conversation = self.conversation_for(&conversation_id).await;
        let context = DispatchContext {
            message,
            conversation,
        };
        if let Err(stage) = self
            .inner
            .realtime
            .hooks()
            .before_message_dispatch
            .check(&context)
        {
            debug!(conversation_id = %conversation_id, ?stage, "Message dropped before dispatch");
            return;
        }
        let DispatchContext {
            message,
            conversation,
        } = context;

        let unread_changed = conversation.apply_incoming(&message, &self.inner.id);
        conversation.emit(ConversationEvent::Message(message.clone()));
        self.emit(ClientEvent::Message {
            conversation: conversation.clone(),
            message,
        });
        if unread_changed {
            conversation.emit_unread();
            self.emit(ClientEvent::UnreadMessagesCountUpdate(vec![conversation]));
        }
    }

    fn on_receipt(&self, body: &Value) {
        let Some(conversation_id) = body.get("conversationId").and_then(Value::as_str) else {
            return;
        };
        let at = body
            .get("t")
            .and_then(time::from_value)
            .unwrap_or_else(Utc::now);
        let conversation = self.cached(conversation_id);
        let read = body.get("read").and_then(Value::as_bool).unwrap_or(false);

        if !read {
            let keys: Vec<&str> = ["id", "cid"]
                .iter()
                .filter_map(|key| body.get(*key).and_then(Value::as_str))
                .collect();
            if let Some(message) = self.confirm_receipt(&keys, at) {
                trace!(conversation_id, message_id = ?message.id(), "Message delivered");
                if let Some(conversation) = &conversation {
                    conversation.emit(ConversationEvent::Receipt { message });
                }
            }
        }

        if let Some(conversation) = conversation {
            let (delivered, read) = if read {
                (None, Some(at))
            } else {
                (Some(at), None)
            };
            conversation.advance_read_markers(delivered, read);
        }
    }

    async fn on_conv(&self, op: Op, body: &Value) {
        let Some(conversation_id) = str_field(body, "cid") else {
            return;
        };
        let by = str_field(body, "initBy");
        match op {
            Op::Joined => {
                let conversation = self.conversation_for(&conversation_id).await;
                conversation.add_members_locally(&[self.inner.id.clone()]);
                self.emit(ClientEvent::Invited {
                    conversation,
                    invited_by: by,
                });
            }
            Op::Left => {
                let conversation = self
                    .cached(&conversation_id)
                    .unwrap_or_else(|| self.upsert(ConversationRecord::with_id(&conversation_id)));
                conversation.remove_members_locally(&[self.inner.id.clone()]);
                self.inner.conversations.lock().remove(&conversation_id);
                self.emit(ClientEvent::Kicked {
                    conversation,
                    kicked_by: by,
                });
            }
            Op::MembersJoined => {
                let members = string_list(body.get("m")).unwrap_or_default();
                let conversation = self.conversation_for(&conversation_id).await;
                conversation.add_members_locally(&members);
                conversation.emit(ConversationEvent::MembersJoined {
                    members: members.clone(),
                    invited_by: by.clone(),
                });
                self.emit(ClientEvent::MembersJoined {
                    conversation,
                    members,
                    invited_by: by,
                });
            }
            Op::MembersLeft => {
                let members = string_list(body.get("m")).unwrap_or_default();
                let conversation = self.conversation_for(&conversation_id).await;
                conversation.remove_members_locally(&members);
                conversation.emit(ConversationEvent::MembersLeft {
                    members: members.clone(),
                    kicked_by: by.clone(),
                });
                self.emit(ClientEvent::MembersLeft {
                    conversation,
                    members,
                    kicked_by: by,
                });
            }
            Op::Updated => {
                let attributes = body
                    .get("attr")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let updated_at = body.get("udate").and_then(time::from_value);
                let conversation = self.conversation_for(&conversation_id).await;
                conversation.apply_remote_attributes(&attributes, updated_at);
                conversation.emit(ConversationEvent::InfoUpdated {
                    attributes,
                    updated_by: by,
                });
            }
            other => debug!(op = ?other, "Unhandled conv push"),
        }
    }

    async fn on_patch(&self, body: &Value) {
        let patches = body
            .get("patches")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for patch in patches {
            let Some(conversation_id) = str_field(&patch, "conversationId") else {
                continue;
            };
            let recall = patch.get("recall").and_then(Value::as_bool).unwrap_or(false);
            let message = if recall {
                let id = str_field(&patch, "id");
                let timestamp = patch.get("timestamp").and_then(time::from_value);
                let (Some(id), Some(timestamp)) = (id, timestamp) else {
                    warn!(conversation_id = %conversation_id, "Recall push without a pointer");
                    continue;
                };
                let mut pointer = MessagePointer::new(id, timestamp);
                pointer.cid = str_field(&patch, "cid");
                let mut message =
                    Message::recalled(&pointer, patch.get("updatedAt").and_then(time::from_value));
                message.set_conversation_id(&conversation_id);
                message
            } else {
                match self.parse_message(patch) {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(conversation_id = %conversation_id, error = %e, "Dropping malformed patch");
                        continue;
                    }
                }
            };

            let conversation = self.conversation_for(&conversation_id).await;
            conversation.replace_message(&message);
            if recall {
                conversation.emit(ConversationEvent::MessageRecall(message.clone()));
                self.emit(ClientEvent::MessageRecall {
                    conversation,
                    message,
                });
            } else {
                conversation.emit(ConversationEvent::MessageUpdate(message.clone()));
                self.emit(ClientEvent::MessageUpdate {
                    conversation,
                    message,
                });
            }
        }
    }

    async fn on_unread(&self, body: &Value) {
        let entries = body
            .get("convs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut updated = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(conversation_id) = str_field(&entry, "cid") else {
                continue;
            };
            let count = entry
                .get("unread")
                .and_then(Value::as_u64)
                .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX));
            let mentioned = entry.get("mentioned").and_then(Value::as_bool).unwrap_or(false);
            let last_message = match entry.get("msg") {
                Some(raw) => self.parse_message(raw.clone()).ok().flatten(),
                None => None,
            };
            let conversation = self.conversation_for(&conversation_id).await;
            conversation.set_unread(count, mentioned, last_message);
            conversation.emit_unread();
            updated.push(conversation);
        }
        if !updated.is_empty() {
            self.emit(ClientEvent::UnreadMessagesCountUpdate(updated));
        }
    }

    fn on_session_closed(&self, body: &Value) {
        let code = body
            .get("code")
            .and_then(Value::as_u64)
            .map_or(ErrorCode::CloseNormal, ErrorCode::from_server);
        let reason = str_field(body, "reason");
        warn!(client_id = %self.inner.id, %code, ?reason, "Session closed by server");
        if code == ErrorCode::SessionConflict {
            self.emit(ClientEvent::Conflict {
                reason: reason.clone(),
            });
        }
        self.shutdown(code, reason);
    }
}

impl QueryBackend for IMClient {
    type Output = Conversation;

    fn client_id(&self) -> &str {
        &self.inner.id
    }

    fn run_query(&self, descriptor: QueryDescriptor) -> BoxFuture<'_, ImResult<Vec<Conversation>>> {
        Box::pin(async move {
            self.check_open()?;
            let frame = protocol::build_conv(Op::Query, &self.inner.id, descriptor.to_json(), None);
            let response = self.request(frame).await?;
            let results = response
                .field("results")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            results
                .into_iter()
                .map(|raw| self.parse_conversation(raw))
                .collect()
        })
    }
}

impl std::fmt::Debug for IMClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IMClient")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .finish()
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Pushes held back until the conversations they name are loaded.
///
/// A push for an uncached conversation parks here while the conversation is
/// fetched in the background; pushes for other conversations keep flowing.
/// Pushes touching a conversation that has parked pushes park behind them,
/// so each conversation still sees its pushes in arrival order.
#[derive(Default)]
struct Backlog {
    parked: VecDeque<(Vec<String>, Frame)>,
    fetching: HashSet<String>,
}

impl Backlog {
    fn blocks(&self, ids: &[String]) -> bool {
        ids.iter().any(|id| {
            self.fetching.contains(id) || self.parked.iter().any(|(parked, _)| parked.contains(id))
        })
    }

    fn park(&mut self, ids: Vec<String>, frame: Frame) {
        self.parked.push_back((ids, frame));
    }

    /// Take the parked pushes that no longer wait on a fetch, in order.
    fn release(&mut self) -> Vec<Frame> {
        let mut held = self.fetching.clone();
        let mut ready = Vec::new();
        let mut still = VecDeque::new();
        for (ids, frame) in self.parked.drain(..) {
            if ids.iter().any(|id| held.contains(id)) {
                held.extend(ids.iter().cloned());
                still.push_back((ids, frame));
            } else {
                ready.push(frame);
            }
        }
        self.parked = still;
        ready
    }
}

/// Conversations a push refers to, and the subset it needs loaded.
fn push_conversations(frame: &Frame) -> (Vec<String>, Vec<String>) {
    let body = &frame.body;
    let listed = |key: &str, id_key: &str| -> Vec<String> {
        body.get(key)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|entry| str_field(entry, id_key))
            .collect()
    };
    match (frame.cmd, frame.op) {
        (CommandType::Direct, _) => {
            let ids: Vec<String> = str_field(body, "conversationId").into_iter().collect();
            (ids.clone(), ids)
        }
        (CommandType::Rcp, _) => (str_field(body, "conversationId").into_iter().collect(), Vec::new()),
        (CommandType::Conv, Some(Op::Left)) => (str_field(body, "cid").into_iter().collect(), Vec::new()),
        (CommandType::Conv, Some(_)) => {
            let ids: Vec<String> = str_field(body, "cid").into_iter().collect();
            (ids.clone(), ids)
        }
        (CommandType::Patch, _) => {
            let ids = listed("patches", "conversationId");
            (ids.clone(), ids)
        }
        (CommandType::Unread, _) => {
            let ids = listed("convs", "cid");
            (ids.clone(), ids)
        }
        _ => (Vec::new(), Vec::new()),
    }
}

fn spawn_dispatcher(
    client: Weak<ClientInner>,
    mut pushes: mpsc::UnboundedReceiver<Frame>,
) -> TaskHandle {
    platform::spawn("imkit-dispatcher", async move {
        let (loaded_tx, mut loaded_rx) = mpsc::unbounded_channel::<String>();
        let mut backlog = Backlog::default();
        loop {
            tokio::select! {
                frame = pushes.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    let Some(inner) = client.upgrade() else {
                        break;
                    };
                    let client = IMClient { inner };
                    let (touched, needed) = push_conversations(&frame);
                    let missing: Vec<String> = needed
                        .into_iter()
                        .filter(|id| client.cached(id).is_none())
                        .collect();
                    if missing.is_empty() && !backlog.blocks(&touched) {
                        client.dispatch(frame).await;
                        continue;
                    }
                    for id in missing {
                        if backlog.fetching.insert(id.clone()) {
                            client.load_in_background(id, loaded_tx.clone());
                        }
                    }
                    trace!(cmd = %frame.cmd, parked = backlog.parked.len() + 1, "Push parked");
                    backlog.park(touched, frame);
                }
                Some(id) = loaded_rx.recv() => {
                    backlog.fetching.remove(&id);
                    let Some(inner) = client.upgrade() else {
                        break;
                    };
                    let client = IMClient { inner };
                    for frame in backlog.release() {
                        client.dispatch(frame).await;
                    }
                }
            }
        }
        trace!("Dispatcher finished");
    })
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    value.and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sending(cid: &str) -> Message {
        let mut message = Message::text("hi");
        message.set_cid(cid);
        message.begin_send("alice", "conv-1", false).unwrap();
        message
    }

    fn acknowledged(cid: &str, id: &str) -> Message {
        let mut message = sending(cid);
        message.acknowledge(Some(id.to_string()), Some(Utc::now())).unwrap();
        message
    }

    #[test]
    fn test_acknowledged_message_counts_once() {
        let mut book = ReceiptBook::default();
        let start = Instant::now();
        book.expect(&sending("c1"), start);
        assert!(book.index(&acknowledged("c1", "m1")));
        assert_eq!(book.len(), 1);
        assert!(book.get("m1").is_some());
        assert!(!book.index(&acknowledged("c2", "m2")));
    }

    #[test]
    fn test_unanswered_receipts_expire() {
        let mut book = ReceiptBook::new(Duration::from_secs(60), 16);
        let start = Instant::now();
        book.expect(&sending("c1"), start);
        book.index(&acknowledged("c1", "m1"));
        book.early.insert("m1".into(), Utc::now());

        book.expect(&sending("c2"), start + Duration::from_secs(61));
        assert_eq!(book.len(), 1);
        assert!(book.get("c1").is_none());
        assert!(book.get("m1").is_none());
        assert!(book.early.is_empty());
        assert!(book.get("c2").is_some());
    }

    fn push(conversation_id: &str) -> Frame {
        Frame::new(
            CommandType::Direct,
            None,
            Some("alice"),
            json!({ "conversationId": conversation_id }),
        )
    }

    #[test]
    fn test_backlog_releases_in_order_once_loaded() {
        let mut backlog = Backlog::default();
        backlog.fetching.insert("slow".into());
        backlog.park(vec!["slow".into()], push("slow"));
        assert!(backlog.blocks(&["slow".to_string()]));
        assert!(!backlog.blocks(&["fast".to_string()]));
        backlog.park(vec!["slow".into()], push("slow"));

        assert!(backlog.release().is_empty());
        backlog.fetching.remove("slow");
        assert_eq!(backlog.release().len(), 2);
        assert!(backlog.parked.is_empty());
    }

    #[test]
    fn test_backlog_holds_pushes_sharing_a_waiting_conversation() {
        let mut backlog = Backlog::default();
        backlog.fetching.insert("a".into());
        backlog.park(vec!["a".into(), "b".into()], push("a"));
        backlog.park(vec!["b".into()], push("b"));
        backlog.park(vec!["c".into()], push("c"));

        let ready = backlog.release();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].body["conversationId"], json!("c"));
        assert_eq!(backlog.parked.len(), 2);
    }

    #[test]
    fn test_push_conversations_by_command() {
        let (touched, needed) = push_conversations(&push("conv-1"));
        assert_eq!(touched, vec!["conv-1".to_string()]);
        assert_eq!(needed, touched);

        let left = Frame::new(CommandType::Conv, Some(Op::Left), None, json!({ "cid": "conv-2" }));
        let (touched, needed) = push_conversations(&left);
        assert_eq!(touched, vec!["conv-2".to_string()]);
        assert!(needed.is_empty());

        let unread = Frame::new(
            CommandType::Unread,
            None,
            None,
            json!({ "convs": [{ "cid": "x" }, { "cid": "y" }] }),
        );
        assert_eq!(push_conversations(&unread).1, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_oldest_wait_is_evicted_when_full() {
        let mut book = ReceiptBook::new(Duration::from_secs(600), 2);
        let start = Instant::now();
        for (i, cid) in ["c1", "c2", "c3"].into_iter().enumerate() {
            book.expect(&sending(cid), start + Duration::from_secs(i as u64));
        }
        assert_eq!(book.len(), 2);
        assert!(book.get("c1").is_none());
        assert!(book.get("c3").is_some());
    }
}
