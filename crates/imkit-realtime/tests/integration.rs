//! Integration tests for imkit-realtime.
//!
//! Unit tests (no server) and scripted tests against an in-process fake
//! server plugged in through the `Connector` seam.
//!
//! Run with: cargo test -p imkit-realtime

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use imkit_core::{ErrorCode, ImError, ImResult, ReconnectConfig, RealtimeConfig};
use imkit_message::{Message, MessageClass, MessagePointer, MessageStatus};
use imkit_query::Modifiable;
use imkit_realtime::{
    ClientEvent, ClientOptions, CommandType, ConnectionState, Connection, Connector,
    ConversationEvent, ConversationKind, ConversationOptions, Frame, IMClient, MessagePriority,
    MessageQuery, Op, Plugin, Realtime, RealtimeEvent, SendOptions, TransportEvent,
};

// ── Scripted Server ───────────────────────────────────────────────────────────

const ONLINE: [&str; 2] = ["alice", "bob"];

#[derive(Default)]
struct ServerState {
    conversations: Mutex<HashMap<String, Value>>,
    logs: Mutex<HashMap<String, Vec<Value>>>,
    received: Mutex<Vec<Frame>>,
    link: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    generation: AtomicU64,
    next_id: AtomicU64,
    clock: AtomicI64,
    refuse: AtomicBool,
    hold_acks: AtomicBool,
    auto_receipts: AtomicBool,
    garble_counts: AtomicBool,
    update_delay: Mutex<Option<Duration>>,
    query_delay: Mutex<Option<Duration>>,
    patch_delays: Mutex<VecDeque<Duration>>,
}

/// Answers requests the way the messaging backend does, from in-memory
/// state.
#[derive(Clone)]
struct MockServer {
    state: Arc<ServerState>,
}

impl MockServer {
    fn new() -> Self {
        let state = ServerState::default();
        state.clock.store(1_700_000_000_000, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    fn accept(&self) -> ImResult<Connection> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(ImError::code(ErrorCode::CloseAbnormal, "connection refused"));
        }
        let (connection, mut from_client, to_client) = Connection::pair();
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.link.lock() = Some(to_client.clone());

        let server = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = from_client.recv().await {
                if server.state.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                server.handle(frame, &to_client);
            }
        });
        Ok(connection)
    }

    fn tick(&self) -> i64 {
        self.state.clock.fetch_add(1_000, Ordering::SeqCst) + 1_000
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn handle(&self, frame: Frame, link: &mpsc::UnboundedSender<TransportEvent>) {
        self.state.received.lock().push(frame.clone());
        let peer = frame.peer_id.clone().unwrap_or_default();
        let reply = |cmd: CommandType, op: Option<Op>, body: Value| {
            let mut response = Frame::new(cmd, op, Some(&peer), body);
            response.serial = frame.serial;
            response
        };
        let send = |response: Frame| {
            let _ = link.send(TransportEvent::Frame(response));
        };
        let body = &frame.body;

        match (frame.cmd, frame.op) {
            (CommandType::Session, Some(Op::Open)) => {
                send(reply(
                    CommandType::Session,
                    Some(Op::Opened),
                    json!({ "st": format!("token-{peer}") }),
                ));
            }
            (CommandType::Conv, Some(Op::Start)) => {
                let cid = self.next_id("conv");
                let created = self.tick();
                let mut record = json!({
                    "objectId": cid,
                    "c": peer,
                    "m": body["m"],
                    "tr": body.get("tr").cloned().unwrap_or(json!(false)),
                    "createdAt": created,
                });
                if let Some(name) = body.get("name") {
                    record["name"] = name.clone();
                }
                if let Some(attr) = body.get("attr").and_then(Value::as_object) {
                    for (key, value) in attr {
                        record[key.as_str()] = value.clone();
                    }
                }
                self.state.conversations.lock().insert(cid.clone(), record);
                send(reply(
                    CommandType::Conv,
                    Some(Op::Started),
                    json!({ "cid": cid, "cdate": created }),
                ));
            }
            (CommandType::Conv, Some(Op::Query)) => {
                let conversations = self.state.conversations.lock();
                let results: Vec<Value> = match body["where"]["objectId"].as_str() {
                    Some(id) => conversations.get(id).cloned().into_iter().collect(),
                    None => conversations.values().cloned().collect(),
                };
                let response =
                    reply(CommandType::Conv, Some(Op::Results), json!({ "results": results }));
                match *self.state.query_delay.lock() {
                    Some(delay) => {
                        let link = link.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = link.send(TransportEvent::Frame(response));
                        });
                    }
                    None => send(response),
                }
            }
            (CommandType::Conv, Some(Op::Update)) => {
                let attr = body["attr"].clone();
                let response = reply(
                    CommandType::Conv,
                    Some(Op::Updated),
                    json!({ "attr": attr, "udate": self.tick() }),
                );
                match *self.state.update_delay.lock() {
                    Some(delay) => {
                        let link = link.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = link.send(TransportEvent::Frame(response));
                        });
                    }
                    None => send(response),
                }
            }
            (CommandType::Conv, Some(op @ (Op::Add | Op::Remove))) => {
                let cid = body["cid"].as_str().unwrap_or_default().to_string();
                let ids: Vec<String> = body["m"]
                    .as_array()
                    .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
                let mut conversations = self.state.conversations.lock();
                let members = conversations.get_mut(&cid).map(|record| {
                    let mut members: Vec<String> =
                        serde_json::from_value(record["m"].clone()).unwrap_or_default();
                    if op == Op::Add {
                        for id in &ids {
                            if !members.contains(id) {
                                members.push(id.clone());
                            }
                        }
                    } else {
                        members.retain(|m| !ids.contains(m));
                    }
                    record["m"] = json!(members);
                    members
                });
                let (reply_op, body) = if op == Op::Add {
                    (Op::Added, json!({ "m": members }))
                } else {
                    (Op::Removed, json!({}))
                };
                send(reply(CommandType::Conv, Some(reply_op), body));
            }
            (CommandType::Conv, Some(Op::Mute)) => {
                send(reply(CommandType::Conv, Some(Op::Updated), json!({ "mu": [peer] })));
            }
            (CommandType::Conv, Some(Op::Unmute)) => {
                send(reply(CommandType::Conv, Some(Op::Updated), json!({ "mu": [] })));
            }
            (CommandType::Conv, Some(Op::Count))
                if self.state.garble_counts.load(Ordering::SeqCst) =>
            {
                let _ = link.send(TransportEvent::Malformed {
                    serial: frame.serial,
                    reason: "unknown variant `results2`".into(),
                });
            }
            (CommandType::Conv, Some(Op::Count)) => {
                let cid = body["cid"].as_str().unwrap_or_default();
                let count = self.state.conversations.lock()[cid]["m"]
                    .as_array()
                    .map_or(0, Vec::len);
                send(reply(CommandType::Conv, Some(Op::Results), json!({ "count": count })));
            }
            (CommandType::Conv, Some(Op::MaxRead)) => {
                send(reply(
                    CommandType::Conv,
                    Some(Op::MaxRead),
                    json!({
                        "maxAckTimestamp": 1_700_000_500_000_i64,
                        "maxReadTimestamp": 1_700_000_400_000_i64,
                    }),
                ));
            }
            (CommandType::Direct, _) => {
                if self.state.hold_acks.load(Ordering::SeqCst) {
                    return;
                }
                let cid = body["conversationId"].as_str().unwrap_or_default().to_string();
                let id = self.next_id("msg");
                let timestamp = self.tick();
                let stored = json!({
                    "data": body["data"],
                    "id": id,
                    "cid": body["cid"],
                    "from": peer,
                    "conversationId": cid,
                    "timestamp": timestamp,
                });
                self.state.logs.lock().entry(cid.clone()).or_default().push(stored);
                send(reply(CommandType::Ack, None, json!({ "id": id, "timestamp": timestamp })));

                let wants_receipt = body.get("r").and_then(Value::as_bool).unwrap_or(false);
                if wants_receipt && self.state.auto_receipts.load(Ordering::SeqCst) {
                    send(Frame::new(
                        CommandType::Rcp,
                        None,
                        Some(&peer),
                        json!({
                            "id": id,
                            "cid": body["cid"],
                            "conversationId": cid,
                            "t": timestamp + 10,
                        }),
                    ));
                }
            }
            (CommandType::Patch, Some(Op::Modify)) => {
                let patch = &body["patches"][0];
                let cid = patch["conversationId"].as_str().unwrap_or_default();
                let id = patch["id"].as_str().unwrap_or_default();
                let mut logs = self.state.logs.lock();
                let stored = logs
                    .get_mut(cid)
                    .and_then(|log| log.iter_mut().find(|m| m["id"] == json!(id)));
                let response = match stored {
                    Some(stored) if stored["timestamp"] == patch["timestamp"] => {
                        stored["data"] = if patch["recall"] == json!(true) {
                            json!({ "type": -127 })
                        } else {
                            patch["data"].clone()
                        };
                        reply(
                            CommandType::Patch,
                            Some(Op::Modified),
                            json!({ "lastPatchTime": self.tick() }),
                        )
                    }
                    _ => reply(
                        CommandType::Patch,
                        Some(Op::Modified),
                        json!({ "code": 4306, "reason": "message pointer does not match" }),
                    ),
                };
                let delay = self.state.patch_delays.lock().pop_front();
                match delay {
                    Some(delay) => {
                        let link = link.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = link.send(TransportEvent::Frame(response));
                        });
                    }
                    None => send(response),
                }
            }
            (CommandType::Logs, _) => {
                let cid = body["conversationId"].as_str().unwrap_or_default();
                let before = body.get("t").and_then(Value::as_i64);
                let limit = body.get("l").and_then(Value::as_u64).unwrap_or(20) as usize;
                let logs = self.state.logs.lock();
                let mut matching: Vec<Value> = logs
                    .get(cid)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|m| before.map_or(true, |t| m["timestamp"].as_i64() < Some(t)))
                    .collect();
                // Newest first, like the backend.
                matching.reverse();
                matching.truncate(limit);
                send(reply(CommandType::Logs, None, json!({ "logs": matching })));
            }
            (CommandType::Read, _) => {
                let convs: Vec<Value> = body["convs"]
                    .as_array()
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|e| json!({ "cid": e["cid"], "unreadMessagesCount": 0 }))
                            .collect()
                    })
                    .unwrap_or_default();
                send(reply(CommandType::Read, None, json!({ "convs": convs })));
            }
            (CommandType::Presence, Some(Op::Query)) => {
                let online: Vec<&str> = body["sessionPeerIds"]
                    .as_array()
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .filter(|id| ONLINE.contains(id))
                            .collect()
                    })
                    .unwrap_or_default();
                send(reply(
                    CommandType::Presence,
                    Some(Op::Results),
                    json!({ "onlineSessionPeerIds": online }),
                ));
            }
            _ => {}
        }
    }

    fn seed_conversation(&self, record: Value) {
        let id = record["objectId"].as_str().unwrap().to_string();
        self.state.conversations.lock().insert(id, record);
    }

    fn push(&self, frame: Frame) {
        if let Some(link) = self.state.link.lock().as_ref() {
            let _ = link.send(TransportEvent::Frame(frame));
        }
    }

    fn push_message(&self, to: &str, body: Value) {
        self.push(Frame::new(CommandType::Direct, None, Some(to), body));
    }

    fn drop_connection(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = self.state.link.lock().take() {
            let _ = link.send(TransportEvent::Closed {
                code: Some(1006),
                reason: "dropped".into(),
            });
        }
    }

    fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    fn hold_acks(&self, hold: bool) {
        self.state.hold_acks.store(hold, Ordering::SeqCst);
    }

    fn auto_receipts(&self, enabled: bool) {
        self.state.auto_receipts.store(enabled, Ordering::SeqCst);
    }

    fn delay_queries(&self, delay: Option<Duration>) {
        *self.state.query_delay.lock() = delay;
    }

    fn garble_counts(&self, garble: bool) {
        self.state.garble_counts.store(garble, Ordering::SeqCst);
    }

    fn delay_updates(&self, delay: Duration) {
        *self.state.update_delay.lock() = Some(delay);
    }

    /// Delay the replies to the next patches, one entry per patch.
    fn delay_patches(&self, delays: impl IntoIterator<Item = Duration>) {
        self.state.patch_delays.lock().extend(delays);
    }

    fn received(&self, cmd: CommandType, op: Option<Op>) -> Vec<Frame> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|f| f.cmd == cmd && f.op == op)
            .cloned()
            .collect()
    }
}

impl Connector for MockServer {
    fn connect(&self, _url: &str) -> BoxFuture<'static, ImResult<Connection>> {
        let server = self.clone();
        Box::pin(async move { server.accept() })
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T: Clone> Recorder<T> {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn push(&self, value: T) {
        self.0.lock().push(value);
    }

    fn snapshot(&self) -> Vec<T> {
        self.0.lock().clone()
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn config() -> RealtimeConfig {
    RealtimeConfig::new("test-app")
        .server("ws://im.test")
        .request_timeout(Duration::from_secs(2))
        .send_timeout(Duration::from_secs(2))
        .close_drain_timeout(Duration::from_millis(200))
        .reconnect(ReconnectConfig {
            intervals: vec![Duration::from_millis(10)],
            fallback: Duration::from_millis(10),
            max_attempts: 3,
        })
}

async fn connect_as(server: &MockServer, id: &str) -> (Realtime, IMClient) {
    let realtime = Realtime::with_connector(config(), Arc::new(server.clone())).unwrap();
    let client = realtime
        .create_im_client(id, ClientOptions::new())
        .await
        .unwrap();
    (realtime, client)
}

fn incoming(id: &str, from: &str, conversation_id: &str, data: Value) -> Value {
    json!({
        "data": data,
        "id": id,
        "cid": format!("c-{id}"),
        "from": from,
        "conversationId": conversation_id,
        "timestamp": 1_700_000_100_000_i64,
    })
}

// ── Unit Tests (no server) ────────────────────────────────────────────────────

mod unit {
    use super::*;

    #[test]
    fn realtime_connects_lazily() {
        let server = MockServer::new();
        let realtime = Realtime::with_connector(config(), Arc::new(server.clone())).unwrap();
        assert_eq!(realtime.connection_state(), ConnectionState::Idle);
        assert_eq!(server.state.generation.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn register_plugin_adds_its_classes() {
        let realtime = Realtime::with_connector(config(), Arc::new(MockServer::new())).unwrap();
        let before = realtime.registry().len();
        realtime
            .register_plugin(Plugin::new().message_classes([MessageClass::typed(9, "Card")]))
            .unwrap();
        assert_eq!(realtime.registry().len(), before + 1);
        assert!(realtime.registry().resolve(9).is_some());
    }

    #[test]
    fn realtime_rejects_invalid_config() {
        let err = Realtime::with_connector(RealtimeConfig::new(""), Arc::new(MockServer::new()))
            .unwrap_err();
        assert!(matches!(err, ImError::InvalidConfig(_)));
    }

    #[test]
    fn conflicting_message_classes_leave_registry_unchanged() {
        let realtime = Realtime::with_connector(config(), Arc::new(MockServer::new())).unwrap();
        let before = realtime.registry().len();
        let result = realtime.register([
            MessageClass::typed(11, "Sticker"),
            MessageClass::typed(11, "AlsoSticker"),
        ]);
        assert!(result.is_err());
        assert_eq!(realtime.registry().len(), before);
    }

    #[test]
    fn parse_message_applies_plugin_hooks() {
        let plugin = Plugin::new()
            .name("upper")
            .before_message_parse(|mut raw: Value| {
                if let Some(text) = raw["data"].as_str() {
                    raw["data"] = json!(text.to_uppercase());
                }
                imkit_core::Flow::Continue(raw)
            });
        let realtime = Realtime::builder(config())
            .connector(Arc::new(MockServer::new()))
            .plugin(plugin)
            .build()
            .unwrap();
        let message = realtime
            .parse_message(json!({ "data": "quiet" }))
            .unwrap()
            .into_option()
            .unwrap();
        assert_eq!(message.payload().to_json_value(), json!("QUIET"));
    }
}

// ── Scripted Server Tests ─────────────────────────────────────────────────────

mod scripted {
    use super::*;

    #[tokio::test]
    async fn create_send_receipt_and_history() {
        let server = MockServer::new();
        server.auto_receipts(true);
        let (_realtime, alice) = connect_as(&server, "alice").await;

        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]).name("pair"))
            .await
            .unwrap();
        assert_eq!(conversation.members(), vec!["bob".to_string(), "alice".to_string()]);
        assert_eq!(conversation.kind(), ConversationKind::Conversation);
        assert_eq!(conversation.name().as_deref(), Some("pair"));

        let receipts = Recorder::new();
        let sink = receipts.clone();
        conversation.on(move |event| {
            if let ConversationEvent::Receipt { message } = event {
                sink.push(message.id().map(str::to_string));
            }
        });

        let mut hello = Message::text("hello");
        conversation
            .send(&mut hello, SendOptions::new().receipt(true))
            .await
            .unwrap();
        assert!(hello.id().is_some());
        assert!(hello.timestamp().is_some());
        eventually(|| hello.status() == MessageStatus::Delivered).await;
        eventually(|| receipts.len() == 1).await;
        assert_eq!(receipts.snapshot()[0].as_deref(), hello.id());
        assert_eq!(alice.awaiting_receipts(), 0);
        assert_eq!(
            conversation.last_message().and_then(|m| m.id().map(str::to_string)).as_deref(),
            hello.id()
        );
        assert!(conversation.last_delivered_at().is_some());

        let mut second = Message::text("second");
        let mut third = Message::text("third");
        conversation.send(&mut second, SendOptions::new()).await.unwrap();
        conversation.send(&mut third, SendOptions::new()).await.unwrap();

        let latest = conversation
            .query_messages(MessageQuery::new().limit(2))
            .await
            .unwrap();
        let ids: Vec<_> = latest.iter().map(|m| m.id().map(str::to_string)).collect();
        assert_eq!(
            ids,
            vec![second.id().map(str::to_string), third.id().map(str::to_string)]
        );

        let mut pages = conversation.create_messages_iterator(2).unwrap();
        assert_eq!(pages.next_page().await.unwrap().unwrap().len(), 2);
        let last_page = pages.next_page().await.unwrap().unwrap();
        assert_eq!(last_page.len(), 1);
        assert_eq!(last_page[0].id(), hello.id());
        assert!(pages.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_and_recall_by_pointer() {
        let server = MockServer::new();
        let (_realtime, alice) = connect_as(&server, "alice").await;
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        let mut original = Message::text("typo");
        conversation.send(&mut original, SendOptions::new()).await.unwrap();
        let pointer = MessagePointer::try_from(&original).unwrap();

        let updated = conversation
            .update(&pointer, Message::text("fixed"))
            .await
            .unwrap();
        assert_eq!(updated.id(), original.id());
        assert!(updated.updated_at().is_some());
        assert_eq!(
            conversation.last_message().unwrap().payload(),
            updated.payload()
        );

        let recalled = conversation.recall(&pointer).await.unwrap();
        assert!(recalled.is_recalled());
        assert!(conversation.last_message().unwrap().is_recalled());
        assert_eq!(recalled.id(), original.id());

        let history = conversation.query_messages(MessageQuery::new()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_recalled());
        assert_eq!(history[0].id(), original.id());

        let stale = MessagePointer::new(pointer.id.clone(), pointer.timestamp + chrono::Duration::seconds(1));
        let err = conversation.recall(&stale).await.unwrap_err();
        assert!(err.is(ErrorCode::ConversationUpdateFailed));
    }

    #[tokio::test]
    async fn incoming_messages_count_unread_and_read_resets() {
        let server = MockServer::new();
        server.seed_conversation(json!({ "objectId": "conv-x", "m": ["alice", "bob"] }));
        let (_realtime, alice) = connect_as(&server, "alice").await;

        let messages = Recorder::new();
        let sink = messages.clone();
        alice.on(move |event| {
            if let ClientEvent::Message { conversation, message } = event {
                sink.push((conversation.id().to_string(), message.clone()));
            }
        });

        let mut body = incoming("m-in-1", "bob", "conv-x", json!("hi @alice"));
        body["mentionList"] = json!(["alice"]);
        server.push_message("alice", body);
        eventually(|| messages.len() == 1).await;

        let (conversation_id, message) = messages.snapshot().remove(0);
        assert_eq!(conversation_id, "conv-x");
        assert!(alice.is_mentioned(&message));

        let conversation = alice.get_conversation("conv-x", false).await.unwrap();
        assert_eq!(conversation.unread_messages_count(), 1);
        assert!(conversation.unread_messages_mentioned());

        let acks = server.received(CommandType::Ack, None);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].body["id"], json!("m-in-1"));

        conversation.read().await.unwrap();
        assert_eq!(conversation.unread_messages_count(), 0);
        assert!(!conversation.unread_messages_mentioned());
        conversation.read().await.unwrap();
        assert_eq!(conversation.unread_messages_count(), 0);
        assert!(conversation.last_read_at() <= conversation.last_delivered_at());

        let reads = server.received(CommandType::Read, None);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].body["convs"][0]["mid"], json!("m-in-1"));
    }

    #[tokio::test]
    async fn loading_one_conversation_does_not_stall_others() {
        let server = MockServer::new();
        server.seed_conversation(json!({ "objectId": "conv-slow", "m": ["alice", "bob"] }));
        server.seed_conversation(json!({ "objectId": "conv-fast", "m": ["alice", "carol"] }));
        let (_realtime, alice) = connect_as(&server, "alice").await;
        alice.get_conversation("conv-fast", false).await.unwrap();

        let arrivals = Recorder::new();
        let sink = arrivals.clone();
        alice.on(move |event| {
            if let ClientEvent::Message { message, .. } = event {
                sink.push(message.id().map(str::to_string).unwrap_or_default());
            }
        });

        server.delay_queries(Some(Duration::from_millis(200)));
        server.push_message("alice", incoming("s1", "bob", "conv-slow", json!("one")));
        server.push_message("alice", incoming("f1", "carol", "conv-fast", json!("quick")));
        server.push_message("alice", incoming("s2", "bob", "conv-slow", json!("two")));

        eventually(|| arrivals.len() == 1).await;
        assert_eq!(arrivals.snapshot(), vec!["f1".to_string()]);

        eventually(|| arrivals.len() == 3).await;
        assert_eq!(
            arrivals.snapshot(),
            vec!["f1".to_string(), "s1".to_string(), "s2".to_string()]
        );
        let slow_lookups = server
            .received(CommandType::Conv, Some(Op::Query))
            .into_iter()
            .filter(|f| f.body["where"]["objectId"] == json!("conv-slow"))
            .count();
        assert_eq!(slow_lookups, 1);
        let slow = alice.get_conversation("conv-slow", false).await.unwrap();
        assert_eq!(slow.members(), vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn dispatch_gate_drops_event_but_still_acks() {
        let server = MockServer::new();
        server.seed_conversation(json!({ "objectId": "conv-x", "m": ["alice", "bob"] }));
        let realtime = Realtime::builder(config())
            .connector(Arc::new(server.clone()))
            .plugin(
                Plugin::new()
                    .name("no-spam")
                    .before_message_dispatch(|ctx| ctx.message.from() != Some("spammer")),
            )
            .build()
            .unwrap();
        let alice = realtime
            .create_im_client("alice", ClientOptions::new())
            .await
            .unwrap();

        let senders = Recorder::new();
        let sink = senders.clone();
        alice.on(move |event| {
            if let ClientEvent::Message { message, .. } = event {
                sink.push(message.from().map(str::to_string));
            }
        });

        server.push_message("alice", incoming("m-1", "spammer", "conv-x", json!("buy now")));
        server.push_message("alice", incoming("m-2", "bob", "conv-x", json!("hello")));
        eventually(|| senders.len() == 1).await;
        eventually(|| server.received(CommandType::Ack, None).len() == 2).await;

        assert_eq!(senders.snapshot(), vec![Some("bob".to_string())]);
        let conversation = alice.get_conversation("conv-x", false).await.unwrap();
        assert_eq!(conversation.unread_messages_count(), 1);
    }

    #[tokio::test]
    async fn custom_message_class_from_plugin() {
        let server = MockServer::new();
        server.seed_conversation(json!({ "objectId": "conv-x", "m": ["alice", "bob"] }));
        let realtime = Realtime::builder(config())
            .connector(Arc::new(server.clone()))
            .plugin(
                Plugin::new().message_classes([MessageClass::typed(7, "Location").fields(["lat", "lng"])]),
            )
            .build()
            .unwrap();
        let alice = realtime
            .create_im_client("alice", ClientOptions::new())
            .await
            .unwrap();

        let received = Recorder::new();
        let sink = received.clone();
        alice.on(move |event| {
            if let ClientEvent::Message { message, .. } = event {
                sink.push(message.clone());
            }
        });
        server.push_message(
            "alice",
            incoming(
                "m-loc",
                "bob",
                "conv-x",
                json!({ "type": 7, "text": "here", "lat": 31.2, "lng": 121.5 }),
            ),
        );
        eventually(|| received.len() == 1).await;

        let message = received.snapshot().remove(0);
        assert_eq!(message.kind(), Some(7));
        let typed = message.typed().unwrap();
        assert_eq!(typed.text(), Some("here"));
        assert_eq!(typed.field("lat"), Some(&json!(31.2)));
    }

    #[tokio::test]
    async fn concurrent_saves_run_in_order_and_keep_later_edits() {
        let server = MockServer::new();
        server.delay_updates(Duration::from_millis(100));
        let (_realtime, alice) = connect_as(&server, "alice").await;
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        conversation.set("topic", json!("first")).unwrap();
        let first = conversation.save();
        let second = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            conversation.set("topic", json!("second")).unwrap();
            conversation.save().await
        };
        let (a, b) = tokio::join!(first, second);
        a.unwrap();
        b.unwrap();

        let updates = server.received(CommandType::Conv, Some(Op::Update));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].body["attr"]["topic"], json!("first"));
        assert_eq!(updates[1].body["attr"]["topic"], json!("second"));
        assert_eq!(conversation.get("topic"), Some(json!("second")));
    }

    #[tokio::test]
    async fn concurrent_update_and_recall_apply_in_call_order() {
        let server = MockServer::new();
        let (_realtime, alice) = connect_as(&server, "alice").await;
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();
        let mut original = Message::text("typo");
        conversation.send(&mut original, SendOptions::new()).await.unwrap();
        let pointer = MessagePointer::try_from(&original).unwrap();

        // The edit is answered slowly, the recall quickly.
        server.delay_patches([Duration::from_millis(100), Duration::from_millis(5)]);
        let update = conversation.update(&pointer, Message::text("fixed"));
        let recall = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            conversation.recall(&pointer).await
        };
        let (updated, recalled) = tokio::join!(update, recall);
        assert!(!updated.unwrap().is_recalled());
        assert!(recalled.unwrap().is_recalled());

        let patches = server.received(CommandType::Patch, Some(Op::Modify));
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1].body["patches"][0]["recall"], json!(true));
        assert!(conversation.last_message().unwrap().is_recalled());
    }

    #[tokio::test]
    async fn conversation_query_sends_compiled_descriptor() {
        let server = MockServer::new();
        let (_realtime, alice) = connect_as(&server, "alice").await;
        alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        let found = alice
            .get_query()
            .with_members(["bob"], true)
            .descending("lastMessageAt")
            .limit(10)
            .find()
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let queries = server.received(CommandType::Conv, Some(Op::Query));
        let body = &queries.last().unwrap().body;
        assert_eq!(body["where"], json!({ "m": { "$all": ["bob", "alice"], "$size": 2 } }));
        assert_eq!(body["sort"], json!("-lm"));
        assert_eq!(body["limit"], json!(10));

        let err = alice.get_query().limit(0).find().await.unwrap_err();
        assert!(matches!(err, ImError::Validation(_)));
    }

    #[tokio::test]
    async fn cached_conversation_is_the_same_instance() {
        let server = MockServer::new();
        let (_realtime, alice) = connect_as(&server, "alice").await;
        let created = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();
        let fetched = alice.get_conversation(created.id(), true).await.unwrap();
        assert_eq!(created, fetched);

        let missing = alice.get_conversation("nope", false).await.unwrap_err();
        assert!(missing.is(ErrorCode::ConversationNotFound));
    }

    #[tokio::test]
    async fn ping_reports_online_ids() {
        let server = MockServer::new();
        let (_realtime, alice) = connect_as(&server, "alice").await;

        let too_many: Vec<String> = (0..21).map(|i| format!("user-{i}")).collect();
        assert!(matches!(
            alice.ping(too_many).await.unwrap_err(),
            ImError::Validation(_)
        ));
        assert!(alice.ping(Vec::<String>::new()).await.unwrap().is_empty());
        assert!(server.received(CommandType::Presence, Some(Op::Query)).is_empty());

        let online = alice.ping(["alice", "carol", "bob"]).await.unwrap();
        assert_eq!(online, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn membership_mute_and_counts() {
        let server = MockServer::new();
        let (_realtime, alice) = connect_as(&server, "alice").await;
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        conversation.add(["carol", "dave"]).await.unwrap();
        assert_eq!(conversation.members().len(), 4);
        conversation.remove(["dave"]).await.unwrap();
        assert!(!conversation.members().contains(&"dave".to_string()));
        assert_eq!(conversation.count().await.unwrap(), 3);

        conversation.mute().await.unwrap();
        assert!(conversation.muted());
        conversation.unmute().await.unwrap();
        assert!(!conversation.muted());

        let markers = conversation.fetch_receipt_timestamps().await.unwrap();
        assert!(markers.last_read_at <= markers.last_delivered_at);
        assert!(markers.last_delivered_at.is_some());
    }

    #[tokio::test]
    async fn service_and_chat_room_restrictions() {
        let server = MockServer::new();
        server.seed_conversation(json!({
            "objectId": "svc-1", "tr": true, "sys": true, "m": []
        }));
        let (_realtime, alice) = connect_as(&server, "alice").await;

        let service = alice.get_conversation("svc-1", false).await.unwrap();
        assert_eq!(service.kind(), ConversationKind::ServiceConversation);
        let err = service.add(["bob"]).await.unwrap_err();
        assert!(err.is(ErrorCode::ConversationNotAllowed));
        assert!(server.received(CommandType::Conv, Some(Op::Add)).is_empty());

        let room = alice.create_chat_room("lobby", Default::default()).await.unwrap();
        assert_eq!(room.kind(), ConversationKind::ChatRoom);
        assert!(room
            .fetch_receipt_timestamps()
            .await
            .unwrap_err()
            .is(ErrorCode::ConversationNotAllowed));

        let mut shout = Message::text("hi all");
        room.send(
            &mut shout,
            SendOptions::new().receipt(true).priority(MessagePriority::High),
        )
        .await
        .unwrap();
        let direct = server.received(CommandType::Direct, None);
        let body = &direct.last().unwrap().body;
        assert!(body.get("r").is_none());
        assert_eq!(body["level"], json!("high"));
    }

    #[tokio::test]
    async fn send_timeout_fails_message_and_resend_keeps_cid() {
        let server = MockServer::new();
        let realtime = Realtime::with_connector(
            config().send_timeout(Duration::from_millis(100)),
            Arc::new(server.clone()),
        )
        .unwrap();
        let alice = realtime
            .create_im_client("alice", ClientOptions::new())
            .await
            .unwrap();
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        server.hold_acks(true);
        let mut message = Message::text("lost");
        let err = conversation
            .send(&mut message, SendOptions::new())
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::SendMessageTimeout));
        assert_eq!(message.status(), MessageStatus::Failed);

        server.hold_acks(false);
        let mut retry = message.for_resend();
        conversation.send(&mut retry, SendOptions::new()).await.unwrap();
        assert_eq!(retry.cid(), message.cid());
        assert_eq!(retry.status(), MessageStatus::Sent);
        assert_eq!(message.status(), MessageStatus::Failed);
    }

    #[tokio::test]
    async fn close_fails_undrained_sends_and_ends_session() {
        let server = MockServer::new();
        let (_realtime, alice) = connect_as(&server, "alice").await;
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        let closes = Recorder::new();
        let sink = closes.clone();
        alice.on(move |event| {
            if let ClientEvent::Close { code, .. } = event {
                sink.push(*code);
            }
        });

        server.hold_acks(true);
        let in_flight = {
            let conversation = conversation.clone();
            tokio::spawn(async move {
                let mut message = Message::text("pending");
                let result = conversation.send(&mut message, SendOptions::new()).await;
                (message, result)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        alice.close().await.unwrap();

        let (message, result) = in_flight.await.unwrap();
        assert!(result.unwrap_err().is(ErrorCode::CloseNormal));
        assert_eq!(message.status(), MessageStatus::Failed);
        assert_eq!(closes.snapshot(), vec![ErrorCode::CloseNormal]);
        eventually(|| !server.received(CommandType::Session, Some(Op::Close)).is_empty()).await;

        let err = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::SessionRequired));
        assert!(conversation.count().await.unwrap_err().is(ErrorCode::SessionRequired));
    }

    #[tokio::test]
    async fn undecodable_reply_fails_its_request_at_once() {
        let server = MockServer::new();
        let (_realtime, alice) = connect_as(&server, "alice").await;
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        server.garble_counts(true);
        let err = tokio::time::timeout(Duration::from_millis(500), conversation.count())
            .await
            .expect("request should not wait for its timeout")
            .unwrap_err();
        assert!(err.is(ErrorCode::InternalError));

        server.garble_counts(false);
        assert_eq!(conversation.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unanswered_receipts_are_released_on_close() {
        let server = MockServer::new();
        let (_realtime, alice) = connect_as(&server, "alice").await;
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        for text in ["one", "two"] {
            let mut message = Message::text(text);
            conversation
                .send(&mut message, SendOptions::new().receipt(true))
                .await
                .unwrap();
        }
        let mut quiet = Message::text("no receipt wanted");
        conversation.send(&mut quiet, SendOptions::new()).await.unwrap();
        assert_eq!(alice.awaiting_receipts(), 2);

        alice.close().await.unwrap();
        assert_eq!(alice.awaiting_receipts(), 0);
    }

    #[tokio::test]
    async fn reconnect_replays_queued_requests() {
        let server = MockServer::new();
        let slow_backoff = config().reconnect(ReconnectConfig {
            intervals: vec![Duration::from_millis(150)],
            fallback: Duration::from_millis(150),
            max_attempts: 3,
        });
        let realtime = Realtime::with_connector(slow_backoff, Arc::new(server.clone())).unwrap();
        let alice = realtime
            .create_im_client("alice", ClientOptions::new())
            .await
            .unwrap();
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        let realtime_events = Recorder::new();
        let sink = realtime_events.clone();
        realtime.on(move |event| sink.push(event.clone()));
        let client_events = Recorder::new();
        let sink = client_events.clone();
        alice.on(move |event| match event {
            ClientEvent::Disconnect => sink.push("disconnect"),
            ClientEvent::Reconnect => sink.push("reconnect"),
            _ => {}
        });

        server.drop_connection();
        eventually(|| realtime.connection_state() == ConnectionState::Reconnecting).await;

        // Issued while the link is down: queued, then replayed on the new link.
        let queued = {
            let conversation = conversation.clone();
            tokio::spawn(async move { conversation.count().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.received(CommandType::Conv, Some(Op::Count)).is_empty());

        assert_eq!(queued.await.unwrap().unwrap(), 2);
        assert_eq!(server.received(CommandType::Conv, Some(Op::Count)).len(), 1);

        eventually(|| client_events.snapshot() == vec!["disconnect", "reconnect"]).await;
        assert_eq!(realtime.connection_state(), ConnectionState::Connected);
        let events = realtime_events.snapshot();
        assert_eq!(events[0], RealtimeEvent::Disconnect);
        assert!(events
            .iter()
            .any(|e| matches!(e, RealtimeEvent::Schedule { attempt: 0, .. })));
        assert!(events.contains(&RealtimeEvent::Retry { attempt: 0 }));
        assert!(events.contains(&RealtimeEvent::Reconnect));

        let opens = server.received(CommandType::Session, Some(Op::Open));
        assert_eq!(opens.len(), 2);
        assert!(opens[0].body.get("r").is_none());
        assert_eq!(opens[1].body["r"], json!(true));
        assert_eq!(opens[1].body["st"], json!("token-alice"));
    }

    #[tokio::test]
    async fn message_query_rejects_mixed_bounds() {
        let server = MockServer::new();
        let (_realtime, alice) = connect_as(&server, "alice").await;
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        let now = chrono::Utc::now();
        let err = conversation
            .query_messages(MessageQuery::new().before(now, None).start(now, None, false))
            .await
            .unwrap_err();
        assert!(matches!(err, ImError::Validation(_)));
        assert!(server.received(CommandType::Logs, None).is_empty());
    }

    #[tokio::test]
    async fn offline_after_exhausted_attempts_then_retry() {
        let server = MockServer::new();
        let (realtime, alice) = connect_as(&server, "alice").await;
        let conversation = alice
            .create_conversation(ConversationOptions::new().members(["bob"]))
            .await
            .unwrap();

        let gave_up = Recorder::new();
        let sink = gave_up.clone();
        realtime.on(move |event| {
            if let RealtimeEvent::ReconnectError { code } = event {
                sink.push(*code);
            }
        });

        server.refuse_connections(true);
        server.drop_connection();
        eventually(|| realtime.connection_state() == ConnectionState::Offline).await;
        assert_eq!(gave_up.snapshot(), vec![ErrorCode::CloseAbnormal]);
        assert!(conversation
            .count()
            .await
            .unwrap_err()
            .is(ErrorCode::CloseAbnormal));

        server.refuse_connections(false);
        realtime.retry().await.unwrap();
        assert_eq!(realtime.connection_state(), ConnectionState::Connected);
        assert_eq!(conversation.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn session_conflict_closes_client() {
        let server = MockServer::new();
        let (realtime, alice) = connect_as(&server, "alice").await;

        let events = Recorder::new();
        let sink = events.clone();
        alice.on(move |event| match event {
            ClientEvent::Conflict { reason } => sink.push(format!("conflict:{}", reason.clone().unwrap_or_default())),
            ClientEvent::Close { code, .. } => sink.push(format!("close:{}", code.as_u16())),
            _ => {}
        });

        server.push(Frame::new(
            CommandType::Session,
            Some(Op::Closed),
            Some("alice"),
            json!({ "code": 4111, "reason": "signed in elsewhere" }),
        ));
        eventually(|| events.len() == 2).await;
        assert_eq!(
            events.snapshot(),
            vec!["conflict:signed in elsewhere".to_string(), "close:4111".to_string()]
        );
        assert!(!alice.is_open());
        assert!(alice
            .create_conversation(ConversationOptions::new())
            .await
            .unwrap_err()
            .is(ErrorCode::SessionRequired));

        // The id is free again: a new session can be opened.
        let again = realtime
            .create_im_client("alice", ClientOptions::new())
            .await
            .unwrap();
        assert!(again.is_open());
    }

    #[tokio::test]
    async fn membership_pushes_update_conversation() {
        let server = MockServer::new();
        server.seed_conversation(json!({ "objectId": "conv-x", "m": ["alice", "bob"] }));
        let (_realtime, alice) = connect_as(&server, "alice").await;
        let conversation = alice.get_conversation("conv-x", false).await.unwrap();

        let kicked = Recorder::new();
        let sink = kicked.clone();
        alice.on(move |event| {
            if let ClientEvent::Kicked { kicked_by, .. } = event {
                sink.push(kicked_by.clone());
            }
        });

        server.push(Frame::new(
            CommandType::Conv,
            Some(Op::MembersJoined),
            Some("alice"),
            json!({ "cid": "conv-x", "m": ["carol"], "initBy": "bob" }),
        ));
        eventually(|| conversation.members().contains(&"carol".to_string())).await;

        server.push(Frame::new(
            CommandType::Conv,
            Some(Op::Updated),
            Some("alice"),
            json!({ "cid": "conv-x", "attr": { "name": "renamed" }, "initBy": "bob" }),
        ));
        eventually(|| conversation.name().as_deref() == Some("renamed")).await;

        server.push(Frame::new(
            CommandType::Conv,
            Some(Op::Left),
            Some("alice"),
            json!({ "cid": "conv-x", "initBy": "bob" }),
        ));
        eventually(|| kicked.len() == 1).await;
        assert_eq!(kicked.snapshot(), vec![Some("bob".to_string())]);
        assert!(!conversation.members().contains(&"alice".to_string()));
    }

    #[tokio::test]
    async fn create_im_client_reuses_open_identity() {
        let server = MockServer::new();
        let (realtime, alice) = connect_as(&server, "alice").await;
        let again = realtime
            .create_im_client("alice", ClientOptions::new())
            .await
            .unwrap();
        assert_eq!(again.id(), alice.id());
        assert_eq!(server.received(CommandType::Session, Some(Op::Open)).len(), 1);

        let err = realtime
            .create_im_client("", ClientOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImError::Validation(_)));
    }
}
