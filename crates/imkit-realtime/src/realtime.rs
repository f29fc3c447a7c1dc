use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tracing::{debug, trace, warn};

use imkit_core::platform::{self, TaskHandle};
use imkit_core::{ErrorCode, EventEmitter, Flow, ImError, ImResult, ListenerId, RealtimeConfig};
use imkit_message::{Message, MessageClass, MessageParser, MessageRegistry};

use crate::client::{ClientInner, IMClient};
use crate::plugin::{Plugin, PluginHooks};
use crate::protocol::{self, CommandType, Frame, SerialCounter};
use crate::transport::{Connection, Connector, TransportEvent, WsConnector};
use crate::types::{ClientEvent, ClientOptions, ConnectionState, RealtimeEvent};

// ── Link ──────────────────────────────────────────────────────────────────────

struct PendingRequest {
    frame: Frame,
    reply: oneshot::Sender<ImResult<Frame>>,
    /// Replayed on the next link when the current one drops.
    replay: bool,
}

/// The current connection plus every request still waiting for a reply.
#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    pending: HashMap<u64, PendingRequest>,
    /// Identifies the newest connection; events from older ones are ignored.
    generation: u64,
    reconnecting: bool,
    tasks: Vec<TaskHandle>,
}

impl Link {
    fn take_pending(&mut self, matches: impl Fn(&PendingRequest) -> bool) -> Vec<PendingRequest> {
        let serials: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| matches(p))
            .map(|(serial, _)| *serial)
            .collect();
        serials
            .into_iter()
            .filter_map(|serial| self.pending.remove(&serial))
            .collect()
    }
}

fn fail_all(pending: Vec<PendingRequest>, code: ErrorCode, detail: &str) {
    for request in pending {
        let _ = request.reply.send(Err(ImError::code(code, detail)));
    }
}

struct ClientSlot {
    pushes: mpsc::UnboundedSender<Frame>,
    client: Weak<ClientInner>,
}

// ── Realtime ──────────────────────────────────────────────────────────────────

struct RealtimeInner {
    config: RealtimeConfig,
    endpoint: String,
    connector: Arc<dyn Connector>,
    serial: SerialCounter,
    registry: RwLock<Arc<MessageRegistry>>,
    hooks: RwLock<Arc<PluginHooks>>,
    events: EventEmitter<RealtimeEvent>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
    clients: Mutex<HashMap<String, ClientSlot>>,
    connect_lock: tokio::sync::Mutex<()>,
    retry_now: Notify,
    shutdown_tx: broadcast::Sender<()>,
}

/// Process-wide entry point: one shared connection, the message-class
/// registry and the plugin hooks, multiplexed by any number of `IMClient`s.
///
/// Wraps `Arc<Inner>`, so it is cheap to clone and `Send + Sync`.
#[derive(Clone)]
pub struct Realtime {
    inner: Arc<RealtimeInner>,
}

/// Builder for [`Realtime`].
pub struct RealtimeBuilder {
    config: RealtimeConfig,
    connector: Option<Arc<dyn Connector>>,
    plugins: Vec<Plugin>,
}

impl RealtimeBuilder {
    pub fn plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn plugins<I>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = Plugin>,
    {
        self.plugins.extend(plugins);
        self
    }

    /// Replace the WebSocket transport.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> ImResult<Realtime> {
        self.config.validate()?;
        let endpoint = self.config.endpoint()?;

        let mut registry = MessageRegistry::new();
        let mut hooks = PluginHooks::default();
        for plugin in &self.plugins {
            for class in plugin.classes() {
                registry.register(class.clone())?;
            }
            hooks.extend(plugin);
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let (state, _) = watch::channel(ConnectionState::Idle);
        let realtime = Realtime {
            inner: Arc::new(RealtimeInner {
                config: self.config,
                endpoint,
                connector: self.connector.unwrap_or_else(|| Arc::new(WsConnector)),
                serial: SerialCounter::new(),
                registry: RwLock::new(Arc::new(registry)),
                hooks: RwLock::new(Arc::new(hooks)),
                events: EventEmitter::new(),
                state,
                link: Mutex::new(Link::default()),
                clients: Mutex::new(HashMap::new()),
                connect_lock: tokio::sync::Mutex::new(()),
                retry_now: Notify::new(),
                shutdown_tx,
            }),
        };
        debug!(
            app_id = %realtime.inner.config.app_id,
            plugins = self.plugins.len(),
            "Realtime created"
        );
        realtime.hooks().on_realtime_create.apply(&realtime);
        Ok(realtime)
    }
}

impl Realtime {
    pub fn builder(config: RealtimeConfig) -> RealtimeBuilder {
        RealtimeBuilder {
            config,
            connector: None,
            plugins: Vec::new(),
        }
    }

    /// A `Realtime` over the native WebSocket transport. Connects lazily.
    pub fn new(config: RealtimeConfig) -> ImResult<Self> {
        Self::builder(config).build()
    }

    pub fn with_connector(config: RealtimeConfig, connector: Arc<dyn Connector>) -> ImResult<Self> {
        Self::builder(config).connector(connector).build()
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn on<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(callback)
    }

    pub fn once<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        self.inner.events.once(callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    // ── Registries ────────────────────────────────────────────────────────────

    /// Register message classes. All or nothing: a conflicting class leaves
    /// the registry unchanged.
    pub fn register<I>(&self, classes: I) -> ImResult<()>
    where
        I: IntoIterator<Item = MessageClass>,
    {
        let mut registry = self.inner.registry.write();
        let mut next = MessageRegistry::clone(&registry);
        for class in classes {
            next.register(class)?;
        }
        *registry = Arc::new(next);
        Ok(())
    }

    /// Add a plugin after construction. Its `on_realtime_create` hook does
    /// not run, since this instance already exists.
    pub fn register_plugin(&self, plugin: Plugin) -> ImResult<()> {
        self.register(plugin.classes().iter().cloned())?;
        let mut hooks = self.inner.hooks.write();
        let mut next = PluginHooks::clone(&hooks);
        next.extend(&plugin);
        *hooks = Arc::new(next);
        debug!(plugin = ?plugin.plugin_name(), "Plugin registered");
        Ok(())
    }

    pub(crate) fn hooks(&self) -> Arc<PluginHooks> {
        Arc::clone(&self.inner.hooks.read())
    }

    pub fn registry(&self) -> Arc<MessageRegistry> {
        Arc::clone(&self.inner.registry.read())
    }

    /// Parse an inbound envelope through the registered classes and the
    /// plugin parse hooks.
    pub fn parse_message(&self, raw: Value) -> ImResult<Flow<Message>> {
        let registry = self.registry();
        let hooks = self.hooks();
        MessageParser::new(&registry)
            .with_hooks(&hooks.before_message_parse, &hooks.after_message_parse)
            .parse(raw)
    }

    // ── Clients ───────────────────────────────────────────────────────────────

    /// Open a session for `id` over the shared connection, connecting first
    /// if needed. An open client with the same id is returned as is.
    pub async fn create_im_client(
        &self,
        id: impl Into<String>,
        options: ClientOptions,
    ) -> ImResult<IMClient> {
        let id = id.into();
        if id.is_empty() || id.chars().count() > 64 {
            return Err(ImError::validation("client id must be 1..=64 characters"));
        }
        if let Some(existing) = self.client(&id) {
            return Ok(existing);
        }

        self.ensure_connected().await?;

        let (pushes, push_rx) = mpsc::unbounded_channel();
        let client = IMClient::new(id.clone(), options, self.clone(), push_rx);
        self.inner.clients.lock().insert(
            id.clone(),
            ClientSlot {
                pushes,
                client: client.downgrade(),
            },
        );
        if let Err(e) = client.open_session(None).await {
            self.detach_client(&id);
            client.abort_dispatcher();
            return Err(e);
        }
        debug!(client_id = %id, "IMClient created");
        self.hooks().on_imclient_create.apply(&client);
        Ok(client)
    }

    fn client(&self, id: &str) -> Option<IMClient> {
        self.inner
            .clients
            .lock()
            .get(id)
            .and_then(|slot| slot.client.upgrade())
            .map(IMClient::from_inner)
    }

    fn live_clients(&self) -> Vec<IMClient> {
        self.inner
            .clients
            .lock()
            .values()
            .filter_map(|slot| slot.client.upgrade())
            .map(IMClient::from_inner)
            .collect()
    }

    pub(crate) fn detach_client(&self, id: &str) {
        self.inner.clients.lock().remove(id);
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Send a request and wait for the reply carrying its serial.
    ///
    /// While the connection is down the request stays queued and is replayed
    /// after reconnection.
    pub(crate) async fn request(&self, frame: Frame, timeout: Duration) -> ImResult<Frame> {
        match self.connection_state() {
            ConnectionState::Closed => {
                return Err(ImError::code(ErrorCode::CloseNormal, "realtime is closed"))
            }
            ConnectionState::Offline => {
                return Err(ImError::code(ErrorCode::CloseAbnormal, "connection is offline"))
            }
            ConnectionState::Idle => self.ensure_connected().await?,
            _ => {}
        }
        let (serial, reply) = self.enqueue(frame, None);
        self.await_reply(serial, reply, timeout).await
    }

    /// Send a request on a specific link. Not replayed if that link drops.
    pub(crate) async fn request_on(
        &self,
        via: &mpsc::UnboundedSender<Frame>,
        frame: Frame,
        timeout: Duration,
    ) -> ImResult<Frame> {
        let (serial, reply) = self.enqueue(frame, Some(via));
        self.await_reply(serial, reply, timeout).await
    }

    fn enqueue(
        &self,
        mut frame: Frame,
        via: Option<&mpsc::UnboundedSender<Frame>>,
    ) -> (u64, oneshot::Receiver<ImResult<Frame>>) {
        let serial = self.inner.serial.next();
        frame.serial = Some(serial);
        let (reply_tx, reply_rx) = oneshot::channel();

        let mut link = self.inner.link.lock();
        let outbound = via.cloned().or_else(|| link.outbound.clone());
        link.pending.insert(
            serial,
            PendingRequest {
                frame: frame.clone(),
                reply: reply_tx,
                replay: via.is_none(),
            },
        );
        match outbound {
            Some(outbound) => {
                trace!(cmd = %frame.cmd, serial, "Sending request");
                if outbound.send(frame).is_err() {
                    trace!(serial, "Link closed; request stays queued");
                }
            }
            None => trace!(cmd = %frame.cmd, serial, "Queued request until reconnect"),
        }
        (serial, reply_rx)
    }

    async fn await_reply(
        &self,
        serial: u64,
        reply: oneshot::Receiver<ImResult<Frame>>,
        timeout: Duration,
    ) -> ImResult<Frame> {
        match platform::timeout(timeout, reply).await {
            Ok(Ok(result)) => result.and_then(Frame::into_result),
            Ok(Err(_)) => Err(ImError::code(ErrorCode::CloseAbnormal, "request dropped")),
            Err(e) => {
                self.inner.link.lock().pending.remove(&serial);
                debug!(serial, "Request timed out");
                Err(e)
            }
        }
    }

    /// Fire and forget. Dropped silently while disconnected.
    pub(crate) fn send_oneway(&self, frame: Frame) {
        let link = self.inner.link.lock();
        match &link.outbound {
            Some(outbound) => {
                trace!(cmd = %frame.cmd, "Sending frame");
                let _ = outbound.send(frame);
            }
            None => trace!(cmd = %frame.cmd, "Dropped frame while disconnected"),
        }
    }

    /// Fail pending requests, optionally only those of one client.
    pub(crate) fn fail_pending(&self, peer_id: Option<&str>, code: ErrorCode) {
        let failed = self.inner.link.lock().take_pending(|p| match peer_id {
            Some(peer) => p.frame.peer_id.as_deref() == Some(peer),
            None => true,
        });
        if !failed.is_empty() {
            debug!(count = failed.len(), %code, "Failing pending requests");
        }
        fail_all(failed, code, "session closed");
    }

    /// Fail the request an undecodable reply was meant for.
    fn reject_malformed(&self, serial: Option<u64>, reason: &str) {
        let Some(serial) = serial else {
            return;
        };
        let pending = self.inner.link.lock().pending.remove(&serial);
        if let Some(request) = pending {
            debug!(serial, %reason, "Reply could not be decoded");
            let _ = request.reply.send(Err(ImError::code(
                ErrorCode::InternalError,
                format!("malformed reply: {reason}"),
            )));
        }
    }

    fn route(&self, frame: Frame) {
        if let Some(serial) = frame.serial {
            let pending = self.inner.link.lock().pending.remove(&serial);
            match pending {
                Some(request) => {
                    let _ = request.reply.send(Ok(frame));
                }
                None => trace!(serial, "Reply for unknown or expired request"),
            }
            return;
        }
        if frame.cmd == CommandType::Echo {
            return;
        }
        let Some(peer_id) = frame.peer_id.clone() else {
            warn!(cmd = %frame.cmd, "Push without peerId");
            return;
        };
        let pushes = self
            .inner
            .clients
            .lock()
            .get(&peer_id)
            .map(|slot| slot.pushes.clone());
        match pushes {
            Some(pushes) => {
                let _ = pushes.send(frame);
            }
            None => debug!(client_id = %peer_id, cmd = %frame.cmd, "Push for unknown client"),
        }
    }

    // ── Connection ────────────────────────────────────────────────────────────

    pub(crate) async fn ensure_connected(&self) -> ImResult<()> {
        let _guard = self.inner.connect_lock.lock().await;
        match self.connection_state() {
            ConnectionState::Connected | ConnectionState::Reconnecting => return Ok(()),
            ConnectionState::Closed => {
                return Err(ImError::code(ErrorCode::CloseNormal, "realtime is closed"))
            }
            ConnectionState::Offline => {
                return Err(ImError::code(ErrorCode::CloseAbnormal, "connection is offline"))
            }
            ConnectionState::Idle | ConnectionState::Connecting => {}
        }
        self.inner.state.send_replace(ConnectionState::Connecting);
        let opened = match self.open_link().await {
            Ok((generation, outbound)) => self.install(generation, outbound),
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            warn!(error = %e, "Connect failed");
            self.inner.state.send_replace(ConnectionState::Idle);
            return Err(e);
        }
        debug!(endpoint = %self.inner.endpoint, "Connected");
        Ok(())
    }

    async fn open_link(&self) -> ImResult<(u64, mpsc::UnboundedSender<Frame>)> {
        let Connection { outbound, inbound } =
            self.inner.connector.connect(&self.inner.endpoint).await?;
        let generation = {
            let mut link = self.inner.link.lock();
            link.generation += 1;
            link.tasks.retain(|task| !task.is_finished());
            link.generation
        };
        let reader = self.spawn_reader(generation, inbound);
        let heartbeat = self.spawn_heartbeat(generation);
        self.inner.link.lock().tasks.extend([reader, heartbeat]);
        Ok((generation, outbound))
    }

    /// Make a freshly opened link current and replay queued requests on it,
    /// in serial order.
    fn install(&self, generation: u64, outbound: mpsc::UnboundedSender<Frame>) -> ImResult<()> {
        {
            let mut link = self.inner.link.lock();
            if link.generation != generation || outbound.is_closed() {
                return Err(ImError::code(
                    ErrorCode::CloseAbnormal,
                    "connection lost while opening",
                ));
            }
            let mut replay: Vec<&PendingRequest> =
                link.pending.values().filter(|p| p.replay).collect();
            replay.sort_by_key(|p| p.frame.serial);
            if !replay.is_empty() {
                debug!(count = replay.len(), "Replaying queued requests");
            }
            for request in replay {
                let _ = outbound.send(request.frame.clone());
            }
            link.outbound = Some(outbound);
            link.reconnecting = false;
        }
        self.inner.state.send_replace(ConnectionState::Connected);
        Ok(())
    }

    fn spawn_reader(
        &self,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> TaskHandle {
        let realtime = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        platform::spawn("imkit-reader", async move {
            loop {
                tokio::select! {
                    event = inbound.recv() => match event {
                        Some(TransportEvent::Frame(frame)) => realtime.route(frame),
                        Some(TransportEvent::Malformed { serial, reason }) => {
                            realtime.reject_malformed(serial, &reason)
                        }
                        Some(TransportEvent::Closed { code, reason }) => {
                            debug!(?code, %reason, generation, "Connection closed");
                            break;
                        }
                        None => break,
                    },
                    _ = shutdown_rx.recv() => {
                        debug!("Reader task shutting down");
                        return;
                    }
                }
            }
            realtime.connection_lost(generation);
        })
    }

    fn spawn_heartbeat(&self, generation: u64) -> TaskHandle {
        let realtime = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let heartbeat_interval = self.inner.config.heartbeat_interval;
        platform::spawn("imkit-heartbeat", async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            // Skip the first immediate tick
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let sent = {
                            let link = realtime.inner.link.lock();
                            if link.generation != generation {
                                break;
                            }
                            link.outbound
                                .as_ref()
                                .map(|outbound| outbound.send(protocol::build_echo()).is_ok())
                        };
                        match sent {
                            Some(true) => trace!("Heartbeat sent"),
                            Some(false) => {
                                warn!("Heartbeat send failed");
                                realtime.connection_lost(generation);
                                break;
                            }
                            None => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Heartbeat task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn connection_lost(&self, generation: u64) {
        let start_loop = {
            let mut link = self.inner.link.lock();
            if link.generation != generation {
                return;
            }
            // Requests bound to this link cannot be answered any more.
            let orphaned = link.take_pending(|p| !p.replay);
            fail_all(orphaned, ErrorCode::CloseAbnormal, "connection lost");

            let was_connected = link.outbound.take().is_some();
            if !was_connected || self.connection_state() == ConnectionState::Closed {
                return;
            }
            let start = !link.reconnecting;
            link.reconnecting = true;
            start
        };

        warn!(generation, "Connection lost");
        self.inner.state.send_replace(ConnectionState::Reconnecting);
        self.inner.events.emit(&RealtimeEvent::Disconnect);
        for client in self.live_clients() {
            client.emit(ClientEvent::Disconnect);
        }
        if start_loop {
            self.spawn_reconnect_loop();
        }
    }

    fn spawn_reconnect_loop(&self) {
        let realtime = self.clone();
        let task = platform::spawn("imkit-reconnect", async move {
            realtime.reconnect_loop().await;
        });
        self.inner.link.lock().tasks.push(task);
    }

    async fn reconnect_loop(&self) {
        let reconnect = self.inner.config.reconnect.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut attempt: u32 = 0;
        loop {
            if attempt >= reconnect.max_attempts {
                self.go_offline();
                return;
            }
            let delay = reconnect.delay_for(attempt);
            debug!(attempt, ?delay, "Scheduling reconnect");
            self.inner
                .events
                .emit(&RealtimeEvent::Schedule { attempt, delay });
            tokio::select! {
                _ = platform::sleep(delay) => {}
                _ = self.inner.retry_now.notified() => debug!("Reconnect requested"),
                _ = shutdown_rx.recv() => return,
            }
            if self.connection_state() == ConnectionState::Closed {
                return;
            }

            self.inner.events.emit(&RealtimeEvent::Retry { attempt });
            match self.reconnect_once().await {
                Ok(()) => {
                    debug!(attempt, "Reconnected");
                    self.inner.events.emit(&RealtimeEvent::Reconnect);
                    for client in self.live_clients() {
                        client.emit(ClientEvent::Reconnect);
                    }
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
    }

    /// Open a new link, re-open every live session on it, then install it.
    async fn reconnect_once(&self) -> ImResult<()> {
        let (generation, outbound) = self.open_link().await?;
        for client in self.live_clients() {
            client.reopen(&outbound).await?;
        }
        self.install(generation, outbound)
    }

    fn go_offline(&self) {
        let pending = {
            let mut link = self.inner.link.lock();
            link.reconnecting = false;
            link.take_pending(|_| true)
        };
        warn!(count = pending.len(), "Reconnection attempts exhausted");
        fail_all(pending, ErrorCode::CloseAbnormal, "reconnection attempts exhausted");
        self.inner.state.send_replace(ConnectionState::Offline);
        self.inner.events.emit(&RealtimeEvent::ReconnectError {
            code: ErrorCode::CloseAbnormal,
        });
    }

    /// Reconnect now instead of waiting for the backoff timer.
    ///
    /// Resolves once the connection is up again. A no-op when already
    /// connected.
    pub async fn retry(&self) -> ImResult<()> {
        match self.connection_state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => {
                Err(ImError::code(ErrorCode::CloseNormal, "realtime is closed"))
            }
            ConnectionState::Idle | ConnectionState::Connecting => self.ensure_connected().await,
            ConnectionState::Reconnecting | ConnectionState::Offline => {
                let mut state_rx = self.inner.state.subscribe();
                let start_loop = {
                    let mut link = self.inner.link.lock();
                    let start = !link.reconnecting;
                    link.reconnecting = true;
                    start
                };
                if start_loop {
                    self.inner.state.send_replace(ConnectionState::Reconnecting);
                    self.spawn_reconnect_loop();
                }
                self.inner.retry_now.notify_one();

                let settled = state_rx
                    .wait_for(|state| {
                        matches!(
                            state,
                            ConnectionState::Connected
                                | ConnectionState::Offline
                                | ConnectionState::Closed
                        )
                    })
                    .await
                    .map(|state| *state);
                match settled {
                    Ok(ConnectionState::Connected) => Ok(()),
                    Ok(ConnectionState::Offline) => Err(ImError::code(
                        ErrorCode::CloseAbnormal,
                        "reconnection attempts exhausted",
                    )),
                    _ => Err(ImError::code(ErrorCode::CloseNormal, "realtime is closed")),
                }
            }
        }
    }

    /// Close every client, then the connection. Terminal.
    pub async fn close(&self) -> ImResult<()> {
        if self.connection_state() == ConnectionState::Closed {
            return Ok(());
        }
        debug!("Closing realtime");
        for client in self.live_clients() {
            if let Err(e) = client.close().await {
                warn!(client_id = %client.id(), error = %e, "Client close failed");
            }
        }
        self.inner.state.send_replace(ConnectionState::Closed);
        let _ = self.inner.shutdown_tx.send(());
        let (pending, tasks) = {
            let mut link = self.inner.link.lock();
            link.outbound = None;
            link.reconnecting = false;
            (link.take_pending(|_| true), std::mem::take(&mut link.tasks))
        };
        fail_all(pending, ErrorCode::CloseNormal, "realtime closed");
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Realtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realtime")
            .field("app_id", &self.inner.config.app_id)
            .field("state", &self.connection_state())
            .finish()
    }
}
