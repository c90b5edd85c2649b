//! Backend nodes: connection lifecycle, REST access and selection.

pub mod driver;
pub mod pool;
pub mod rest;
pub mod session;
pub mod stats;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{Config, NodeOptions};
use crate::error::Result;
use crate::events::{EventBus, ManagerEvent};
use crate::model::{PlayerUpdateFrame, ReadyFrame};

use driver::{Driver, TransportEvent, TransportEvents};
use rest::Rest;
use session::SessionStore;
use stats::{NodeStats, StatsFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Closed,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Closed => "closed",
            NodeState::Connecting => "connecting",
            NodeState::Connected => "connected",
            NodeState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Client-wide settings every node shares.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub user_id: String,
    pub client_name: String,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub resume: bool,
    /// Seconds
    pub resume_timeout: u64,
}

impl From<&Config> for NodeSettings {
    fn from(config: &Config) -> Self {
        Self {
            user_id: config.user_id.clone(),
            client_name: config.client_name.clone(),
            retry_count: config.retry_count,
            retry_delay: config.retry_delay,
            resume: config.resume,
            resume_timeout: config.resume_timeout,
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: NodeState,
    session_id: Option<String>,
    online: bool,
    retry_counter: u32,
    sudo_disconnect: bool,
    /// Bumped for every transport so events of a retired one are dropped
    generation: u64,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: NodeState::Closed,
            session_id: None,
            online: false,
            retry_counter: 0,
            sudo_disconnect: false,
            generation: 0,
        }
    }
}

/// One backend server.
///
/// The node owns its driver and drives the connection state machine;
/// everything it learns is published on the shared [`EventBus`].
pub struct Node {
    options: NodeOptions,
    settings: NodeSettings,
    driver: Arc<dyn Driver>,
    events: EventBus,
    sessions: Option<Arc<dyn SessionStore>>,
    lifecycle: RwLock<Lifecycle>,
    stats: RwLock<NodeStats>,
}

impl Node {
    /// Builds a node with the driver its options ask for.
    pub fn new(options: NodeOptions, settings: NodeSettings, events: EventBus) -> Result<Self> {
        let driver = options.driver.build(&options, &settings)?;
        Ok(Self::with_driver(options, settings, events, driver))
    }

    pub fn with_driver(
        options: NodeOptions,
        settings: NodeSettings,
        events: EventBus,
        driver: Arc<dyn Driver>,
    ) -> Self {
        Self {
            options,
            settings,
            driver,
            events,
            sessions: None,
            lifecycle: RwLock::new(Lifecycle::default()),
            stats: RwLock::new(NodeStats::default()),
        }
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn state(&self) -> NodeState {
        self.lifecycle.read().state
    }

    pub fn is_online(&self) -> bool {
        self.lifecycle.read().online
    }

    pub fn session_id(&self) -> Option<String> {
        self.lifecycle.read().session_id.clone()
    }

    pub fn retry_counter(&self) -> u32 {
        self.lifecycle.read().retry_counter
    }

    pub fn stats(&self) -> NodeStats {
        self.stats.read().clone()
    }

    /// Session-bound REST view of this node.
    pub fn rest(&self) -> Rest<'_> {
        Rest::new(self)
    }

    /// Opens a new transport. No-op while a connection is already up or
    /// being established.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let (generation, previous_session) = {
            let mut lifecycle = self.lifecycle.write();
            if matches!(lifecycle.state, NodeState::Connecting | NodeState::Connected) {
                debug!(node = %self.name(), state = %lifecycle.state, "connect ignored");
                return Ok(());
            }
            lifecycle.state = NodeState::Connecting;
            lifecycle.generation += 1;
            (lifecycle.generation, lifecycle.session_id.take())
        };

        let resume = if self.settings.resume {
            previous_session.or_else(|| self.sessions.as_ref().and_then(|s| s.get(&self.options.host)))
        } else {
            None
        };

        info!(
            node = %self.name(),
            url = %self.driver.ws_url(),
            resume = resume.is_some(),
            "connecting"
        );

        match self.driver.connect(resume).await {
            Ok(transport) => {
                self.spawn_pump(generation, transport);
                Ok(())
            }
            Err(e) => {
                error!(node = %self.name(), "failed to open transport: {e}");
                self.clean(false);
                Err(e)
            }
        }
    }

    /// Resets to a clean state and connects again.
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        let was_active = {
            let mut lifecycle = self.lifecycle.write();
            lifecycle.generation += 1;
            matches!(lifecycle.state, NodeState::Connecting | NodeState::Connected)
        };
        if was_active {
            self.driver.ws_close().await;
        }
        self.clean(false);
        self.connect().await
    }

    /// Closes the transport without triggering the retry policy.
    pub async fn disconnect(&self) {
        {
            let mut lifecycle = self.lifecycle.write();
            if lifecycle.state == NodeState::Closed {
                debug!(node = %self.name(), "disconnect ignored, node is closed");
                return;
            }
            lifecycle.sudo_disconnect = true;
        }
        info!(node = %self.name(), "disconnecting");
        self.driver.ws_close().await;
    }

    fn clean(&self, online: bool) {
        let mut lifecycle = self.lifecycle.write();
        lifecycle.sudo_disconnect = false;
        lifecycle.retry_counter = 0;
        lifecycle.online = online;
        lifecycle.state = NodeState::Closed;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lifecycle.read().generation == generation
    }

    fn spawn_pump(self: &Arc<Self>, generation: u64, transport: TransportEvents) {
        let node = Arc::clone(self);
        let pump: BoxFuture<'static, ()> = Box::pin(node.pump(generation, transport));
        tokio::spawn(pump);
    }

    async fn pump(self: Arc<Self>, generation: u64, mut transport: TransportEvents) {
        while let Some(event) = transport.recv().await {
            if !self.is_current(generation) {
                debug!(node = %self.name(), "dropping events of a retired transport");
                return;
            }

            match event {
                TransportEvent::Open => self.handle_open(),
                TransportEvent::Message(text) => self.handle_message(&text).await,
                TransportEvent::Error(e) => self.handle_error(e),
                TransportEvent::Close { code, reason } => {
                    self.handle_close(code, reason).await;
                    return;
                }
            }
        }
        debug!(node = %self.name(), "transport channel dropped");
    }

    /// A pending operator disconnect survives the open and is consumed by
    /// the next close.
    pub(crate) fn handle_open(&self) {
        {
            let mut lifecycle = self.lifecycle.write();
            lifecycle.retry_counter = 0;
            lifecycle.online = true;
            lifecycle.state = NodeState::Connected;
        }
        info!(node = %self.name(), "connected");
        self.events.emit(ManagerEvent::NodeConnect {
            node: self.name().to_string(),
        });
    }

    pub(crate) async fn handle_message(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node = %self.name(), "dropping malformed frame: {e}");
                return;
            }
        };

        let op = frame.get("op").and_then(Value::as_str).unwrap_or_default().to_string();
        match op.as_str() {
            "ready" => match serde_json::from_value::<ReadyFrame>(frame) {
                Ok(ready) => self.handle_ready(ready).await,
                Err(e) => warn!(node = %self.name(), "invalid ready frame: {e}"),
            },
            "stats" => match serde_json::from_value::<StatsFrame>(frame) {
                Ok(stats) => self.stats.write().merge(stats),
                Err(e) => warn!(node = %self.name(), "invalid stats frame: {e}"),
            },
            "playerUpdate" => match serde_json::from_value::<PlayerUpdateFrame>(frame) {
                Ok(update) => self.events.emit(ManagerEvent::PlayerUpdate {
                    node: self.name().to_string(),
                    guild_id: update.guild_id,
                    state: update.state,
                }),
                Err(e) => warn!(node = %self.name(), "invalid playerUpdate frame: {e}"),
            },
            "event" => match frame.get("guildId").and_then(Value::as_str) {
                Some(guild_id) => {
                    let guild_id = guild_id.to_string();
                    debug!(node = %self.name(), guild = %guild_id, kind = ?frame.get("type"), "player event");
                    self.events.emit(ManagerEvent::PlayerEvent {
                        node: self.name().to_string(),
                        guild_id,
                        payload: frame,
                    });
                }
                None => warn!(node = %self.name(), "event frame without guildId"),
            },
            other => debug!(node = %self.name(), op = other, "ignoring unknown op"),
        }
    }

    async fn handle_ready(&self, ready: ReadyFrame) {
        self.lifecycle.write().session_id = Some(ready.session_id.clone());
        info!(
            node = %self.name(),
            session = %ready.session_id,
            resumed = ready.resumed,
            "ready"
        );

        if self.settings.resume {
            if let Err(e) = self.rest().update_session(true, self.settings.resume_timeout).await {
                warn!(node = %self.name(), "failed to enable session resuming: {e}");
                self.events.emit(ManagerEvent::NodeError {
                    node: self.name().to_string(),
                    error: e.to_string(),
                });
            }
            if let Some(store) = &self.sessions {
                store.delete(&self.options.host);
                store.set(&self.options.host, &ready.session_id);
            }
        }

        self.events.emit(ManagerEvent::NodeReady {
            node: self.name().to_string(),
            session_id: ready.session_id,
            resumed: ready.resumed,
        });
    }

    pub(crate) fn handle_error(&self, error: String) {
        warn!(node = %self.name(), "transport error: {error}");
        self.events.emit(ManagerEvent::NodeError {
            node: self.name().to_string(),
            error,
        });
    }

    pub(crate) async fn handle_close(self: &Arc<Self>, code: u16, reason: String) {
        let (retry, attempt) = {
            let mut lifecycle = self.lifecycle.write();
            lifecycle.online = false;
            lifecycle.state = NodeState::Disconnected;
            let retry = !lifecycle.sudo_disconnect && lifecycle.retry_counter < self.settings.retry_count;
            (retry, lifecycle.retry_counter + 1)
        };

        warn!(node = %self.name(), code, reason = %reason, "disconnected");
        self.events.emit(ManagerEvent::NodeDisconnect {
            node: self.name().to_string(),
            code,
            reason,
        });

        if !retry {
            self.node_closed();
            return;
        }

        info!(
            node = %self.name(),
            attempt,
            max = self.settings.retry_count,
            "reconnecting in {}",
            humantime::format_duration(self.settings.retry_delay)
        );
        tokio::time::sleep(self.settings.retry_delay).await;

        {
            let mut lifecycle = self.lifecycle.write();
            lifecycle.retry_counter += 1;
            lifecycle.online = false;
            lifecycle.state = NodeState::Closed;
        }

        if let Err(e) = self.connect().await {
            self.handle_error(e.to_string());
            self.node_closed();
        }
    }

    fn node_closed(&self) {
        info!(node = %self.name(), "closed");
        self.clean(false);
        self.events.emit(ManagerEvent::NodeClosed {
            node: self.name().to_string(),
        });
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("options", &self.options)
            .field("lifecycle", &*self.lifecycle.read())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::PlayerState;
    use super::driver::{DriverKind, MockDriver, RestRequest, RestResponse};
    use super::session::MemorySessionStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::{broadcast, mpsc};

    pub(crate) fn mock_driver() -> MockDriver {
        let mut driver = MockDriver::new();
        driver.expect_kind().return_const(DriverKind::Lavalink4);
        driver
            .expect_ws_url()
            .return_const("ws://localhost:2333/v4/websocket".to_string());
        driver
    }

    pub(crate) fn settings() -> NodeSettings {
        NodeSettings {
            user_id: "1".into(),
            retry_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    pub(crate) fn node_named(name: &str, driver: MockDriver, events: EventBus) -> Arc<Node> {
        let options = NodeOptions::new(name, "localhost", 2333, "youshallnotpass");
        Arc::new(Node::with_driver(options, settings(), events, Arc::new(driver)))
    }

    pub(crate) fn node_with(driver: MockDriver) -> Arc<Node> {
        node_named("main", driver, EventBus::new())
    }

    pub(crate) async fn ready(node: &Node, session_id: &str) {
        let frame = json!({ "op": "ready", "resumed": false, "sessionId": session_id });
        node.handle_message(&frame.to_string()).await;
    }

    fn idle_transport() -> Result<TransportEvents> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(rx)
    }

    fn drain(rx: &mut broadcast::Receiver<ManagerEvent>) -> Vec<ManagerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn open_marks_online_and_resets_retries() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let node = node_named("main", mock_driver(), events);
        node.lifecycle.write().retry_counter = 3;

        node.handle_open();

        assert_eq!(node.state(), NodeState::Connected);
        assert!(node.is_online());
        assert_eq!(node.retry_counter(), 0);
        assert_eq!(drain(&mut rx), vec![ManagerEvent::NodeConnect { node: "main".into() }]);
    }

    #[tokio::test]
    async fn ready_assigns_session() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let node = node_named("main", mock_driver(), events);

        ready(&node, "abc").await;

        assert_eq!(node.session_id().as_deref(), Some("abc"));
        assert_eq!(
            drain(&mut rx),
            vec![ManagerEvent::NodeReady {
                node: "main".into(),
                session_id: "abc".into(),
                resumed: false,
            }]
        );
    }

    #[tokio::test]
    async fn ready_enables_resuming_and_persists_session() {
        let mut driver = mock_driver();
        driver
            .expect_fetch()
            .withf(|req: &RestRequest| {
                req.method == reqwest::Method::PATCH
                    && req.path == "/sessions/new"
                    && req.body == Some(json!({ "resuming": true, "timeout": 60 }))
            })
            .times(1)
            .returning(|_| Ok(RestResponse { status: 204, body: String::new() }));

        let store = Arc::new(MemorySessionStore::new());
        store.set("localhost", "old");

        let mut settings = settings();
        settings.resume = true;
        settings.resume_timeout = 60;
        let options = NodeOptions::new("main", "localhost", 2333, "pw");
        let node = Node::with_driver(options, settings, EventBus::new(), Arc::new(driver))
            .with_session_store(store.clone());

        ready(&node, "new").await;

        assert_eq!(store.get("localhost").as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn stats_are_merged_and_updates_forwarded() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let node = node_named("main", mock_driver(), events);

        node.handle_message(r#"{"op":"stats","players":3,"cpu":{"cores":4}}"#).await;
        node.handle_message(r#"{"op":"stats","playingPlayers":1}"#).await;
        node.handle_message(r#"{"op":"playerUpdate","guildId":"42","state":{"time":1,"position":500,"connected":true,"ping":20}}"#)
            .await;
        node.handle_message(r#"{"op":"event","type":"TrackStartEvent","guildId":"42"}"#).await;

        let stats = node.stats();
        assert_eq!(stats.players, 3);
        assert_eq!(stats.playing_players, 1);
        assert_eq!(stats.cpu.cores, 4);

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            ManagerEvent::PlayerUpdate {
                node: "main".into(),
                guild_id: "42".into(),
                state: PlayerState { time: 1, position: 500, connected: true, ping: 20 },
            }
        );
        assert!(matches!(
            &events[1],
            ManagerEvent::PlayerEvent { guild_id, payload, .. }
                if guild_id == "42" && payload["type"] == "TrackStartEvent"
        ));
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let node = node_named("main", mock_driver(), events);

        node.handle_message("not json").await;
        node.handle_message(r#"{"op":"ready"}"#).await;
        node.handle_message(r#"{"op":"somethingNew"}"#).await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(node.session_id(), None);
    }

    #[tokio::test]
    async fn operator_disconnect_skips_retry() {
        let mut driver = mock_driver();
        driver.expect_ws_close().times(1).return_const(());
        driver.expect_connect().never();

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let node = node_named("main", driver, events);
        node.handle_open();

        node.disconnect().await;
        node.handle_close(1000, "bye".into()).await;

        assert_eq!(node.state(), NodeState::Closed);
        assert!(!node.is_online());
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&ManagerEvent::NodeClosed { node: "main".into() }));
    }

    #[tokio::test]
    async fn retries_until_budget_is_exhausted() {
        let mut driver = mock_driver();
        driver
            .expect_connect()
            .withf(|resume: &Option<String>| resume.is_none())
            .times(2)
            .returning(|_| idle_transport());

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let options = NodeOptions::new("main", "localhost", 2333, "pw");
        let mut settings = settings();
        settings.retry_count = 2;
        let node = Arc::new(Node::with_driver(options, settings, events, Arc::new(driver)));

        node.handle_close(1006, "gone".into()).await;
        assert_eq!(node.retry_counter(), 1);
        assert_eq!(node.state(), NodeState::Connecting);

        node.handle_close(1006, "gone".into()).await;
        assert_eq!(node.retry_counter(), 2);

        node.handle_close(1006, "gone".into()).await;
        assert_eq!(node.state(), NodeState::Closed);
        assert_eq!(node.retry_counter(), 0);

        let closed = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ManagerEvent::NodeClosed { .. }))
            .count();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn disconnect_while_connecting_is_honored_after_open() {
        let mut driver = mock_driver();
        driver.expect_connect().times(1).returning(|_| idle_transport());
        driver.expect_ws_close().times(1).return_const(());

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let node = node_named("main", driver, events);

        node.connect().await.unwrap();
        node.disconnect().await;
        node.handle_open();
        node.handle_close(1000, "bye".into()).await;

        assert_eq!(node.state(), NodeState::Closed);
        assert_eq!(node.retry_counter(), 0);
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&ManagerEvent::NodeClosed { node: "main".into() }));
    }

    #[tokio::test]
    async fn disconnect_on_closed_node_does_not_linger() {
        let mut driver = mock_driver();
        driver.expect_ws_close().never();
        driver.expect_connect().times(2).returning(|_| idle_transport());
        let node = node_with(driver);

        node.disconnect().await;
        node.connect().await.unwrap();
        node.handle_open();
        node.handle_close(1006, "gone".into()).await;

        assert_eq!(node.state(), NodeState::Connecting);
        assert_eq!(node.retry_counter(), 1);
    }

    #[tokio::test]
    async fn reconnect_resets_and_retires_the_old_transport() {
        let (old_tx, old_transport) = mpsc::unbounded_channel();
        let old_transport = parking_lot::Mutex::new(Some(old_transport));

        let mut driver = mock_driver();
        driver.expect_connect().times(2).returning(move |_| match old_transport.lock().take() {
            Some(transport) => Ok(transport),
            None => idle_transport(),
        });
        driver.expect_ws_close().times(1).return_const(());

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let node = node_named("main", driver, events);

        node.connect().await.unwrap();
        node.handle_open();
        ready(&node, "s1").await;
        node.lifecycle.write().retry_counter = 2;
        drain(&mut rx);

        node.reconnect().await.unwrap();

        assert_eq!(node.state(), NodeState::Connecting);
        assert_eq!(node.retry_counter(), 0);
        assert_eq!(node.session_id(), None);
        assert!(!node.is_online());

        old_tx.send(TransportEvent::Close { code: 1006, reason: "late".into() }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(node.state(), NodeState::Connecting);
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ManagerEvent::NodeDisconnect { .. } | ManagerEvent::NodeClosed { .. })));
    }

    #[tokio::test]
    async fn transport_error_is_reported_without_state_change() {
        let (tx, transport) = mpsc::unbounded_channel();
        let transport = parking_lot::Mutex::new(Some(transport));

        let mut driver = mock_driver();
        driver
            .expect_connect()
            .times(1)
            .returning(move |_| Ok(transport.lock().take().unwrap()));

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let node = node_named("main", driver, events);

        node.connect().await.unwrap();
        tx.send(TransportEvent::Open).unwrap();
        tx.send(TransportEvent::Error("tls reset".into())).unwrap();

        let mut error = None;
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            if let ManagerEvent::NodeError { error: e, .. } = event {
                error = Some(e);
                break;
            }
        }

        assert_eq!(error.as_deref(), Some("tls reset"));
        assert_eq!(node.state(), NodeState::Connected);
        assert!(node.is_online());
    }

    #[tokio::test]
    async fn connect_offers_previous_session_when_resuming() {
        let mut driver = mock_driver();
        driver.expect_fetch().returning(|_| Ok(RestResponse { status: 204, body: String::new() }));
        driver
            .expect_connect()
            .withf(|resume: &Option<String>| resume.as_deref() == Some("s1"))
            .times(1)
            .returning(|_| idle_transport());

        let options = NodeOptions::new("main", "localhost", 2333, "pw");
        let mut settings = settings();
        settings.resume = true;
        let node = Arc::new(Node::with_driver(options, settings, EventBus::new(), Arc::new(driver)));
        ready(&node, "s1").await;

        node.connect().await.unwrap();

        assert_eq!(node.state(), NodeState::Connecting);
        assert_eq!(node.session_id(), None);
    }

    #[tokio::test]
    async fn connect_uses_persisted_session() {
        let mut driver = mock_driver();
        driver
            .expect_connect()
            .withf(|resume: &Option<String>| resume.as_deref() == Some("stored"))
            .times(1)
            .returning(|_| idle_transport());

        let store = Arc::new(MemorySessionStore::new());
        store.set("localhost", "stored");
        let options = NodeOptions::new("main", "localhost", 2333, "pw");
        let mut settings = settings();
        settings.resume = true;
        let node = Arc::new(
            Node::with_driver(options, settings, EventBus::new(), Arc::new(driver)).with_session_store(store),
        );

        node.connect().await.unwrap();
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_connecting() {
        let mut driver = mock_driver();
        driver.expect_connect().times(1).returning(|_| idle_transport());
        let node = node_with(driver);

        node.connect().await.unwrap();
        node.connect().await.unwrap();
        assert_eq!(node.state(), NodeState::Connecting);
    }

    #[tokio::test]
    async fn pump_drives_the_lifecycle() {
        let (tx, transport) = mpsc::unbounded_channel();
        let transport = parking_lot::Mutex::new(Some(transport));

        let mut driver = mock_driver();
        driver
            .expect_connect()
            .times(1)
            .returning(move |_| Ok(transport.lock().take().unwrap()));

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let options = NodeOptions::new("main", "localhost", 2333, "pw");
        let mut settings = settings();
        settings.retry_count = 0;
        let node = Arc::new(Node::with_driver(options, settings, events, Arc::new(driver)));

        node.connect().await.unwrap();
        tx.send(TransportEvent::Open).unwrap();
        tx.send(TransportEvent::Message(r#"{"op":"ready","sessionId":"s1"}"#.into())).unwrap();
        tx.send(TransportEvent::Close { code: 4000, reason: "restart".into() }).unwrap();

        let mut seen = Vec::new();
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            let done = matches!(event, ManagerEvent::NodeClosed { .. });
            seen.push(event);
            if done {
                break;
            }
        }

        assert_eq!(
            seen,
            vec![
                ManagerEvent::NodeConnect { node: "main".into() },
                ManagerEvent::NodeReady { node: "main".into(), session_id: "s1".into(), resumed: false },
                ManagerEvent::NodeDisconnect { node: "main".into(), code: 4000, reason: "restart".into() },
                ManagerEvent::NodeClosed { node: "main".into() },
            ]
        );
        assert_eq!(node.state(), NodeState::Closed);
    }
}
