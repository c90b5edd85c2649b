use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::audio::player::Player;
use crate::audio::player_manager::{ManagerSettings, PlayerManager};
use crate::audio::voice::{VoiceChannelOptions, VoiceGateway};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, ManagerEvent};
use crate::model::LoadResult;
use crate::node::pool::{NodePool, NodeSelector};
use crate::node::session::{MemorySessionStore, SessionStore};
use crate::node::{Node, NodeSettings};

/// Entry point for applications: nodes, players and events in one place.
pub struct LavalinkClient {
    config: Config,
    nodes: Arc<NodePool>,
    players: Arc<PlayerManager>,
    events: EventBus,
    router: JoinHandle<()>,
}

impl LavalinkClient {
    /// Registers every configured node. Nothing is connected yet.
    pub fn new(config: Config, gateway: Arc<dyn VoiceGateway>) -> Result<Self> {
        let events = EventBus::with_capacity(config.event_capacity);
        let mut pool = NodePool::new(NodeSettings::from(&config), events.clone());
        if config.persist_sessions {
            let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
            pool = pool.with_session_store(store);
        }
        for options in &config.nodes {
            pool.add(options.clone())?;
        }

        Ok(Self::with_pool(config, Arc::new(pool), gateway, events))
    }

    /// Builds the client around an existing pool, which must publish on
    /// `events`.
    pub fn with_pool(config: Config, nodes: Arc<NodePool>, gateway: Arc<dyn VoiceGateway>, events: EventBus) -> Self {
        let selector: Arc<dyn NodeSelector> = nodes.clone();
        let players = Arc::new(PlayerManager::new(
            selector,
            gateway,
            ManagerSettings::from(&config),
            events.clone(),
        ));
        let router = tokio::spawn(route(events.subscribe(), Arc::clone(&players)));

        Self {
            config,
            nodes,
            players,
            events,
            router,
        }
    }

    pub async fn connect(&self) {
        info!("🔌 connecting {} node(s)", self.nodes.len());
        self.nodes.connect_all().await;
    }

    pub fn nodes(&self) -> &Arc<NodePool> {
        &self.nodes
    }

    pub fn players(&self) -> &Arc<PlayerManager> {
        &self.players
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub async fn create_player(&self, options: VoiceChannelOptions) -> Result<Arc<Player>> {
        self.players.create(options).await
    }

    pub async fn destroy_player(&self, guild_id: &str) {
        self.players.destroy(guild_id).await;
    }

    /// Resolves a URL as is, anything else through the default search
    /// source. `node` picks a specific node, otherwise the least used one.
    pub async fn search(&self, query: &str, node: Option<&str>) -> Result<LoadResult> {
        let node = self.search_node(node).await?;
        let identifier = self.identifier(query);

        debug!(node = %node.name(), identifier = %identifier, "🔍 resolving");
        let result = node.rest().resolve(&identifier).await?;
        if result.is_empty() {
            warn!("no results for {identifier}");
        }
        Ok(result)
    }

    async fn search_node(&self, name: Option<&str>) -> Result<Arc<Node>> {
        match name {
            Some(name) => self
                .nodes
                .get(name)
                .ok_or_else(|| Error::NodeNotFound(name.to_string())),
            None => self
                .nodes
                .least_used_node()
                .await
                .ok_or(Error::NoAvailableNode),
        }
    }

    fn identifier(&self, query: &str) -> String {
        let is_url = Url::parse(query)
            .map(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or(false);
        if is_url {
            query.to_string()
        } else {
            format!("{}:{}", self.config.default_search, query)
        }
    }

    /// Destroys every player and disconnects every node.
    pub async fn shutdown(&self) {
        for player in self.players.all() {
            self.players.destroy(player.guild_id()).await;
        }
        self.nodes.disconnect_all().await;
        info!("👋 client shut down");
    }
}

impl Drop for LavalinkClient {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// Applies node traffic to the players it concerns.
async fn route(mut events: broadcast::Receiver<ManagerEvent>, players: Arc<PlayerManager>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event router lagged behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            ManagerEvent::PlayerUpdate { guild_id, state, .. } => {
                if let Some(player) = players.get(&guild_id) {
                    player.apply_state(state);
                }
            }
            ManagerEvent::PlayerEvent { guild_id, payload, .. } => {
                if let Some(player) = players.get(&guild_id) {
                    player.apply_event(&payload);
                }
            }
            // A fresh session knows nothing about our players.
            ManagerEvent::NodeReady {
                node, resumed: false, ..
            } => {
                for player in players.players_on(&node) {
                    if let Err(e) = player.send_server_update().await {
                        warn!(guild = %player.guild_id(), node = %node, "failed to restore player: {e}");
                    }
                }
            }
            _ => {}
        }
    }
}
