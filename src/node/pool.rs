use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::NodeOptions;
use crate::error::Result;
use crate::events::EventBus;
use crate::node::session::SessionStore;
use crate::node::{Node, NodeSettings};

/// Picks the node that should serve a new player.
#[async_trait]
pub trait NodeSelector: Send + Sync {
    async fn least_used_node(&self) -> Option<Arc<Node>>;
}

/// All registered nodes, keyed by name.
pub struct NodePool {
    nodes: DashMap<String, Arc<Node>>,
    settings: NodeSettings,
    events: EventBus,
    sessions: Option<Arc<dyn SessionStore>>,
}

impl NodePool {
    pub fn new(settings: NodeSettings, events: EventBus) -> Self {
        Self {
            nodes: DashMap::new(),
            settings,
            events,
            sessions: None,
        }
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    /// Builds and registers a node. A name that is already taken keeps
    /// its existing node.
    pub fn add(&self, options: NodeOptions) -> Result<Arc<Node>> {
        if let Some(existing) = self.get(&options.name) {
            warn!(node = %options.name, "node already registered");
            return Ok(existing);
        }

        let mut node = Node::new(options, self.settings.clone(), self.events.clone())?;
        if let Some(store) = &self.sessions {
            node = node.with_session_store(Arc::clone(store));
        }

        let node = Arc::new(node);
        self.insert(Arc::clone(&node));
        Ok(node)
    }

    /// Registers a node built elsewhere (custom driver), replacing any
    /// node with the same name.
    pub fn insert(&self, node: Arc<Node>) {
        info!(node = %node.name(), url = %node.driver().ws_url(), "node registered");
        self.nodes.insert(node.name().to_string(), node);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Disconnects and forgets a node.
    pub async fn remove(&self, name: &str) -> Option<Arc<Node>> {
        let (_, node) = self.nodes.remove(name)?;
        node.disconnect().await;
        Some(node)
    }

    pub fn all(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn online(&self) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|entry| entry.is_online())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub async fn connect_all(&self) {
        let nodes = self.all();
        let results = join_all(nodes.iter().map(|node| node.connect())).await;
        for (node, result) in nodes.iter().zip(results) {
            if let Err(e) = result {
                warn!(node = %node.name(), "connect failed: {e}");
            }
        }
    }

    pub async fn disconnect_all(&self) {
        let nodes = self.all();
        join_all(nodes.iter().map(|node| node.disconnect())).await;
    }
}

#[async_trait]
impl NodeSelector for NodePool {
    /// Online node with the lowest load penalty, ties broken by player count.
    async fn least_used_node(&self) -> Option<Arc<Node>> {
        self.online().into_iter().min_by_key(|node| {
            let stats = node.stats();
            (stats.penalty(), stats.players)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{mock_driver, settings};
    use pretty_assertions::assert_eq;

    fn pool_with(names: &[&str]) -> NodePool {
        let pool = NodePool::new(settings(), EventBus::new());
        for name in names {
            let options = NodeOptions::new(*name, "localhost", 2333, "pw");
            let node = Node::with_driver(options, settings(), EventBus::new(), Arc::new(mock_driver()));
            pool.insert(Arc::new(node));
        }
        pool
    }

    #[tokio::test]
    async fn offline_nodes_are_never_selected() {
        let pool = pool_with(&["a", "b"]);
        assert!(pool.least_used_node().await.is_none());

        pool.get("b").unwrap().handle_open();
        assert_eq!(pool.least_used_node().await.unwrap().name(), "b");
    }

    #[tokio::test]
    async fn least_loaded_node_wins() {
        let pool = pool_with(&["busy", "idle"]);
        for name in ["busy", "idle"] {
            pool.get(name).unwrap().handle_open();
        }

        pool.get("busy")
            .unwrap()
            .handle_message(r#"{"op":"stats","players":9,"playingPlayers":9,"cpu":{"systemLoad":0.7}}"#)
            .await;
        pool.get("idle")
            .unwrap()
            .handle_message(r#"{"op":"stats","players":1,"playingPlayers":1,"cpu":{"systemLoad":0.1}}"#)
            .await;

        assert_eq!(pool.least_used_node().await.unwrap().name(), "idle");
    }

    #[test]
    fn add_keeps_existing_node() {
        let pool = NodePool::new(settings(), EventBus::new());
        let first = pool.add(NodeOptions::new("main", "localhost", 2333, "pw")).unwrap();
        let second = pool.add(NodeOptions::new("main", "elsewhere", 2333, "pw")).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get("main").unwrap().options().host, "localhost");
    }
}
