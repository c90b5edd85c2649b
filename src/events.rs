//! Lifecycle notifications fanned out to the host application.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::model::PlayerState;

const DEFAULT_CAPACITY: usize = 256;

/// Everything observable about nodes, players and queues.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    NodeConnect {
        node: String,
    },
    /// The backend assigned (or resumed) a session
    NodeReady {
        node: String,
        session_id: String,
        resumed: bool,
    },
    NodeDisconnect {
        node: String,
        code: u16,
        reason: String,
    },
    NodeError {
        node: String,
        error: String,
    },
    /// Retry budget exhausted or operator disconnect, the node stays down
    NodeClosed {
        node: String,
    },
    /// Raw `event` frame for a guild, forwarded unchanged
    PlayerEvent {
        node: String,
        guild_id: String,
        payload: Value,
    },
    PlayerUpdate {
        node: String,
        guild_id: String,
        state: PlayerState,
    },
    PlayerCreate {
        guild_id: String,
        node: String,
    },
    PlayerDestroy {
        guild_id: String,
    },
    QueueUpdate {
        guild_id: String,
        size: usize,
        total_size: usize,
    },
}

/// Cheap-to-clone broadcast handle.
///
/// Emitting never fails: with no live subscriber the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ManagerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: ManagerEvent) {
        trace!(?event, "emit");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
