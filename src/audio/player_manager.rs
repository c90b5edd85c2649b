//! Bring-up and teardown of guild players.
//!
//! A player exists only once its voice link is ready and a node was
//! picked for it. Every failed step undoes the earlier ones so the maps
//! look exactly like they did before `create`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::player::{Player, PlayerSettings};
use crate::audio::voice::{VoiceChannelOptions, VoiceConnection, VoiceGateway};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, ManagerEvent};
use crate::node::pool::NodeSelector;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub voice_timeout: Duration,
    pub player: PlayerSettings,
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            voice_timeout: config.voice_timeout,
            player: PlayerSettings {
                default_volume: config.default_volume,
                max_history: config.max_history,
            },
        }
    }
}

pub struct PlayerManager {
    selector: Arc<dyn NodeSelector>,
    gateway: Arc<dyn VoiceGateway>,
    voices: DashMap<String, Arc<VoiceConnection>>,
    players: DashMap<String, Arc<Player>>,
    settings: ManagerSettings,
    events: EventBus,
}

impl PlayerManager {
    pub fn new(
        selector: Arc<dyn NodeSelector>,
        gateway: Arc<dyn VoiceGateway>,
        settings: ManagerSettings,
        events: EventBus,
    ) -> Self {
        Self {
            selector,
            gateway,
            voices: DashMap::new(),
            players: DashMap::new(),
            settings,
            events,
        }
    }

    /// Joins the voice channel, picks a node and binds a player to it.
    pub async fn create(&self, options: VoiceChannelOptions) -> Result<Arc<Player>> {
        let guild_id = options.guild_id.clone();

        let voice = match self.voices.entry(guild_id.clone()) {
            Entry::Occupied(_) => return Err(Error::AlreadyConnected(guild_id)),
            Entry::Vacant(slot) => {
                let voice = Arc::new(VoiceConnection::new(
                    options,
                    Arc::clone(&self.gateway),
                    self.settings.voice_timeout,
                ));
                slot.insert(Arc::clone(&voice));
                voice
            }
        };

        if let Err(e) = voice.connect().await {
            warn!(guild = %guild_id, "voice connect failed: {e}");
            self.forget_voice(&voice);
            return Err(e);
        }

        let Some(node) = self.selector.least_used_node().await else {
            warn!(guild = %guild_id, "no node available");
            self.rollback(&voice).await;
            return Err(Error::NoAvailableNode);
        };

        let player = Arc::new(Player::new(
            Arc::clone(&node),
            Arc::clone(&voice),
            &self.settings.player,
            self.events.clone(),
        ));

        let ready = voice.subscribe();
        if let Err(e) = player.send_server_update().await {
            warn!(guild = %guild_id, node = %node.name(), "failed to hand voice credentials to node: {e}");
            drop(ready);
            self.rollback(&voice).await;
            return Err(e);
        }
        player.watch_voice(ready);

        self.players.insert(guild_id.clone(), Arc::clone(&player));
        info!(guild = %guild_id, node = %node.name(), "✅ player created");
        self.events.emit(ManagerEvent::PlayerCreate {
            guild_id,
            node: node.name().to_string(),
        });

        Ok(player)
    }

    /// Destroys the guild's player. Unknown guilds are ignored.
    pub async fn destroy(&self, guild_id: &str) {
        let Some((_, player)) = self.players.remove(guild_id) else {
            debug!(guild = %guild_id, "no player to destroy");
            return;
        };

        player.destroy().await;
        self.forget_voice(player.voice());
    }

    pub fn get(&self, guild_id: &str) -> Option<Arc<Player>> {
        self.players.get(guild_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn all(&self) -> Vec<Arc<Player>> {
        self.players.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Players currently bound to the named node.
    pub fn players_on(&self, node: &str) -> Vec<Arc<Player>> {
        self.players
            .iter()
            .filter(|entry| entry.node().name() == node)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Feeds our own voice state packet to the guild's voice link.
    pub fn handle_voice_state_update(&self, guild_id: &str, session_id: Option<String>, channel_id: Option<String>) {
        match self.voice(guild_id) {
            Some(voice) => voice.handle_state_update(session_id, channel_id),
            None => debug!(guild = %guild_id, "voice state for unknown guild"),
        }
    }

    /// Feeds a voice server packet to the guild's voice link.
    pub fn handle_voice_server_update(&self, guild_id: &str, token: String, endpoint: Option<String>) {
        match self.voice(guild_id) {
            Some(voice) => voice.handle_server_update(token, endpoint),
            None => debug!(guild = %guild_id, "voice server for unknown guild"),
        }
    }

    fn voice(&self, guild_id: &str) -> Option<Arc<VoiceConnection>> {
        self.voices.get(guild_id).map(|entry| Arc::clone(entry.value()))
    }

    async fn rollback(&self, voice: &Arc<VoiceConnection>) {
        voice.disconnect().await;
        self.forget_voice(voice);
    }

    /// Removes the registration only if it still is this connection.
    fn forget_voice(&self, voice: &Arc<VoiceConnection>) {
        self.voices
            .remove_if(voice.guild_id(), |_, registered| Arc::ptr_eq(registered, voice));
    }
}
