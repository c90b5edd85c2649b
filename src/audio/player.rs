use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::queue::Queue;
use crate::audio::voice::VoiceConnection;
use crate::error::{Error, Result};
use crate::events::{EventBus, ManagerEvent};
use crate::model::{PlayerState, Track, TrackEventKind, UpdatePlayer, UpdatePlayerTrack, VoiceCredentials};
use crate::node::Node;

const MAX_VOLUME: u16 = 1000;

/// Playback state as last known on this side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackState {
    pub playing: bool,
    pub paused: bool,
    pub volume: u16,
    /// Milliseconds
    pub position: u64,
    pub connected: bool,
    pub ping: i64,
}

/// Settings the manager applies to every new player.
#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub default_volume: u16,
    pub max_history: usize,
}

/// Stable handle for one guild's playback, whatever node serves it.
pub struct Player {
    guild_id: String,
    node: Arc<Node>,
    voice: Arc<VoiceConnection>,
    queue: Mutex<Queue>,
    state: RwLock<PlaybackState>,
    events: EventBus,
    voice_watch: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    pub fn new(node: Arc<Node>, voice: Arc<VoiceConnection>, settings: &PlayerSettings, events: EventBus) -> Self {
        let guild_id = voice.guild_id().to_string();
        Self {
            queue: Mutex::new(Queue::new(guild_id.clone(), settings.max_history, events.clone())),
            state: RwLock::new(PlaybackState {
                volume: settings.default_volume,
                ..Default::default()
            }),
            guild_id,
            node,
            voice,
            events,
            voice_watch: Mutex::new(None),
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn voice(&self) -> &Arc<VoiceConnection> {
        &self.voice
    }

    pub fn state(&self) -> PlaybackState {
        self.state.read().clone()
    }

    /// Locks the queue. Do not hold the guard across an `.await`.
    pub fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock()
    }

    /// Pushes the current voice credentials to the node.
    pub async fn send_server_update(&self) -> Result<()> {
        let Some(voice) = self.voice.credentials() else {
            debug!(guild = %self.guild_id, "no voice credentials to send yet");
            return Ok(());
        };

        debug!(guild = %self.guild_id, node = %self.node.name(), endpoint = %voice.endpoint, "sending voice credentials");
        self.update(UpdatePlayer {
            voice: Some(voice),
            ..Default::default()
        })
        .await
    }

    /// Re-sends credentials every time `ready` reports the voice link
    /// ready again. Subscribe before the first submit so nothing is missed.
    pub(crate) fn watch_voice(self: &Arc<Self>, mut ready: broadcast::Receiver<VoiceCredentials>) {
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                match ready.recv().await {
                    Ok(_) => {
                        let Some(player) = weak.upgrade() else { break };
                        if let Err(e) = player.send_server_update().await {
                            warn!(guild = %player.guild_id, "failed to resend voice credentials: {e}");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "voice ready notifications lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.voice_watch.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Plays the queue's current track, promoting the next one if nothing
    /// is current yet. Returns the track that started.
    pub async fn play(&self) -> Result<Option<Track>> {
        let track = {
            let mut queue = self.queue.lock();
            match queue.current().cloned() {
                Some(track) => Some(track),
                None => queue.advance(),
            }
        };

        match track {
            Some(track) => {
                self.play_track(&track).await?;
                Ok(Some(track))
            }
            None => {
                debug!(guild = %self.guild_id, "nothing to play");
                Ok(None)
            }
        }
    }

    /// Skips to the next queued track, or stops when the queue ran out.
    pub async fn skip(&self) -> Result<Option<Track>> {
        let next = self.queue.lock().advance();
        match &next {
            Some(track) => self.play_track(track).await?,
            None => self.stop().await?,
        }
        Ok(next)
    }

    async fn play_track(&self, track: &Track) -> Result<()> {
        if !track.is_playable() {
            return Err(Error::InvalidTrackType(track.info.identifier.clone()));
        }

        let volume = self.state.read().volume;
        self.update(UpdatePlayer {
            track: Some(UpdatePlayerTrack::encoded(track.encoded.clone())),
            volume: Some(volume),
            paused: Some(false),
            ..Default::default()
        })
        .await?;

        {
            let mut state = self.state.write();
            state.playing = true;
            state.paused = false;
            state.position = 0;
        }
        info!(guild = %self.guild_id, title = %track.title(), "🎵 playing");
        Ok(())
    }

    pub async fn pause(&self, paused: bool) -> Result<()> {
        self.update(UpdatePlayer {
            paused: Some(paused),
            ..Default::default()
        })
        .await?;
        self.state.write().paused = paused;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.pause(false).await
    }

    /// Clamped to 0..=1000.
    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        let volume = volume.min(MAX_VOLUME);
        self.update(UpdatePlayer {
            volume: Some(volume),
            ..Default::default()
        })
        .await?;
        self.state.write().volume = volume;
        Ok(())
    }

    /// Position in milliseconds.
    pub async fn seek(&self, position: u64) -> Result<()> {
        let seekable = self.queue.lock().current().map(|t| t.info.is_seekable);
        if seekable == Some(false) {
            return Err(Error::InvalidTrackType("current track is not seekable".into()));
        }

        self.update(UpdatePlayer {
            position: Some(position),
            ..Default::default()
        })
        .await?;
        self.state.write().position = position;
        Ok(())
    }

    /// Opaque filter payload, forwarded as is.
    pub async fn set_filters(&self, filters: Value) -> Result<()> {
        self.update(UpdatePlayer {
            filters: Some(filters),
            ..Default::default()
        })
        .await
    }

    pub async fn stop(&self) -> Result<()> {
        self.update(UpdatePlayer {
            track: Some(UpdatePlayerTrack::stop()),
            ..Default::default()
        })
        .await?;

        let mut state = self.state.write();
        state.playing = false;
        state.position = 0;
        Ok(())
    }

    async fn update(&self, update: UpdatePlayer) -> Result<()> {
        self.node.rest().update_player(&self.guild_id, &update, false).await?;
        Ok(())
    }

    pub(crate) fn apply_state(&self, update: PlayerState) {
        let mut state = self.state.write();
        state.position = update.position;
        state.connected = update.connected;
        state.ping = update.ping;
    }

    pub(crate) fn apply_event(&self, payload: &Value) {
        let kind = payload
            .get("type")
            .cloned()
            .and_then(|kind| serde_json::from_value::<TrackEventKind>(kind).ok());

        match kind {
            Some(TrackEventKind::TrackStartEvent) => self.state.write().playing = true,
            Some(TrackEventKind::TrackEndEvent)
            | Some(TrackEventKind::TrackExceptionEvent)
            | Some(TrackEventKind::TrackStuckEvent) => self.state.write().playing = false,
            Some(TrackEventKind::WebSocketClosedEvent) => {
                warn!(guild = %self.guild_id, code = ?payload.get("code"), "node lost the voice socket");
                self.state.write().connected = false;
            }
            _ => {}
        }
    }

    /// Tears down the voice link and the remote player.
    pub(crate) async fn destroy(&self) {
        if let Some(watch) = self.voice_watch.lock().take() {
            watch.abort();
        }

        self.voice.disconnect().await;

        match self.node.rest().destroy_player(&self.guild_id).await {
            Ok(()) => {}
            Err(Error::SessionNotReady(_)) => {
                debug!(guild = %self.guild_id, "node has no session, nothing to destroy remotely");
            }
            Err(e) => warn!(guild = %self.guild_id, "failed to destroy remote player: {e}"),
        }

        info!(guild = %self.guild_id, "👋 player destroyed");
        self.events.emit(ManagerEvent::PlayerDestroy {
            guild_id: self.guild_id.clone(),
        });
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Some(watch) = self.voice_watch.get_mut().take() {
            watch.abort();
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("node", &self.node.name())
            .field("state", &*self.state.read())
            .finish()
    }
}
