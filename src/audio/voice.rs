//! Upstream voice link of a guild.
//!
//! The host application owns the real gateway connection. We only ask it
//! to join or leave, and it feeds the provider's voice packets back so the
//! credentials a node needs can be assembled here.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::VoiceCredentials;

/// Voice state change the gateway should send for us. `channel_id: None`
/// means leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceStateRequest {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub self_deaf: bool,
    pub self_mute: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn send_voice_state(&self, request: VoiceStateRequest) -> Result<()>;
}

/// What a player needs to join a voice channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceChannelOptions {
    pub guild_id: String,
    pub channel_id: String,
    pub deaf: bool,
    pub mute: bool,
}

impl VoiceChannelOptions {
    pub fn new(guild_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
            deaf: true,
            mute: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Disconnected,
    Connecting,
    /// Session id, token and endpoint are all known
    SessionReady,
}

#[derive(Debug)]
struct VoiceLink {
    state: VoiceState,
    channel_id: Option<String>,
    session_id: Option<String>,
    token: Option<String>,
    endpoint: Option<String>,
    announced: Option<VoiceCredentials>,
}

pub struct VoiceConnection {
    options: VoiceChannelOptions,
    gateway: Arc<dyn VoiceGateway>,
    link: RwLock<VoiceLink>,
    ready: broadcast::Sender<VoiceCredentials>,
    timeout: Duration,
}

impl VoiceConnection {
    pub fn new(
        options: VoiceChannelOptions,
        gateway: Arc<dyn VoiceGateway>,
        timeout: Duration,
    ) -> Self {
        let (ready, _) = broadcast::channel(8);
        Self {
            options,
            gateway,
            link: RwLock::new(VoiceLink {
                state: VoiceState::Disconnected,
                channel_id: None,
                session_id: None,
                token: None,
                endpoint: None,
                announced: None,
            }),
            ready,
            timeout,
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.options.guild_id
    }

    pub fn channel_id(&self) -> Option<String> {
        self.link.read().channel_id.clone()
    }

    pub fn state(&self) -> VoiceState {
        self.link.read().state
    }

    /// Fires with fresh credentials on every completed handshake,
    /// including voice server changes.
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceCredentials> {
        self.ready.subscribe()
    }

    pub fn credentials(&self) -> Option<VoiceCredentials> {
        let link = self.link.read();
        Some(VoiceCredentials {
            token: link.token.clone()?,
            endpoint: link.endpoint.clone()?,
            session_id: link.session_id.clone()?,
        })
    }

    /// Joins the channel and waits until the provider handed out credentials.
    pub async fn connect(&self) -> Result<()> {
        let mut ready = self.ready.subscribe();
        {
            let mut link = self.link.write();
            link.state = VoiceState::Connecting;
            link.channel_id = Some(self.options.channel_id.clone());
        }

        debug!(guild = %self.guild_id(), channel = %self.options.channel_id, "joining voice channel");
        self.gateway
            .send_voice_state(VoiceStateRequest {
                guild_id: self.options.guild_id.clone(),
                channel_id: Some(self.options.channel_id.clone()),
                self_deaf: self.options.deaf,
                self_mute: self.options.mute,
            })
            .await?;

        match tokio::time::timeout(self.timeout, ready.recv()).await {
            Ok(Ok(_)) => {
                info!(guild = %self.guild_id(), "🔊 voice ready");
                Ok(())
            }
            _ => {
                self.link.write().state = VoiceState::Disconnected;
                warn!(guild = %self.guild_id(), "voice credentials never arrived");
                Err(Error::VoiceTimeout(self.options.guild_id.clone()))
            }
        }
    }

    /// Leaves the channel and forgets the credentials.
    pub async fn disconnect(&self) {
        let request = VoiceStateRequest {
            guild_id: self.options.guild_id.clone(),
            channel_id: None,
            self_deaf: false,
            self_mute: false,
        };
        if let Err(e) = self.gateway.send_voice_state(request).await {
            warn!(guild = %self.guild_id(), "failed to leave voice channel: {e}");
        }

        let mut link = self.link.write();
        link.state = VoiceState::Disconnected;
        link.channel_id = None;
        link.session_id = None;
        link.token = None;
        link.endpoint = None;
        link.announced = None;
        debug!(guild = %self.guild_id(), "voice disconnected");
    }

    /// Our own voice state changed. No channel means we were kicked or moved out.
    pub fn handle_state_update(&self, session_id: Option<String>, channel_id: Option<String>) {
        {
            let mut link = self.link.write();
            if channel_id.is_none() {
                link.state = VoiceState::Disconnected;
                link.channel_id = None;
                return;
            }
            link.channel_id = channel_id;
            if session_id.is_some() {
                link.session_id = session_id;
            }
        }
        self.check_ready();
    }

    /// The provider assigned (or moved us to) a voice server. A missing
    /// endpoint means the old server is going away and a new one follows.
    pub fn handle_server_update(&self, token: String, endpoint: Option<String>) {
        let Some(endpoint) = endpoint else {
            debug!(guild = %self.guild_id(), "voice server going away");
            return;
        };
        {
            let mut link = self.link.write();
            link.token = Some(token);
            link.endpoint = Some(endpoint);
        }
        self.check_ready();
    }

    fn check_ready(&self) {
        let Some(credentials) = self.credentials() else {
            return;
        };
        {
            let mut link = self.link.write();
            link.state = VoiceState::SessionReady;
            if link.announced.as_ref() == Some(&credentials) {
                return;
            }
            link.announced = Some(credentials.clone());
        }
        debug!(guild = %self.guild_id(), endpoint = %credentials.endpoint, "voice credentials complete");
        let _ = self.ready.send(credentials);
    }
}
