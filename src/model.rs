//! Wire models shared by the REST client and the WebSocket control channel.
//!
//! Field names follow the backend's camelCase JSON. Anything the client
//! does not interpret (filters, plugin info, user data) is carried as raw
//! [`serde_json::Value`] so it round-trips untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{Error, Result};

/// A track as understood by the backend: the opaque encoded payload plus
/// the decoded metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default)]
    pub plugin_info: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub user_data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Length in milliseconds
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

impl Track {
    /// A track can only be sent to a node when it carries an encoded payload.
    pub fn is_playable(&self) -> bool {
        !self.encoded.trim().is_empty()
    }

    /// Track length; streams report zero.
    pub fn duration(&self) -> Duration {
        if self.info.is_stream {
            Duration::ZERO
        } else {
            Duration::from_millis(self.info.length)
        }
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

/// Raw `/loadtracks` response, `data` depends on `loadType`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResponse {
    pub load_type: LoadType,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlaylistInfo {
    pub name: String,
    pub selected_track: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Playlist {
    pub info: PlaylistInfo,
    pub plugin_info: Value,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadException {
    pub message: Option<String>,
    pub severity: String,
    pub cause: String,
}

/// Typed outcome of a track resolution.
///
/// "Nothing found" is [`LoadResult::Empty`], never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult {
    Track(Track),
    Playlist(Playlist),
    Search(Vec<Track>),
    Empty,
    Error(LoadException),
}

impl LoadResult {
    pub fn is_empty(&self) -> bool {
        match self {
            LoadResult::Empty | LoadResult::Error(_) => true,
            LoadResult::Search(tracks) => tracks.is_empty(),
            LoadResult::Playlist(playlist) => playlist.tracks.is_empty(),
            LoadResult::Track(_) => false,
        }
    }

    /// Flattens the result into the list of playable tracks.
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            LoadResult::Track(track) => vec![track],
            LoadResult::Playlist(playlist) => playlist.tracks,
            LoadResult::Search(tracks) => tracks,
            LoadResult::Empty | LoadResult::Error(_) => Vec::new(),
        }
    }
}

impl TryFrom<LoadResponse> for LoadResult {
    type Error = Error;

    fn try_from(response: LoadResponse) -> Result<Self> {
        let result = match response.load_type {
            LoadType::Track => LoadResult::Track(serde_json::from_value(response.data)?),
            LoadType::Playlist => LoadResult::Playlist(serde_json::from_value(response.data)?),
            LoadType::Search => LoadResult::Search(serde_json::from_value(response.data)?),
            LoadType::Empty => LoadResult::Empty,
            LoadType::Error => LoadResult::Error(serde_json::from_value(response.data)?),
        };
        Ok(result)
    }
}

/// Voice transport credentials handed to a node so it can open the
/// audio socket on our behalf.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceCredentials {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Live playback state reported by `playerUpdate` frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerState {
    pub time: i64,
    pub position: u64,
    pub connected: bool,
    pub ping: i64,
}

/// A player as returned by the session player endpoints.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemotePlayer {
    pub guild_id: String,
    pub track: Option<Track>,
    pub volume: u16,
    pub paused: bool,
    pub state: PlayerState,
    pub voice: VoiceCredentials,
    pub filters: Value,
}

/// Track part of a player update.
///
/// `encoded: Some(None)` serializes as `null`, which stops playback.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerTrack {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

impl UpdatePlayerTrack {
    pub fn encoded(encoded: impl Into<String>) -> Self {
        Self {
            encoded: Some(Some(encoded.into())),
            ..Default::default()
        }
    }

    pub fn stop() -> Self {
        Self {
            encoded: Some(None),
            ..Default::default()
        }
    }
}

/// Desired player state, only the fields that are set are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdatePlayerTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceCredentials>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionUpdate {
    pub resuming: bool,
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionInfo {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Subset of `/info` the client cares about.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeInfo {
    pub version: VersionInfo,
    pub jvm: String,
    pub lavaplayer: String,
    pub source_managers: Vec<String>,
    pub filters: Vec<String>,
}

/// `op: "ready"` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyFrame {
    #[serde(default)]
    pub resumed: bool,
    pub session_id: String,
}

/// `op: "playerUpdate"` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateFrame {
    pub guild_id: String,
    #[serde(default)]
    pub state: PlayerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TrackEventKind {
    TrackStartEvent,
    TrackEndEvent,
    TrackExceptionEvent,
    TrackStuckEvent,
    WebSocketClosedEvent,
    #[serde(other)]
    Unknown,
}

/// `op: "event"` payload, only the routing fields are typed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub guild_id: String,
    #[serde(rename = "type")]
    pub kind: TrackEventKind,
}
