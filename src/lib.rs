//! # open-music-link
//!
//! Client runtime for Lavalink-compatible audio servers.
//!
//! - [`node`]: one connection per backend server (WebSocket control channel,
//!   session-bound REST, reconnect and resume)
//! - [`audio`]: guild players, their voice links and queues
//! - [`events`]: everything observable, as a broadcast stream
//!
//! ```rust,no_run
//! use open_music_link::{audio::lavalink_client::LavalinkClient, config::Config};
//! # use open_music_link::audio::voice::VoiceGateway;
//! # use std::sync::Arc;
//!
//! # async fn example(gateway: Arc<dyn VoiceGateway>) -> anyhow::Result<()> {
//! let client = LavalinkClient::new(Config::load()?, gateway)?;
//! client.connect().await;
//!
//! let tracks = client.search("lofi beats", None).await?.into_tracks();
//! println!("found {} tracks", tracks.len());
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod node;

pub use error::{Error, Result};
