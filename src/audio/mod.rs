//! # Audio Module
//!
//! Guild-facing side of the client.
//!
//! ### [`player_manager`] - Bring-up
//! - One player per guild, created only once voice and node are ready
//! - Rolls back partial work when a step fails
//!
//! ### [`player`] - Player
//! - Stable handle bound to the node that serves the guild
//! - Playback intent (track, pause, volume, seek, filters) sent over REST
//!
//! ### [`voice`] - Voice link
//! - Join/leave requests through the host's gateway
//! - Assembles the credentials a node needs and announces them
//!
//! ### [`queue`] - Queue
//! - Current track, pending tracks and bounded history
//!
//! [`lavalink_client`] ties all of it to the node pool.

pub mod lavalink_client;
pub mod player;
pub mod player_manager;
pub mod queue;
pub mod voice;
