//! mpv Together - Core Library
//!
//! Keeps several mpv players paused and positioned in lock-step across a
//! network, with no central coordinator.

pub mod config;
pub mod network;
pub mod player;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use config::NodeConfig;
pub use network::{GossipError, GossipServer, PeerRegistry, PortMapper, StaticPortMapper};
pub use player::{IpcTransport, LinkError, PlayerLink, Transport};
pub use session::{open_player, Session, SessionError};
pub use sync::{PlaybackEvent, PlayerBridge};
