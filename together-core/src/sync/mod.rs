//! Sync Engine
//!
//! Decides which player events are worth propagating and applies remote
//! events back to the player without echoing them.

mod bridge;
mod protocol;
mod state;

pub use bridge::PlayerBridge;
pub use protocol::*;
pub use state::*;
