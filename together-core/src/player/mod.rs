//! mpv Control Link
//!
//! This module talks to the local player over its JSON IPC endpoint.

mod link;
pub mod transport;
mod types;

pub use link::{LinkError, PlayerEvents, PlayerLink};
pub use transport::{wait_for_endpoint, ByteStream, IpcTransport, Transport};
pub use types::*;
