//! Peer Networking
//!
//! Gossip membership and ordered broadcast over plain HTTP/1.1.

mod broadcast;
mod client;
mod nat;
mod registry;
mod server;

pub use broadcast::{Broadcaster, RoundReport};
pub use client::{GossipError, JoinReply, PeerClient};
pub use nat::{local_ip, PortMapError, PortMapper, StaticPortMapper};
pub use registry::{Delivery, JoinOutcome, Peer, PeerInfo, PeerMap, PeerRegistry};
pub use server::GossipServer;
