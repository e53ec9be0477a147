//! Node configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Default gossip listen port
pub const DEFAULT_GOSSIP_PORT: u16 = 8080;

/// Tunables for one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Where the gossip server listens
    pub listen: SocketAddr,
    /// Address other peers should use to reach us (`host:port`).
    /// Derived from the port mapper when unset.
    pub advertise: Option<String>,
    /// Capacity of the inbound and outbound event queues
    pub queue_capacity: usize,
    /// Total timeout of one gossip call
    pub request_timeout: Duration,
    /// TCP connect timeout of one gossip call
    pub connect_timeout: Duration,
    /// Upper bound on departure notices and abandoned rounds at shutdown
    pub shutdown_grace: Duration,
    /// Most concurrent deliveries per broadcast round
    pub fanout_limit: usize,
    /// Largest accepted request body
    pub max_body_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_GOSSIP_PORT)),
            advertise: None,
            queue_capacity: 256,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(3),
            fanout_limit: 64,
            max_body_bytes: 64 * 1024,
        }
    }
}
