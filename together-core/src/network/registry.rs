//! Peer Registry
//!
//! The authoritative map of known peers and their delivery counters.
//! A table-wide `RwLock` guards insert/delete/snapshot; each peer carries its
//! own `Mutex` for the counter compare-and-update, so fan-out and inbound
//! deliveries never contend on the whole table.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One remote participant
#[derive(Debug)]
pub struct Peer {
    address: String,
    hostname: Mutex<String>,
    /// Last accepted sequence number from this peer
    delivery_counter: Mutex<u64>,
}

impl Peer {
    fn new(address: &str, counter: u64, hostname: &str) -> Self {
        Self {
            address: address.to_string(),
            hostname: Mutex::new(hostname.to_string()),
            delivery_counter: Mutex::new(counter),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn hostname(&self) -> String {
        self.hostname.lock().clone()
    }

    pub fn delivery_counter(&self) -> u64 {
        *self.delivery_counter.lock()
    }

    fn info(&self) -> PeerInfo {
        PeerInfo {
            counter: self.delivery_counter(),
            hostname: self.hostname(),
        }
    }

    /// Take the counter and hostname a peer advertised on a new handshake.
    ///
    /// The counter may go down: a restarted peer counts from zero again.
    fn refresh(&self, counter: u64, hostname: &str) {
        *self.delivery_counter.lock() = counter;
        *self.hostname.lock() = hostname.to_string();
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.hostname.lock())
    }
}

/// Peer entry as exchanged during join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub counter: u64,
    #[serde(default)]
    pub hostname: String,
}

/// Address -> peer info, the body of a join reply
pub type PeerMap = BTreeMap<String, PeerInfo>;

/// Result of recording an inbound join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Peers known before the caller joined, caller excluded
    pub peers: PeerMap,
    /// Our own group counter
    pub counter: u64,
    /// Our own hostname
    pub hostname: String,
    /// Whether the caller was unknown until now
    pub is_new: bool,
}

/// Outcome of an event delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// Counter not above the last accepted one (duplicate or out of order)
    Stale { last: u64 },
    /// The sender never joined
    Unknown,
}

/// Known peers plus this node's identity and broadcast counter
#[derive(Debug)]
pub struct PeerRegistry {
    self_address: String,
    self_hostname: String,
    group_counter: AtomicU64,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new(self_address: impl Into<String>, self_hostname: impl Into<String>) -> Self {
        Self {
            self_address: self_address.into(),
            self_hostname: self_hostname.into(),
            group_counter: AtomicU64::new(0),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    pub fn self_hostname(&self) -> &str {
        &self.self_hostname
    }

    /// Current group counter (last broadcast round)
    pub fn counter(&self) -> u64 {
        self.group_counter.load(Ordering::SeqCst)
    }

    /// Start a new broadcast round and return its counter
    pub fn next_round(&self) -> u64 {
        self.group_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record an inbound join from `address`.
    ///
    /// A re-join keeps the single existing entry and records the counter the
    /// peer advertises now.
    pub fn join(&self, address: &str, counter: u64, hostname: &str) -> JoinOutcome {
        let mut table = self.peers.write();

        let peers = table
            .iter()
            .filter(|(addr, _)| addr.as_str() != address)
            .map(|(addr, peer)| (addr.clone(), peer.info()))
            .collect();

        let is_new = if address == self.self_address {
            warn!("Ignoring join from our own address {}", address);
            false
        } else if let Some(peer) = table.get(address) {
            peer.refresh(counter, hostname);
            debug!("Peer re-joined: {} at counter {}", peer, counter);
            false
        } else {
            table.insert(address.to_string(), Arc::new(Peer::new(address, counter, hostname)));
            info!("Peer joined: {} ({}) at counter {}", address, hostname, counter);
            true
        };

        JoinOutcome {
            peers,
            counter: self.counter(),
            hostname: self.self_hostname.clone(),
            is_new,
        }
    }

    /// Register a peer learned through our own handshake.
    ///
    /// Returns `true` if the peer was not known before.
    pub fn insert(&self, address: &str, counter: u64, hostname: &str) -> bool {
        if address == self.self_address {
            return false;
        }
        let mut table = self.peers.write();
        if let Some(peer) = table.get(address) {
            peer.refresh(counter, hostname);
            return false;
        }
        table.insert(address.to_string(), Arc::new(Peer::new(address, counter, hostname)));
        info!("Added peer {} ({}) at counter {}", address, hostname, counter);
        true
    }

    /// Remove a peer. Returns whether it was known.
    pub fn leave(&self, address: &str) -> bool {
        let removed = self.peers.write().remove(address);
        match &removed {
            Some(peer) => info!("Peer left: {}", peer),
            None => debug!("Leave from unknown peer {}", address),
        }
        removed.is_some()
    }

    /// Check `counter` against the peer's last accepted counter and advance it
    pub fn accept_delivery(&self, address: &str, counter: u64) -> Delivery {
        // Hold the table lock only long enough to find the peer
        let peer = match self.peers.read().get(address) {
            Some(peer) => Arc::clone(peer),
            None => return Delivery::Unknown,
        };

        let mut last = peer.delivery_counter.lock();
        if counter <= *last {
            return Delivery::Stale { last: *last };
        }
        *last = counter;
        Delivery::Accepted
    }

    /// Addresses of all known peers, for fan-out
    pub fn snapshot(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn get(&self, address: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(address).cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.read().contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn registry() -> PeerRegistry {
        PeerRegistry::new("10.0.0.1:8765", "me")
    }

    #[test]
    fn test_out_of_order_deliveries_accepted_once() {
        let reg = registry();
        reg.join("10.0.0.2:8765", 0, "peer");

        let mut counters: Vec<u64> = (1..=50).collect();
        counters.extend(1..=50); // duplicates
        counters.shuffle(&mut rand::thread_rng());

        let accepted = counters
            .iter()
            .filter(|c| reg.accept_delivery("10.0.0.2:8765", **c) == Delivery::Accepted)
            .count();

        // Every accepted counter is above all earlier ones, so nothing twice
        assert!(accepted >= 1 && accepted <= 50);
        assert_eq!(reg.get("10.0.0.2:8765").unwrap().delivery_counter(), 50);
    }

    #[test]
    fn test_in_order_deliveries_all_accepted() {
        let reg = registry();
        reg.join("10.0.0.2:8765", 3, "peer");

        assert_eq!(reg.accept_delivery("10.0.0.2:8765", 3), Delivery::Stale { last: 3 });
        for c in 4..10 {
            assert_eq!(reg.accept_delivery("10.0.0.2:8765", c), Delivery::Accepted);
        }
        assert_eq!(reg.accept_delivery("10.0.0.2:8765", 7), Delivery::Stale { last: 9 });
    }

    #[test]
    fn test_concurrent_deliveries_accept_each_counter_once() {
        let reg = Arc::new(registry());
        reg.join("10.0.0.2:8765", 0, "peer");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    (1..=200u64)
                        .filter(|c| reg.accept_delivery("10.0.0.2:8765", *c) == Delivery::Accepted)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut accepted: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = accepted.len();
        accepted.sort_unstable();
        accepted.dedup();
        assert_eq!(accepted.len(), total, "a counter was accepted twice");
        assert_eq!(reg.get("10.0.0.2:8765").unwrap().delivery_counter(), 200);
    }

    #[test]
    fn test_unknown_peer_rejected_without_mutation() {
        let reg = registry();
        assert_eq!(reg.accept_delivery("10.0.0.9:8765", 1), Delivery::Unknown);
        assert!(reg.is_empty());
        assert!(!reg.contains("10.0.0.9:8765"));
    }

    #[test]
    fn test_rejoin_is_idempotent_on_address() {
        let reg = registry();
        let first = reg.join("10.0.0.2:8765", 5, "peer");
        assert!(first.is_new);
        let second = reg.join("10.0.0.2:8765", 0, "peer-renamed");
        assert!(!second.is_new);

        assert_eq!(reg.len(), 1);
        let peer = reg.get("10.0.0.2:8765").unwrap();
        assert_eq!(peer.hostname(), "peer-renamed");
        assert_eq!(peer.delivery_counter(), 0);

        // After a leave the next join starts over
        reg.leave("10.0.0.2:8765");
        assert!(reg.join("10.0.0.2:8765", 0, "peer").is_new);
        assert_eq!(reg.accept_delivery("10.0.0.2:8765", 1), Delivery::Accepted);
    }

    #[test]
    fn test_restarted_peer_counts_again() {
        let reg = registry();
        reg.join("10.0.0.2:8765", 0, "peer");
        for counter in 1..=3 {
            assert_eq!(reg.accept_delivery("10.0.0.2:8765", counter), Delivery::Accepted);
        }

        // Crashed without a goodbye and came back from zero
        assert!(!reg.join("10.0.0.2:8765", 0, "peer").is_new);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.accept_delivery("10.0.0.2:8765", 1), Delivery::Accepted);
        assert_eq!(reg.accept_delivery("10.0.0.2:8765", 1), Delivery::Stale { last: 1 });

        // Our own handshake reply resets it the same way
        reg.insert("10.0.0.2:8765", 0, "peer");
        assert_eq!(reg.accept_delivery("10.0.0.2:8765", 1), Delivery::Accepted);
    }

    #[test]
    fn test_join_returns_others_and_own_identity() {
        let reg = registry();
        reg.next_round();
        reg.next_round();
        reg.join("10.0.0.3:8765", 7, "c");

        let outcome = reg.join("10.0.0.2:8765", 0, "b");
        assert_eq!(outcome.counter, 2);
        assert_eq!(outcome.hostname, "me");
        assert_eq!(outcome.peers.len(), 1);
        assert_eq!(
            outcome.peers.get("10.0.0.3:8765"),
            Some(&PeerInfo { counter: 7, hostname: "c".to_string() })
        );

        // Caller is never listed back to itself
        let again = reg.join("10.0.0.2:8765", 0, "b");
        assert!(!again.peers.contains_key("10.0.0.2:8765"));
    }

    #[test]
    fn test_self_is_never_a_peer() {
        let reg = registry();
        assert!(!reg.join("10.0.0.1:8765", 0, "me").is_new);
        assert!(!reg.insert("10.0.0.1:8765", 0, "me"));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_leave_is_idempotent() {
        let reg = registry();
        reg.insert("10.0.0.2:8765", 0, "b");
        assert!(reg.leave("10.0.0.2:8765"));
        assert!(!reg.leave("10.0.0.2:8765"));
        assert_eq!(reg.accept_delivery("10.0.0.2:8765", 1), Delivery::Unknown);
    }

    #[test]
    fn test_group_counter_only_increases() {
        let reg = registry();
        assert_eq!(reg.counter(), 0);
        assert_eq!(reg.next_round(), 1);
        assert_eq!(reg.next_round(), 2);
        assert_eq!(reg.counter(), 2);
    }
}
