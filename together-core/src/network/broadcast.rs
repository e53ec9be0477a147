//! Broadcaster
//!
//! Drains the outbound queue and fans each payload out to every known peer,
//! one numbered round per payload.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::PeerClient;
use super::registry::PeerRegistry;
use crate::config::NodeConfig;

/// Outcome of one broadcast round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundReport {
    pub counter: u64,
    pub delivered: usize,
    pub failed: usize,
}

pub struct Broadcaster {
    registry: Arc<PeerRegistry>,
    client: PeerClient,
    fanout_limit: usize,
    shutdown_grace: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<PeerRegistry>, client: PeerClient, config: &NodeConfig) -> Self {
        Self {
            registry,
            client,
            fanout_limit: config.fanout_limit.max(1),
            shutdown_grace: config.shutdown_grace,
        }
    }

    fn describe(&self, addr: &str) -> String {
        match self.registry.get(addr) {
            Some(peer) => peer.to_string(),
            None => addr.to_string(),
        }
    }

    /// Deliver `payload` to every known peer under a fresh round counter.
    ///
    /// Returns once every delivery finished or failed.
    pub async fn broadcast(&self, payload: &[u8]) -> RoundReport {
        let counter = self.registry.next_round();
        let peers = self.registry.snapshot();

        let results: Vec<bool> = stream::iter(peers)
            .map(|addr| async move {
                match self.client.event(&addr, counter, payload).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Round {} to {} failed: {}", counter, self.describe(&addr), e);
                        false
                    }
                }
            })
            .buffer_unordered(self.fanout_limit)
            .collect()
            .await;

        let delivered = results.iter().filter(|ok| **ok).count();
        let report = RoundReport {
            counter,
            delivered,
            failed: results.len() - delivered,
        };
        debug!("Round {} done: {} delivered, {} failed", counter, report.delivered, report.failed);
        report
    }

    /// Broadcast payloads until the queue closes or `cancel` fires.
    ///
    /// A round in flight at cancellation gets `shutdown_grace` to finish.
    pub async fn run(&self, mut outbound: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => break,
                payload = outbound.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            let round = self.broadcast(&payload);
            tokio::pin!(round);

            tokio::select! {
                _ = &mut round => {}
                _ = cancel.cancelled() => {
                    if tokio::time::timeout(self.shutdown_grace, &mut round).await.is_err() {
                        warn!("Abandoning broadcast round after {:?}", self.shutdown_grace);
                    }
                    break;
                }
            }
        }
        debug!("Broadcaster stopped");
    }

    /// Tell every peer we are leaving, bounded by the shutdown grace period
    pub async fn shutdown(&self) {
        let peers = self.registry.snapshot();
        if peers.is_empty() {
            return;
        }
        let counter = self.registry.counter();
        info!("Saying goodbye to {} peers", peers.len());

        let notices = stream::iter(peers)
            .map(|addr| async move {
                if let Err(e) = self.client.bye(&addr, counter).await {
                    debug!("Goodbye to {} failed: {}", self.describe(&addr), e);
                }
            })
            .buffer_unordered(self.fanout_limit)
            .collect::<Vec<()>>();

        if tokio::time::timeout(self.shutdown_grace, notices).await.is_err() {
            warn!("Departure notices timed out after {:?}", self.shutdown_grace);
        }
    }
}
