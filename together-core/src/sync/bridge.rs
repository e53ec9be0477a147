//! Player Bridge
//!
//! Connects the player link to the gossip queues: local events go out through
//! the outbound queue, remote events come in through the inbound queue.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::PlaybackEvent;
use super::state::{BridgeState, Observed};
use crate::player::{LinkError, PlayerEvent, PlayerEvents, PlayerLink};

/// Anti-echo bridge between one player link and the peer group
pub struct PlayerBridge {
    link: Arc<PlayerLink>,
    state: Mutex<BridgeState>,
}

impl PlayerBridge {
    pub fn new(link: Arc<PlayerLink>) -> Self {
        Self {
            link,
            state: Mutex::new(BridgeState::new()),
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> BridgeState {
        self.state.lock().clone()
    }

    pub fn link(&self) -> &Arc<PlayerLink> {
        &self.link
    }

    /// Classify one local playback event and act on it.
    ///
    /// Returns the payload to propagate, if the event is worth sending.
    pub async fn observe(&self, event: &PlaybackEvent) -> Result<Option<Vec<u8>>, LinkError> {
        let observed = self.state.lock().observe(event);
        match observed {
            Observed::Propagate(event) => {
                info!("Local {} ({:?}), propagating", event.kind(), event);
                Ok(Some(event.encode()?))
            }
            Observed::AutoPause => {
                info!("Seek while playing, pausing for resync");
                self.link.set_pause(true).await?;
                Ok(None)
            }
            Observed::Ignore(reason) => {
                debug!("Not propagating {:?}: {:?}", event, reason);
                Ok(None)
            }
        }
    }

    /// Apply one payload received from a peer. Malformed payloads are dropped.
    pub async fn apply_remote(&self, payload: &[u8]) -> Result<(), LinkError> {
        let event = match PlaybackEvent::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping malformed remote event {}: {}", String::from_utf8_lossy(payload), e);
                return Ok(());
            }
        };

        let command = self.state.lock().apply(&event);
        match command {
            Some(command) => {
                info!("Applying remote {} ({:?})", event.kind(), event);
                self.link.send(&command).await
            }
            None => {
                debug!("Remote {:?} needs no change", event);
                Ok(())
            }
        }
    }

    /// Read the player's event feed until it ends.
    ///
    /// Ends with `LinkError::Closed` when the player exits; a closed outbound
    /// queue means the session is shutting down and ends the loop cleanly.
    pub async fn run_observer(
        &self,
        mut events: PlayerEvents,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), LinkError> {
        while let Some(event) = events.next_event().await? {
            match event {
                PlayerEvent::Playback(event) => {
                    if let Some(payload) = self.observe(&event).await? {
                        if outbound.send(payload).await.is_err() {
                            debug!("Outbound queue closed, stopping player observer");
                            return Ok(());
                        }
                    }
                }
                PlayerEvent::Reply(line) => debug!("<- {}", line),
                PlayerEvent::Other(what) => debug!("Ignoring player event {}", what),
                PlayerEvent::Malformed(line) => warn!("Malformed player line: {}", line),
            }
        }

        warn!("Player closed the control stream");
        Err(LinkError::Closed)
    }

    /// Apply remote events until the inbound queue closes
    pub async fn run_applier(&self, mut inbound: mpsc::Receiver<Vec<u8>>) -> Result<(), LinkError> {
        while let Some(payload) = inbound.recv().await {
            self.apply_remote(&payload).await?;
        }
        Ok(())
    }
}
