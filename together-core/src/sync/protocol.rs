//! Sync Protocol Messages

use serde::{Deserialize, Serialize};

/// A single observed-or-applied playback change.
///
/// This is also the payload exchanged between peers; the network layer treats
/// the encoded bytes as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum PlaybackEvent {
    /// Player paused (`true`) or resumed (`false`)
    PauseChanged(bool),
    /// Playback position as a numeric string (percent of the file)
    PositionChanged(String),
    /// The player performed a seek. Local only, never sent to peers.
    SeekOccurred,
}

impl PlaybackEvent {
    /// Encode as a peer payload
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a peer payload
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PlaybackEvent::PauseChanged(_) => "pause-changed",
            PlaybackEvent::PositionChanged(_) => "position-changed",
            PlaybackEvent::SeekOccurred => "seek-occurred",
        }
    }
}
