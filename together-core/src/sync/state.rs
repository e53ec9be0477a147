//! Bridge State Machine
//!
//! Pure classification of player events and remote events. No I/O here; the
//! bridge decides under one lock and talks to the player afterwards.

use super::protocol::PlaybackEvent;
use crate::player::Command;

/// Who caused the current pause state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Either side may initiate sync
    #[default]
    None,
    /// The last pause we applied came from a remote peer; don't echo it
    Slave,
}

/// What to do with an event observed on the local player
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    /// Forward to every peer
    Propagate(PlaybackEvent),
    /// A seek while playing: pause the local player, forward nothing
    AutoPause,
    /// Nothing to do
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// We are following a remote pause
    Suppressed,
    /// Restates what we already know
    NoChange,
    /// Position while playing is continuous noise
    Playing,
    /// Seek while already paused
    Transient,
}

/// Pause state plus anti-echo marker, guarded as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeState {
    pub paused: bool,
    pub role: Role,
    /// Last position sent to or applied from peers
    pub last_position: Option<String>,
}

impl Default for BridgeState {
    fn default() -> Self {
        Self {
            paused: false,
            role: Role::None,
            last_position: None,
        }
    }
}

impl BridgeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an event produced by the local player
    pub fn observe(&mut self, event: &PlaybackEvent) -> Observed {
        match event {
            PlaybackEvent::PauseChanged(paused) => {
                let changed = self.paused != *paused;
                self.paused = *paused;
                if !*paused {
                    // Resuming always clears slave status
                    self.role = Role::None;
                }

                if !changed {
                    Observed::Ignore(IgnoreReason::NoChange)
                } else if self.role == Role::Slave {
                    Observed::Ignore(IgnoreReason::Suppressed)
                } else {
                    Observed::Propagate(event.clone())
                }
            }

            PlaybackEvent::PositionChanged(position) => {
                if !self.paused {
                    return Observed::Ignore(IgnoreReason::Playing);
                }
                if position.is_empty() || self.last_position.as_deref() == Some(position.as_str()) {
                    return Observed::Ignore(IgnoreReason::NoChange);
                }
                if self.role == Role::Slave {
                    return Observed::Ignore(IgnoreReason::Suppressed);
                }
                self.last_position = Some(position.clone());
                Observed::Propagate(event.clone())
            }

            PlaybackEvent::SeekOccurred => {
                if self.paused {
                    Observed::Ignore(IgnoreReason::Transient)
                } else {
                    // paused stays false until the player reports it, so the
                    // resulting pause is seen as a local change
                    Observed::AutoPause
                }
            }
        }
    }

    /// Decide how to apply an event received from a peer.
    ///
    /// Returns the player command to issue, if any.
    pub fn apply(&mut self, event: &PlaybackEvent) -> Option<Command> {
        match event {
            PlaybackEvent::PauseChanged(paused) => {
                if *paused == self.paused {
                    return None;
                }
                self.role = if *paused { Role::Slave } else { Role::None };
                self.paused = *paused;
                Some(Command::SetPause(*paused))
            }

            PlaybackEvent::PositionChanged(position) => {
                if !self.paused {
                    return None;
                }
                if position.trim().parse::<f64>().map(|p| !p.is_finite()).unwrap_or(true) {
                    return None;
                }
                if self.last_position.as_deref() == Some(position.as_str()) {
                    return None;
                }
                // The player will report this position back; remember it so
                // the report is deduplicated instead of bounced
                self.last_position = Some(position.clone());
                Some(Command::SetPosition(position.clone()))
            }

            PlaybackEvent::SeekOccurred => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pause(p: bool) -> PlaybackEvent {
        PlaybackEvent::PauseChanged(p)
    }

    fn position(p: &str) -> PlaybackEvent {
        PlaybackEvent::PositionChanged(p.to_string())
    }

    #[test]
    fn test_local_pause_propagates() {
        let mut state = BridgeState::new();
        assert_eq!(state.observe(&pause(true)), Observed::Propagate(pause(true)));
        assert!(state.paused);
        assert_eq!(state.role, Role::None);

        assert_eq!(state.observe(&pause(false)), Observed::Propagate(pause(false)));
        assert!(!state.paused);
    }

    #[test]
    fn test_remote_pause_is_not_echoed() {
        let mut state = BridgeState::new();

        assert_eq!(state.apply(&pause(true)), Some(Command::SetPause(true)));
        assert_eq!(state.role, Role::Slave);

        // The player reports the pause we just caused
        assert!(!matches!(state.observe(&pause(true)), Observed::Propagate(_)));
        assert_eq!(state.role, Role::Slave);
    }

    #[test]
    fn test_remote_resume_clears_suppression() {
        let mut state = BridgeState::new();
        state.apply(&pause(true));
        state.observe(&pause(true));

        assert_eq!(state.apply(&pause(false)), Some(Command::SetPause(false)));
        assert_eq!(state.role, Role::None);
        state.observe(&pause(false));

        // A later local pause is ours and must go out
        assert_eq!(state.observe(&pause(true)), Observed::Propagate(pause(true)));
    }

    #[test]
    fn test_slave_suppresses_position_until_resume() {
        let mut state = BridgeState::new();
        state.apply(&pause(true));
        state.observe(&pause(true));

        assert_eq!(
            state.observe(&position("10.0")),
            Observed::Ignore(IgnoreReason::Suppressed)
        );

        // Local resume clears slave status and is propagated
        assert_eq!(state.observe(&pause(false)), Observed::Propagate(pause(false)));
        assert_eq!(state.role, Role::None);
    }

    #[test]
    fn test_apply_pause_is_idempotent() {
        let mut state = BridgeState::new();
        assert_eq!(state.apply(&pause(false)), None);
        assert_eq!(state.apply(&pause(true)), Some(Command::SetPause(true)));
        assert_eq!(state.apply(&pause(true)), None);
    }

    #[test]
    fn test_position_only_while_paused() {
        let mut state = BridgeState::new();
        assert_eq!(state.observe(&position("5.0")), Observed::Ignore(IgnoreReason::Playing));
        assert_eq!(state.observe(&position("6.0")), Observed::Ignore(IgnoreReason::Playing));

        state.observe(&pause(true));
        assert_eq!(state.observe(&position("6.0")), Observed::Propagate(position("6.0")));
        assert_eq!(state.observe(&position("6.0")), Observed::Ignore(IgnoreReason::NoChange));
        assert_eq!(state.observe(&position("")), Observed::Ignore(IgnoreReason::NoChange));
        assert_eq!(state.observe(&position("7.5")), Observed::Propagate(position("7.5")));
    }

    #[test]
    fn test_seek_auto_pauses_only_while_playing() {
        let mut state = BridgeState::new();
        assert_eq!(state.observe(&PlaybackEvent::SeekOccurred), Observed::AutoPause);
        assert!(!state.paused);

        // The auto-pause comes back as a local pause and is propagated
        assert_eq!(state.observe(&pause(true)), Observed::Propagate(pause(true)));
        assert_eq!(
            state.observe(&PlaybackEvent::SeekOccurred),
            Observed::Ignore(IgnoreReason::Transient)
        );
    }

    #[test]
    fn test_apply_position_rules() {
        let mut state = BridgeState::new();
        // Playing: never yanked to another position
        assert_eq!(state.apply(&position("40.0")), None);

        state.observe(&pause(true));
        assert_eq!(state.apply(&position("")), None);
        assert_eq!(state.apply(&position("abc")), None);
        assert_eq!(state.apply(&position("NaN")), None);
        assert_eq!(
            state.apply(&position("40.0")),
            Some(Command::SetPosition("40.0".to_string()))
        );

        // The player's report of the applied position is not sent back
        assert_eq!(state.observe(&position("40.0")), Observed::Ignore(IgnoreReason::NoChange));
        assert_eq!(state.apply(&PlaybackEvent::SeekOccurred), None);
    }
}
