//! Types for the mpv JSON IPC protocol

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::sync::PlaybackEvent;

/// Pause property name
pub const PAUSE: &str = "pause";

/// Playback position property name (percentage of the file)
pub const PERCENT_POS: &str = "percent-pos";

/// Event type for observed property updates
pub const EVENT_PROPERTY_CHANGE: &str = "property-change";

/// Event type emitted after every seek
pub const EVENT_SEEK: &str = "seek";

/// Properties observed on every new link, with their observation ids
pub const OBSERVED_PROPERTIES: &[(u64, &str)] = &[(1, PAUSE), (2, PERCENT_POS)];

/// A raw line from the player's event feed
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Request body written to the control stream
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub command: Vec<Value>,
    pub request_id: i64,
}

/// Control commands sent to the player
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `set_property pause <bool>`
    SetPause(bool),
    /// `set_property percent-pos <number>`
    SetPosition(String),
    /// `observe_property_string <id> <name>`
    Observe { id: u64, property: String },
    /// `get_property <name>`
    GetProperty(String),
}

impl Command {
    /// Build the `command` array for this request
    pub fn to_args(&self) -> Vec<Value> {
        match self {
            Command::SetPause(paused) => vec![
                Value::from("set_property"),
                Value::from(PAUSE),
                Value::Bool(*paused),
            ],
            Command::SetPosition(position) => {
                // mpv wants a native number for percent-pos; fall back to the raw string
                let value = position
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::from(position.as_str()));
                vec![Value::from("set_property"), Value::from(PERCENT_POS), value]
            }
            Command::Observe { id, property } => vec![
                Value::from("observe_property_string"),
                Value::from(*id),
                Value::from(property.as_str()),
            ],
            Command::GetProperty(property) => {
                vec![Value::from("get_property"), Value::from(property.as_str())]
            }
        }
    }

    /// Wrap the command into a request with the given id
    pub fn into_request(&self, request_id: i64) -> Request {
        Request {
            command: self.to_args(),
            request_id,
        }
    }
}

/// A decoded line from the player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// A playback state change worth classifying
    Playback(PlaybackEvent),
    /// Reply to one of our requests (no `event` field)
    Reply(String),
    /// An event type or property we do not track
    Other(String),
    /// A line that is not valid JSON
    Malformed(String),
}

impl PlayerEvent {
    /// Decode one newline-delimited JSON line from the player
    pub fn parse(line: &str) -> Self {
        let raw: RawEvent = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(_) => return PlayerEvent::Malformed(line.to_string()),
        };

        let Some(event) = raw.event.as_deref() else {
            return PlayerEvent::Reply(line.to_string());
        };

        match event {
            EVENT_PROPERTY_CHANGE => match raw.name.as_deref() {
                Some(PAUSE) => match data_as_string(raw.data.as_ref()).as_str() {
                    "yes" | "true" => PlayerEvent::Playback(PlaybackEvent::PauseChanged(true)),
                    "no" | "false" => PlayerEvent::Playback(PlaybackEvent::PauseChanged(false)),
                    other => PlayerEvent::Other(format!("{}={}", PAUSE, other)),
                },
                Some(PERCENT_POS) => PlayerEvent::Playback(PlaybackEvent::PositionChanged(
                    data_as_string(raw.data.as_ref()),
                )),
                Some(name) => PlayerEvent::Other(format!("{}:{}", EVENT_PROPERTY_CHANGE, name)),
                None => PlayerEvent::Other(EVENT_PROPERTY_CHANGE.to_string()),
            },
            EVENT_SEEK => PlayerEvent::Playback(PlaybackEvent::SeekOccurred),
            other => PlayerEvent::Other(other.to_string()),
        }
    }
}

/// Observed string properties arrive as JSON strings, but be lenient about
/// booleans and numbers. `null` (property unavailable) maps to an empty string.
fn data_as_string(data: Option<&Value>) -> String {
    match data {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}
