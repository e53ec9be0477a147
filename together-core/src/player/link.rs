//! Persistent control link to the local player

use rand::Rng;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::transport::{ByteStream, Transport};
use super::types::{Command, PlayerEvent, OBSERVED_PROPERTIES};

/// Errors on the player control link
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Player stream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode player request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Player closed the control stream")]
    Closed,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write side of the control connection.
///
/// Requests are serialized by an internal lock so lines never interleave.
pub struct PlayerLink {
    writer: Mutex<BoxedWriter>,
}

/// Read side of the control connection: the player's asynchronous event feed
pub struct PlayerEvents {
    lines: Lines<BufReader<BoxedReader>>,
}

impl PlayerLink {
    /// Split one duplex stream into a link and its event feed
    pub fn new<S>(stream: S) -> (Self, PlayerEvents)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer)
    }

    /// Build a link from separate read and write streams
    pub fn from_parts<R, W>(reader: R, writer: W) -> (Self, PlayerEvents)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let link = Self {
            writer: Mutex::new(Box::new(writer)),
        };
        let events = PlayerEvents {
            lines: BufReader::new(reader).lines(),
        };
        (link, events)
    }

    /// Dial the player's endpoint through `transport`
    pub async fn connect(
        transport: &dyn Transport,
        endpoint: &str,
    ) -> Result<(Self, PlayerEvents), LinkError> {
        let stream: Box<dyn ByteStream> = transport.dial(endpoint).await?;
        Ok(Self::new(stream))
    }

    /// Send one control request
    #[instrument(skip(self))]
    pub async fn send(&self, command: &Command) -> Result<(), LinkError> {
        let request_id = rand::thread_rng().gen_range(0..i64::MAX);
        let mut line = serde_json::to_vec(&command.into_request(request_id))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        debug!("-> {}", String::from_utf8_lossy(&line[..line.len() - 1]));
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Register property observation. Needed once per new link.
    pub async fn observe(&self) -> Result<(), LinkError> {
        for (id, property) in OBSERVED_PROPERTIES {
            self.send(&Command::Observe {
                id: *id,
                property: property.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> Result<(), LinkError> {
        self.send(&Command::SetPause(paused)).await
    }

    /// Ask for a property. The reply arrives on the event stream untagged.
    pub async fn get_property(&self, property: &str) -> Result<(), LinkError> {
        self.send(&Command::GetProperty(property.to_string())).await
    }

    /// Close the write side of the link
    pub async fn close(&self) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

impl PlayerEvents {
    /// Next raw line, `None` once the player closed the stream
    pub async fn next_line(&mut self) -> Result<Option<String>, LinkError> {
        Ok(self.lines.next_line().await?)
    }

    /// Next decoded event, `None` once the player closed the stream
    pub async fn next_event(&mut self) -> Result<Option<PlayerEvent>, LinkError> {
        loop {
            match self.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(PlayerEvent::parse(&line))),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::PlaybackEvent;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_send_writes_one_json_line() {
        let (local, remote) = tokio::io::duplex(4096);
        let (link, _events) = PlayerLink::new(local);

        link.set_pause(true).await.unwrap();

        let (mut player_rx, _player_tx) = tokio::io::split(remote);
        let mut buf = vec![0u8; 4096];
        let n = player_rx.read(&mut buf).await.unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();

        assert!(text.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["command"], serde_json::json!(["set_property", "pause", true]));
        assert!(value["request_id"].is_i64());
    }

    #[tokio::test]
    async fn test_get_property_request() {
        let (local, remote) = tokio::io::duplex(4096);
        let (link, _events) = PlayerLink::new(local);

        link.get_property("filename").await.unwrap();
        link.close().await.unwrap();

        let (player_rx, _player_tx) = tokio::io::split(remote);
        let line = BufReader::new(player_rx).lines().next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["command"], serde_json::json!(["get_property", "filename"]));
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (link, _events) = PlayerLink::new(local);
        let link = std::sync::Arc::new(link);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let link = link.clone();
            tasks.push(tokio::spawn(async move {
                link.send(&Command::SetPosition(format!("{}.5", i))).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        link.close().await.unwrap();

        let (player_rx, _player_tx) = tokio::io::split(remote);
        let mut lines = BufReader::new(player_rx).lines();
        let mut count = 0;
        while let Some(line) = lines.next_line().await.unwrap() {
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["command"][1], "percent-pos");
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[tokio::test]
    async fn test_events_end_when_player_exits() {
        let (local, remote) = tokio::io::duplex(4096);
        let (_link, mut events) = PlayerLink::new(local);

        let (_player_rx, mut player_tx) = tokio::io::split(remote);
        player_tx
            .write_all(b"{\"event\":\"property-change\",\"id\":1,\"name\":\"pause\",\"data\":\"yes\"}\n\n{\"event\":\"seek\"}\n")
            .await
            .unwrap();
        drop(player_tx);
        drop(_player_rx);

        assert_eq!(
            events.next_event().await.unwrap(),
            Some(PlayerEvent::Playback(PlaybackEvent::PauseChanged(true)))
        );
        assert_eq!(
            events.next_event().await.unwrap(),
            Some(PlayerEvent::Playback(PlaybackEvent::SeekOccurred))
        );
        assert_eq!(events.next_event().await.unwrap(), None);
    }
}
