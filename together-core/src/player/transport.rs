//! Byte-stream transport to the player's control endpoint
//!
//! Unix domain sockets on unix, named pipes on Windows.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::debug;

/// Directory/namespace prefix for control endpoints
#[cfg(unix)]
pub const ENDPOINT_PREFIX: &str = "/tmp/";

/// Directory/namespace prefix for control endpoints
#[cfg(windows)]
pub const ENDPOINT_PREFIX: &str = r"\\.\pipe\";

/// How often to retry while waiting for the endpoint to appear
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Anything we can read player lines from and write requests to
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Opens a byte stream for a logical endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, endpoint: &str) -> io::Result<Box<dyn ByteStream>>;
}

/// Platform IPC transport (unix socket / named pipe)
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcTransport;

#[cfg(unix)]
#[async_trait]
impl Transport for IpcTransport {
    async fn dial(&self, endpoint: &str) -> io::Result<Box<dyn ByteStream>> {
        let stream = tokio::net::UnixStream::connect(endpoint).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(windows)]
#[async_trait]
impl Transport for IpcTransport {
    async fn dial(&self, endpoint: &str) -> io::Result<Box<dyn ByteStream>> {
        let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint)?;
        Ok(Box::new(pipe))
    }
}

/// Build the endpoint path for a logical name.
///
/// The process id keeps concurrent instances on one machine apart.
pub fn endpoint_name(logical_name: &str) -> String {
    format!("{}{}-{}", ENDPOINT_PREFIX, logical_name, std::process::id())
}

/// Dial `endpoint` until it accepts or `grace` runs out.
///
/// The player creates its endpoint some time after launch; an endpoint that
/// never shows up is a startup failure.
pub async fn wait_for_endpoint(
    transport: &dyn Transport,
    endpoint: &str,
    grace: Duration,
) -> io::Result<Box<dyn ByteStream>> {
    let deadline = Instant::now() + grace;
    loop {
        match transport.dial(endpoint).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() + DIAL_RETRY_INTERVAL < deadline => {
                debug!("Control endpoint {} not ready yet: {}", endpoint, e);
                tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("control endpoint {} did not appear within {:?}: {}", endpoint, grace, e),
                ))
            }
        }
    }
}
