//! Gossip HTTP Client
//!
//! The calling side of the three gossip operations.

use std::io;

use reqwest::header::HeaderMap;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, instrument};

use super::registry::PeerMap;
use crate::config::NodeConfig;

pub const PATH_HI: &str = "/hi";
pub const PATH_EVENT: &str = "/event";
pub const PATH_BYE: &str = "/bye";

pub const HEADER_PEER_ADDRESS: &str = "peer-address";
pub const HEADER_PEER_COUNTER: &str = "peer-counter";
pub const HEADER_PEER_HOSTNAME: &str = "peer-hostname";
pub const HEADER_COUNTER: &str = "counter";
pub const HEADER_HOSTNAME: &str = "hostname";

/// Errors from talking to another peer
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{addr}{path} answered HTTP {status}")]
    Status {
        addr: String,
        path: &'static str,
        status: u16,
    },

    #[error("Missing header {0}")]
    MissingHeader(&'static str),

    #[error("Invalid header {name}: {value:?}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("Invalid peer map: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What a peer tells us when we join it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinReply {
    pub counter: u64,
    pub hostname: String,
    pub peers: PeerMap,
}

/// Client for the gossip endpoints of other peers
#[derive(Debug, Clone)]
pub struct PeerClient {
    http: Client,
    self_address: String,
    self_hostname: String,
}

impl PeerClient {
    pub fn new(
        self_address: impl Into<String>,
        self_hostname: impl Into<String>,
        config: &NodeConfig,
    ) -> Result<Self, GossipError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            self_address: self_address.into(),
            self_hostname: self_hostname.into(),
        })
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    fn post(&self, addr: &str, path: &str, counter: u64) -> reqwest::RequestBuilder {
        self.http
            .post(format!("http://{}{}", addr, path))
            .header(HEADER_PEER_ADDRESS, &self.self_address)
            .header(HEADER_PEER_COUNTER, counter.to_string())
    }

    /// Join `addr`: announce ourselves and learn its counter and peers
    #[instrument(skip(self))]
    pub async fn hi(&self, addr: &str, counter: u64) -> Result<JoinReply, GossipError> {
        let resp = self
            .post(addr, PATH_HI, counter)
            .header(HEADER_PEER_HOSTNAME, &self.self_hostname)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GossipError::Status {
                addr: addr.to_string(),
                path: PATH_HI,
                status: status.as_u16(),
            });
        }

        let remote_counter = parse_counter(resp.headers())?;
        let hostname = resp
            .headers()
            .get(HEADER_HOSTNAME)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = resp.bytes().await?;
        let peers = if body.iter().all(|b| b.is_ascii_whitespace()) {
            PeerMap::new()
        } else {
            serde_json::from_slice(&body)?
        };

        debug!("Joined {} ({}) at counter {}, {} peers", addr, hostname, remote_counter, peers.len());
        Ok(JoinReply {
            counter: remote_counter,
            hostname,
            peers,
        })
    }

    /// Deliver one payload to `addr` under round `counter`
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn event(&self, addr: &str, counter: u64, payload: &[u8]) -> Result<(), GossipError> {
        let resp = self
            .post(addr, PATH_EVENT, counter)
            .body(payload.to_vec())
            .send()
            .await?;

        match resp.status() {
            status if status.is_success() => Ok(()),
            status => Err(GossipError::Status {
                addr: addr.to_string(),
                path: PATH_EVENT,
                status: status.as_u16(),
            }),
        }
    }

    /// Tell `addr` we are leaving
    #[instrument(skip(self))]
    pub async fn bye(&self, addr: &str, counter: u64) -> Result<(), GossipError> {
        let resp = self.post(addr, PATH_BYE, counter).send().await?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            status => Err(GossipError::Status {
                addr: addr.to_string(),
                path: PATH_BYE,
                status: status.as_u16(),
            }),
        }
    }
}

fn parse_counter(headers: &HeaderMap) -> Result<u64, GossipError> {
    let value = headers
        .get(HEADER_COUNTER)
        .ok_or(GossipError::MissingHeader(HEADER_COUNTER))?;
    let text = value.to_str().unwrap_or_default();
    text.trim().parse().map_err(|_| GossipError::InvalidHeader {
        name: HEADER_COUNTER,
        value: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_counter_header() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            parse_counter(&headers),
            Err(GossipError::MissingHeader(HEADER_COUNTER))
        ));

        headers.insert(HEADER_COUNTER, HeaderValue::from_static("12"));
        assert_eq!(parse_counter(&headers).unwrap(), 12);

        headers.insert(HEADER_COUNTER, HeaderValue::from_static("-1"));
        assert!(matches!(parse_counter(&headers), Err(GossipError::InvalidHeader { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_an_error() {
        let client = PeerClient::new("127.0.0.1:9", "me", &NodeConfig::default()).unwrap();
        // Port 1 on loopback is closed
        let err = client.event("127.0.0.1:1", 1, b"{}").await.unwrap_err();
        assert!(matches!(err, GossipError::Http(_)));
    }

    /// Serve every connection on loopback with `respond`, returning the address
    async fn serve_fixed(
        respond: fn() -> hyper::Response<http_body_util::Full<hyper::body::Bytes>>,
    ) -> String {
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(move |_req| async move { Ok::<_, std::convert::Infallible>(respond()) });
                    let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_join_accepts_any_success_status() {
        let addr = serve_fixed(|| {
            hyper::Response::builder()
                .status(204)
                .header(HEADER_COUNTER, "4")
                .header(HEADER_HOSTNAME, "quiet")
                .body(http_body_util::Full::new(hyper::body::Bytes::new()))
                .unwrap()
        })
        .await;

        let client = PeerClient::new("127.0.0.1:9", "me", &NodeConfig::default()).unwrap();
        let reply = client.hi(&addr, 0).await.unwrap();
        assert_eq!(reply.counter, 4);
        assert_eq!(reply.hostname, "quiet");
        assert!(reply.peers.is_empty());
    }

    #[tokio::test]
    async fn test_join_rejects_failure_status() {
        let addr = serve_fixed(|| {
            hyper::Response::builder()
                .status(503)
                .body(http_body_util::Full::new(hyper::body::Bytes::new()))
                .unwrap()
        })
        .await;

        let client = PeerClient::new("127.0.0.1:9", "me", &NodeConfig::default()).unwrap();
        let err = client.hi(&addr, 0).await.unwrap_err();
        assert!(matches!(err, GossipError::Status { status: 503, path: PATH_HI, .. }));
    }
}
