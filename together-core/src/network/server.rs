//! Gossip Server
//!
//! Accepts `/hi`, `/event` and `/bye` from other peers, keeps the registry
//! current and hands accepted payloads to the inbound queue.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::*;
use super::registry::{Delivery, JoinOutcome, PeerRegistry};
use crate::config::NodeConfig;

type GossipResponse = Response<Full<Bytes>>;

/// Server side of the gossip protocol
pub struct GossipServer {
    registry: Arc<PeerRegistry>,
    client: PeerClient,
    inbound: mpsc::Sender<Vec<u8>>,
    max_body: usize,
    read_timeout: Duration,
    fanout_limit: usize,
}

impl GossipServer {
    pub fn new(
        registry: Arc<PeerRegistry>,
        client: PeerClient,
        inbound: mpsc::Sender<Vec<u8>>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            registry,
            client,
            inbound,
            max_body: config.max_body_bytes,
            read_timeout: config.request_timeout,
            fanout_limit: config.fanout_limit.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    /// A peer announced itself.
    ///
    /// The first time we hear from a peer we also join it ourselves in the
    /// background, which pulls in any peers it knows that we don't.
    pub fn on_join(self: &Arc<Self>, addr: &str, counter: u64, hostname: &str) -> JoinOutcome {
        let outcome = self.registry.join(addr, counter, hostname);

        if outcome.is_new {
            let server = Arc::clone(self);
            let addr = addr.to_string();
            tokio::spawn(async move {
                if let Err(e) = server.add_address(&addr).await {
                    warn!("Reverse join to {} failed: {}", addr, e);
                }
            });
        }

        outcome
    }

    /// A peer is leaving
    pub fn on_leave(&self, addr: &str) {
        self.registry.leave(addr);
    }

    /// A peer delivered one payload
    pub async fn on_event(&self, addr: &str, counter: u64, payload: Vec<u8>) -> Delivery {
        let delivery = self.registry.accept_delivery(addr, counter);
        match delivery {
            Delivery::Accepted => {
                debug!("Accepted round {} from {}", counter, addr);
                // Awaiting capacity slows the sender down instead of dropping
                if self.inbound.send(payload).await.is_err() {
                    warn!("Inbound queue closed, dropping round {} from {}", counter, addr);
                }
            }
            Delivery::Stale { last } => {
                debug!("Discarding stale round {} from {} (last {})", counter, addr, last);
            }
            Delivery::Unknown => {
                warn!("Event from unknown peer {}", addr);
            }
        }
        delivery
    }

    /// Join `addr` and back-fill the peers it knows about.
    ///
    /// Returns how many peers were newly registered.
    #[instrument(skip(self))]
    pub async fn add_address(&self, addr: &str) -> Result<usize, GossipError> {
        let reply = self.client.hi(addr, self.registry.counter()).await?;
        let mut added = usize::from(self.registry.insert(addr, reply.counter, &reply.hostname));

        let unknown: Vec<String> = reply
            .peers
            .keys()
            .filter(|peer| peer.as_str() != self.registry.self_address() && !self.registry.contains(peer))
            .cloned()
            .collect();

        if !unknown.is_empty() {
            debug!("Back-filling {} peers learned from {}", unknown.len(), addr);
        }

        let results: Vec<_> = stream::iter(unknown)
            .map(|peer| async move {
                let result = self.client.hi(&peer, self.registry.counter()).await;
                (peer, result)
            })
            .buffer_unordered(self.fanout_limit)
            .collect()
            .await;

        for (peer, result) in results {
            match result {
                Ok(reply) => {
                    if self.registry.insert(&peer, reply.counter, &reply.hostname) {
                        added += 1;
                    }
                }
                Err(e) => warn!("Could not join {} (learned from {}): {}", peer, addr, e),
            }
        }

        info!("Joined {}, {} new peers, {} known", addr, added, self.registry.len());
        Ok(added)
    }

    /// Accept connections until cancelled. Accept failures are fatal.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<(), GossipError> {
        if let Ok(local) = listener.local_addr() {
            info!("Gossip server listening on {} as {}", local, self.registry.self_address());
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Gossip server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, remote) = accepted?;
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_connection(stream).await {
                            debug!("Connection from {} failed: {}", remote, e);
                        }
                    });
                }
            }
        }
    }

    /// One request per connection
    async fn serve_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), hyper::Error> {
        let read_timeout = self.read_timeout;
        let service = service_fn(move |request| {
            let server = Arc::clone(&self);
            async move { Ok::<_, Infallible>(server.handle(request).await) }
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(read_timeout)
            .keep_alive(false)
            .serve_connection(TokioIo::new(stream), service)
            .await
    }

    async fn handle(self: &Arc<Self>, request: Request<Incoming>) -> GossipResponse {
        let (parts, body) = request.into_parts();

        let result = match (&parts.method, parts.uri.path()) {
            (&Method::POST, PATH_HI) => self.handle_hi(&parts.headers),
            (&Method::POST, PATH_EVENT) => match self.read_body(body).await {
                Ok(payload) => self.handle_event(&parts.headers, payload).await,
                Err(response) => return response,
            },
            (&Method::POST, PATH_BYE) => self.handle_bye(&parts.headers),
            (method, PATH_HI | PATH_EVENT | PATH_BYE) => {
                return respond(StatusCode::METHOD_NOT_ALLOWED, format!("{} not allowed", method));
            }
            (_, other) => {
                warn!("Request for unknown path {}", other);
                return respond(StatusCode::NOT_FOUND, format!("no such endpoint {}", other));
            }
        };

        result.unwrap_or_else(|e| {
            warn!("Bad gossip request: {}", e);
            respond(StatusCode::BAD_REQUEST, e.to_string())
        })
    }

    /// Collect a request body no larger than `max_body`
    async fn read_body(&self, body: Incoming) -> Result<Vec<u8>, GossipResponse> {
        let collected = tokio::time::timeout(self.read_timeout, Limited::new(body, self.max_body).collect()).await;
        match collected {
            Ok(Ok(collected)) => Ok(collected.to_bytes().to_vec()),
            Ok(Err(e)) if e.is::<LengthLimitError>() => {
                warn!("Rejecting body over {} bytes", self.max_body);
                Err(respond(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()))
            }
            Ok(Err(e)) => {
                debug!("Failed to read request body: {}", e);
                Err(respond(StatusCode::BAD_REQUEST, e.to_string()))
            }
            Err(_) => Err(respond(StatusCode::REQUEST_TIMEOUT, "timed out reading body")),
        }
    }

    fn handle_hi(self: &Arc<Self>, headers: &HeaderMap) -> Result<GossipResponse, GossipError> {
        let addr = peer_address(headers)?;
        let counter = peer_counter(headers)?;
        let hostname = header_str(headers, HEADER_PEER_HOSTNAME).unwrap_or_default();

        let outcome = self.on_join(addr, counter, hostname);
        let body = serde_json::to_vec(&outcome.peers)?;

        let mut response = respond(StatusCode::OK, body);
        let response_headers = response.headers_mut();
        response_headers.insert(HEADER_COUNTER, HeaderValue::from(outcome.counter));
        if let Ok(hostname) = HeaderValue::from_str(&outcome.hostname) {
            response_headers.insert(HEADER_HOSTNAME, hostname);
        }
        response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(response)
    }

    async fn handle_event(&self, headers: &HeaderMap, payload: Vec<u8>) -> Result<GossipResponse, GossipError> {
        let addr = peer_address(headers)?;
        let counter = peer_counter(headers)?;

        match self.on_event(addr, counter, payload).await {
            Delivery::Accepted | Delivery::Stale { .. } => Ok(respond(StatusCode::NO_CONTENT, Bytes::new())),
            Delivery::Unknown => Ok(respond(StatusCode::BAD_REQUEST, format!("unknown peer {}", addr))),
        }
    }

    fn handle_bye(&self, headers: &HeaderMap) -> Result<GossipResponse, GossipError> {
        let addr = peer_address(headers)?;
        self.on_leave(addr);
        Ok(respond(StatusCode::NO_CONTENT, Bytes::new()))
    }
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> GossipResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn peer_address(headers: &HeaderMap) -> Result<&str, GossipError> {
    match header_str(headers, HEADER_PEER_ADDRESS) {
        Some(addr) if !addr.is_empty() => Ok(addr),
        Some(_) => Err(GossipError::InvalidHeader {
            name: HEADER_PEER_ADDRESS,
            value: String::new(),
        }),
        None => Err(GossipError::MissingHeader(HEADER_PEER_ADDRESS)),
    }
}

fn peer_counter(headers: &HeaderMap) -> Result<u64, GossipError> {
    let value = header_str(headers, HEADER_PEER_COUNTER).ok_or(GossipError::MissingHeader(HEADER_PEER_COUNTER))?;
    value.trim().parse().map_err(|_| GossipError::InvalidHeader {
        name: HEADER_PEER_COUNTER,
        value: value.to_string(),
    })
}

/// A live gossip server on loopback
#[cfg(test)]
pub(crate) struct TestNode {
    pub server: Arc<GossipServer>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub addr: String,
    pub cancel: CancellationToken,
}

#[cfg(test)]
impl TestNode {
    pub async fn start(name: &str) -> Self {
        Self::start_with(name, &NodeConfig::default()).await
    }

    pub async fn start_with(name: &str, config: &NodeConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let registry = Arc::new(PeerRegistry::new(&addr, name));
        let client = PeerClient::new(&addr, name, config).unwrap();
        let (tx, inbound) = mpsc::channel(16);
        let server = Arc::new(GossipServer::new(registry, client, tx, config));

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&server).serve(listener, cancel.clone()));

        Self {
            server,
            inbound,
            addr,
            cancel,
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        self.server.registry()
    }
}

/// Poll `condition` for up to two seconds
#[cfg(test)]
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Give background reverse joins time to finish
#[cfg(test)]
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
