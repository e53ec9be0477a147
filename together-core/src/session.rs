//! Session
//!
//! Owns one node's lifetime: the gossip listener, the broadcaster and the
//! player bridge, all tied to a single cancellation token.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::network::{Broadcaster, GossipError, GossipServer, PeerClient, PeerRegistry, PortMapError, PortMapper};
use crate::player::{wait_for_endpoint, ByteStream, LinkError, PlayerEvents, PlayerLink, Transport};
use crate::sync::PlayerBridge;

/// Errors that end a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to bind gossip listener: {0}")]
    Bind(#[source] io::Error),

    #[error("Player link failed: {0}")]
    Link(#[from] LinkError),

    #[error("Port mapping failed: {0}")]
    PortMapping(#[from] PortMapError),

    #[error("Player endpoint {endpoint} unavailable: {source}")]
    EndpointUnavailable {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Gossip failure: {0}")]
    Gossip(#[from] GossipError),
}

/// Wait for the player's control endpoint, failing after `grace`
pub async fn open_player(
    transport: &dyn Transport,
    endpoint: &str,
    grace: Duration,
) -> Result<Box<dyn ByteStream>, SessionError> {
    wait_for_endpoint(transport, endpoint, grace)
        .await
        .map_err(|source| SessionError::EndpointUnavailable {
            endpoint: endpoint.to_string(),
            source,
        })
}

/// A bound but not yet running node
pub struct Session {
    registry: Arc<PeerRegistry>,
    server: Arc<GossipServer>,
    broadcaster: Arc<Broadcaster>,
    bridge: Arc<PlayerBridge>,
    events: PlayerEvents,
    listener: TcpListener,
    port: u16,
    port_mapper: Arc<dyn PortMapper>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
}

impl Session {
    /// Bind the gossip listener and wire every component to `player`
    pub async fn bind(
        config: NodeConfig,
        player: Box<dyn ByteStream>,
        port_mapper: Arc<dyn PortMapper>,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        let listener = TcpListener::bind(config.listen).await.map_err(SessionError::Bind)?;
        let port = listener.local_addr().map_err(SessionError::Bind)?.port();

        let self_address = match &config.advertise {
            Some(address) => address.clone(),
            None => SocketAddr::new(port_mapper.external_address().await?, port).to_string(),
        };
        let self_hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        info!("Node {} ({}) bound on port {}", self_address, self_hostname, port);

        let registry = Arc::new(PeerRegistry::new(self_address.clone(), self_hostname.clone()));
        let client = PeerClient::new(self_address, self_hostname, &config)?;

        let capacity = config.queue_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

        let server = Arc::new(GossipServer::new(Arc::clone(&registry), client.clone(), inbound_tx, &config));
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry), client, &config));

        let (link, events) = PlayerLink::new(player);
        let bridge = Arc::new(PlayerBridge::new(Arc::new(link)));

        // Last fallible step, so nothing above can leave a mapping behind
        port_mapper.add_mapping(port).await?;

        Ok(Self {
            registry,
            server,
            broadcaster,
            bridge,
            events,
            listener,
            port,
            port_mapper,
            outbound_tx,
            outbound_rx,
            inbound_rx,
            cancel,
        })
    }

    pub fn self_address(&self) -> &str {
        self.registry.self_address()
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn bridge(&self) -> Arc<PlayerBridge> {
        Arc::clone(&self.bridge)
    }

    /// Run until the player exits, the listener fails or the token is cancelled.
    ///
    /// `initial_peers` are joined in the background; failures are logged.
    pub async fn run(self, initial_peers: Vec<String>) -> Result<(), SessionError> {
        let Session {
            registry,
            server,
            broadcaster,
            bridge,
            events,
            listener,
            port,
            port_mapper,
            outbound_tx,
            outbound_rx,
            inbound_rx,
            cancel,
        } = self;

        let link = bridge.link();
        let setup = async {
            link.observe().await?;
            link.get_property("filename").await
        };
        if let Err(e) = setup.await {
            error!("Could not set up player link: {}", e);
            release_mapping(port_mapper.as_ref(), port).await;
            return Err(SessionError::from(e));
        }

        let mut server_task = tokio::spawn(Arc::clone(&server).serve(listener, cancel.clone()));

        let broadcaster_task = {
            let broadcaster = Arc::clone(&broadcaster);
            let cancel = cancel.clone();
            tokio::spawn(async move { broadcaster.run(outbound_rx, cancel).await })
        };

        let applier_task = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.run_applier(inbound_rx).await })
        };

        if !initial_peers.is_empty() {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                for peer in initial_peers {
                    if let Err(e) = server.add_address(&peer).await {
                        warn!("Could not join {}: {}", peer, e);
                    }
                }
            });
        }

        let mut server_done = false;
        let result = tokio::select! {
            observed = bridge.run_observer(events, outbound_tx) => match observed {
                Ok(()) | Err(LinkError::Closed) => {
                    info!("Player went away, leaving");
                    Ok(())
                }
                Err(e) => {
                    error!("Player link failed: {}", e);
                    Err(SessionError::from(e))
                }
            },
            _ = cancel.cancelled() => {
                info!("Session cancelled");
                Ok(())
            }
            served = &mut server_task => {
                server_done = true;
                match served {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!("Gossip server failed: {}", e);
                        Err(SessionError::from(e))
                    }
                    Err(e) => {
                        error!("Gossip server task died: {}", e);
                        Ok(())
                    }
                }
            }
        };

        cancel.cancel();

        if let Err(e) = broadcaster_task.await {
            warn!("Broadcaster task died: {}", e);
        }
        broadcaster.shutdown().await;
        applier_task.abort();
        if !server_done {
            let _ = server_task.await;
        }

        release_mapping(port_mapper.as_ref(), port).await;
        if let Err(e) = bridge.link().close().await {
            warn!("Could not close player link: {}", e);
        }

        info!("Session for {} ended with {} known peers", registry.self_address(), registry.len());
        result
    }
}

async fn release_mapping(port_mapper: &dyn PortMapper, port: u16) {
    if let Err(e) = port_mapper.delete_mapping(port).await {
        warn!("Could not remove port mapping for {}: {}", port, e);
    }
}
