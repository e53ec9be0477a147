//! Port mapping seam
//!
//! Peers behind NAT need an inbound mapping for the gossip port and an address
//! others can reach. Only the local-network mapper lives here; real router
//! protocols plug in through [`PortMapper`].

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PortMapError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Port mapping unavailable: {0}")]
    Unavailable(String),
}

/// Opens the gossip port to the outside and reports our reachable address
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn add_mapping(&self, port: u16) -> Result<(), PortMapError>;

    async fn delete_mapping(&self, port: u16) -> Result<(), PortMapError>;

    async fn external_address(&self) -> Result<IpAddr, PortMapError>;
}

/// No router involved: the address is fixed or taken from the local interface
#[derive(Debug, Clone, Default)]
pub struct StaticPortMapper {
    ip: Option<IpAddr>,
}

impl StaticPortMapper {
    /// Always report `ip`
    pub fn new(ip: IpAddr) -> Self {
        Self { ip: Some(ip) }
    }

    /// Report the address of the interface that routes outward
    pub fn discover() -> Self {
        Self { ip: None }
    }
}

#[async_trait]
impl PortMapper for StaticPortMapper {
    async fn add_mapping(&self, port: u16) -> Result<(), PortMapError> {
        debug!("No port mapping needed for {}", port);
        Ok(())
    }

    async fn delete_mapping(&self, _port: u16) -> Result<(), PortMapError> {
        Ok(())
    }

    async fn external_address(&self) -> Result<IpAddr, PortMapError> {
        match self.ip {
            Some(ip) => Ok(ip),
            None => local_ip().await,
        }
    }
}

/// Address of the interface the OS would route public traffic through.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub async fn local_ip() -> Result<IpAddr, PortMapError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(PortMapError::Unavailable("no route to the outside".to_string()));
    }
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_static_mapper_reports_fixed_address() {
        let mapper = StaticPortMapper::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        mapper.add_mapping(8080).await.unwrap();
        assert_eq!(mapper.external_address().await.unwrap(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        mapper.delete_mapping(8080).await.unwrap();
    }
}
