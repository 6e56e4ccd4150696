//! Transport Capabilities
//!
//! The proxy core never talks to the network directly. Everything it needs
//! from the overlay client (listen, dial, certificates, peer status) goes
//! through the traits in this module.

pub mod direct;

use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, SidecarError};

pub use direct::DirectTransport;

/// A bidirectional byte stream
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Owned, type-erased connection
pub type BoxConnection = Box<dyn Connection>;

/// Transport protocol requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = SidecarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            other => Err(SidecarError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// A connection handed out by a [`Listener`]
pub struct Accepted {
    pub connection: BoxConnection,

    /// Human-readable origin (socket address or peer id)
    pub remote: String,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Source of inbound connections
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next connection.
    ///
    /// `Ok(None)` means the listener is closed for good; errors are transient.
    async fn accept(&mut self) -> io::Result<Option<Accepted>>;

    /// Local socket address, if the listener is backed by one
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// TLS handshake details a certificate is chosen by
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Server Name Indication sent by the client
    pub server_name: Option<String>,

    /// ALPN protocols offered by the client
    pub alpn: Vec<Vec<u8>>,
}

impl HandshakeInfo {
    pub fn for_server_name(name: impl Into<String>) -> Self {
        Self {
            server_name: Some(name.into()),
            alpn: Vec::new(),
        }
    }
}

/// Issues TLS certificates during handshakes.
///
/// Called synchronously from the handshake; may block on the identity service.
pub trait CertificateProvider: Send + Sync + fmt::Debug {
    fn certificate_for(&self, handshake: &HandshakeInfo) -> Result<Arc<CertifiedKey>>;
}

/// Status of one overlay peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer_id: String,
    pub hostname: Option<String>,
    pub addresses: Vec<String>,
    pub connected: bool,
    pub connected_for: Duration,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) connected={} addrs=[{}]",
            self.peer_id,
            self.hostname.as_deref().unwrap_or("?"),
            self.connected,
            self.addresses.join(", ")
        )
    }
}

/// Capability surface consumed by the proxy core
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a listener on a local address such as `":8443"`
    async fn listen(&self, protocol: Protocol, addr: &str) -> Result<Box<dyn Listener>>;

    /// Connect to `host:port` through the transport
    async fn dial(&self, protocol: Protocol, addr: &str) -> Result<BoxConnection>;

    /// Certificate source for TLS termination
    fn certificates(&self) -> Arc<dyn CertificateProvider>;

    /// Snapshot of known peers
    async fn peer_status(&self) -> Result<Vec<PeerStatus>>;
}

/// Parse the port out of a listen address (`":8443"`, `"0.0.0.0:8443"`)
pub fn listen_port(addr: &str) -> Option<u16> {
    addr.rsplit_once(':')?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_port() {
        assert_eq!(listen_port(":8443"), Some(8443));
        assert_eq!(listen_port("0.0.0.0:22"), Some(22));
        assert_eq!(listen_port("[::]:2222"), Some(2222));
        assert_eq!(listen_port("8443"), None);
        assert_eq!(listen_port(":http"), None);
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!(" TCP ".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!(Protocol::Tcp.to_string(), "tcp");

        for name in ["udp", "quic", ""] {
            assert!(matches!(
                name.parse::<Protocol>(),
                Err(SidecarError::UnsupportedProtocol(_))
            ));
        }
    }

    #[test]
    fn test_peer_status_display() {
        let status = PeerStatus {
            peer_id: "12D3Koo".to_string(),
            hostname: Some("db".to_string()),
            addresses: vec!["/ip4/10.0.0.5/udp/4001/quic-v1".to_string()],
            connected: true,
            connected_for: Duration::from_secs(5),
        };
        assert_eq!(
            status.to_string(),
            "12D3Koo (db) connected=true addrs=[/ip4/10.0.0.5/udp/4001/quic-v1]"
        );
    }
}
