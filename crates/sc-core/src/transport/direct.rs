//! Direct Transport
//!
//! Plain host TCP, no overlay. Listeners bind on the host interface and
//! destinations are reached with an ordinary TCP connect.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{Accepted, BoxConnection, CertificateProvider, Listener, PeerStatus, Protocol, Transport};
use crate::error::{Result, SidecarError};
use crate::tls::IdentityCertificates;

/// Transport over the host network stack
#[derive(Debug, Clone)]
pub struct DirectTransport {
    /// Host address listeners bind on
    bind_host: String,

    /// Certificates for TLS termination
    certificates: Arc<dyn CertificateProvider>,
}

impl DirectTransport {
    /// Create a transport binding on all interfaces, issuing certificates for `hostname`
    pub fn new(hostname: &str) -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            certificates: Arc::new(IdentityCertificates::new(hostname)),
        }
    }

    /// Builder pattern: set the bind host
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Builder pattern: use a specific certificate provider
    pub fn with_certificates(mut self, certificates: Arc<dyn CertificateProvider>) -> Self {
        self.certificates = certificates;
        self
    }

    /// Host address listeners bind on
    pub fn bind_host(&self) -> &str {
        &self.bind_host
    }
}

/// Bind a host TCP listener for `addr`, filling in `bind_host` when the host part is empty
pub(crate) async fn bind_tcp(bind_host: &str, addr: &str) -> Result<TcpListener> {
    let port = super::listen_port(addr).ok_or_else(|| {
        SidecarError::ConfigError(format!("Invalid listen address: {}", addr))
    })?;

    let bind_addr = match addr.rsplit_once(':') {
        Some(("", _)) => host_port(bind_host, port),
        _ => addr.to_string(),
    };

    TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| SidecarError::PortBindFailed {
            port,
            reason: e.to_string(),
        })
}

fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn listen(&self, protocol: Protocol, addr: &str) -> Result<Box<dyn Listener>> {
        match protocol {
            Protocol::Tcp => {
                let listener = bind_tcp(&self.bind_host, addr).await?;
                debug!("Direct listener bound on {:?}", listener.local_addr().ok());
                Ok(Box::new(TcpAcceptor { listener }))
            }
        }
    }

    async fn dial(&self, protocol: Protocol, addr: &str) -> Result<BoxConnection> {
        match protocol {
            Protocol::Tcp => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| SidecarError::dial(addr, e))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    fn certificates(&self) -> Arc<dyn CertificateProvider> {
        Arc::clone(&self.certificates)
    }

    async fn peer_status(&self) -> Result<Vec<PeerStatus>> {
        Ok(Vec::new())
    }
}

/// Listener over a host TCP socket
pub(crate) struct TcpAcceptor {
    pub(crate) listener: TcpListener,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&mut self) -> io::Result<Option<Accepted>> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Some(Accepted {
            connection: Box::new(stream),
            remote: addr.to_string(),
        }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}
