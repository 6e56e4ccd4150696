//! TLS termination
//!
//! Wraps accepted connections in a rustls server session whose certificate is
//! resolved per handshake by a [`CertificateProvider`].

pub mod certs;

use rustls::server::{ClientHello, ResolvesServerCert, ServerConfig};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{trace, warn};

use crate::error::{Result, SidecarError};
use crate::transport::{BoxConnection, CertificateProvider, HandshakeInfo};

pub use certs::{IdentityCertificates, certified_key_from_pem};

/// Adapts a [`CertificateProvider`] to rustls' resolver interface
struct ProviderResolver {
    provider: Arc<dyn CertificateProvider>,
}

impl fmt::Debug for ProviderResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderResolver")
            .field("provider", &self.provider)
            .finish()
    }
}

impl ResolvesServerCert for ProviderResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let handshake = HandshakeInfo {
            server_name: client_hello.server_name().map(str::to_string),
            alpn: client_hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
        };

        match self.provider.certificate_for(&handshake) {
            Ok(key) => {
                trace!("Resolved certificate for {:?}", handshake.server_name);
                Some(key)
            }
            Err(e) => {
                warn!("No certificate for {:?}: {}", handshake.server_name, e);
                None
            }
        }
    }
}

/// Server-side TLS wrapper for accepted connections
#[derive(Clone)]
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
}

impl TlsTerminator {
    /// Build a terminator resolving certificates lazily through `provider`
    pub fn new(provider: Arc<dyn CertificateProvider>) -> Result<Self> {
        let resolver = Arc::new(ProviderResolver { provider });

        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Complete the server handshake on `connection` within `timeout`
    pub async fn accept(&self, connection: BoxConnection, timeout: Duration) -> Result<BoxConnection> {
        match tokio::time::timeout(timeout, self.acceptor.accept(connection)).await {
            Ok(Ok(stream)) => Ok(Box::new(stream)),
            Ok(Err(e)) => Err(SidecarError::Tls(e.to_string())),
            Err(_) => Err(SidecarError::HandshakeTimeout),
        }
    }
}

impl fmt::Debug for TlsTerminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTerminator").finish_non_exhaustive()
    }
}
