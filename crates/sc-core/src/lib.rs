//! Sidecar Core Library
//!
//! This crate provides the forwarding core of Sidecar:
//! - Bindings and their validation
//! - The transport capability traits, with direct and overlay implementations
//! - TLS termination with lazily issued identity certificates
//! - Per-binding listeners and the bidirectional relay

pub mod binding;
pub mod brand;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod proxy;
pub mod tls;
pub mod transport;

pub use binding::{Binding, load_bindings, parse_bindings, validate_bindings};
pub use config::{ProxyOptions, SidecarConfig};
pub use error::{Result, SidecarError};
pub use network::{NodeIdentity, OverlayTransport};
pub use proxy::{BindingListener, ProxyStats, RelayReport};
pub use tls::{IdentityCertificates, TlsTerminator};
pub use transport::{
    Accepted, BoxConnection, CertificateProvider, DirectTransport, HandshakeInfo, Listener,
    PeerStatus, Protocol, Transport,
};

// Re-export libp2p types we expose
pub use libp2p::{Multiaddr, PeerId};
