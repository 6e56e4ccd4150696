//! P2P Overlay Module for Sidecar
//!
//! Implements the libp2p swarm with QUIC transport, peer discovery,
//! hostname resolution and the tunnel streams the overlay transport uses.

pub mod behaviour;
pub mod identity;
pub mod swarm;
pub mod transport;

pub use behaviour::{SidecarBehaviour, SidecarBehaviourEvent, TUNNEL_PROTOCOL};
pub use identity::NodeIdentity;
pub use swarm::{OverlayNetwork, PeerInfo, PeerTable};
pub use transport::OverlayTransport;
