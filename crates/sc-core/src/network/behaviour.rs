//! Network Behaviour for the Sidecar overlay
//!
//! Combines libp2p protocols:
//! - Identify: peer info exchange, including the announced hostname
//! - Ping: connection liveness
//! - mDNS: local network discovery
//! - Relay/DCUtR: NAT traversal
//! - Stream: raw bidirectional tunnel streams

use libp2p::{
    StreamProtocol, dcutr, identify, mdns, ping, relay,
    swarm::{NetworkBehaviour, behaviour::toggle::Toggle},
};

use crate::protocol::TUNNEL_PROTOCOL_ID;

/// The protocol identifier for tunnel streams
pub const TUNNEL_PROTOCOL: StreamProtocol = StreamProtocol::new(TUNNEL_PROTOCOL_ID);

/// Protocol string used by identify
pub const IDENTIFY_PROTOCOL: &str = "/sidecar/id/1.0.0";

/// Combined network behaviour for a Sidecar node
#[derive(NetworkBehaviour)]
pub struct SidecarBehaviour {
    /// Identify protocol for peer info exchange
    pub identify: identify::Behaviour,
    /// Ping protocol for connection liveness
    pub ping: ping::Behaviour,
    /// mDNS for local network discovery (optional)
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Relay client for NAT traversal
    pub relay: relay::client::Behaviour,
    /// DCUtR for hole punching (optional)
    pub dcutr: Toggle<dcutr::Behaviour>,
    /// Stream behaviour for raw tunnel streams
    pub stream: libp2p_stream::Behaviour,
}

/// Identify agent version announcing `hostname`
pub fn agent_version(hostname: &str) -> String {
    format!("sidecar/{} ({})", env!("CARGO_PKG_VERSION"), hostname)
}

/// Extract the hostname from a peer's identify agent version
pub fn hostname_from_agent(agent: &str) -> Option<&str> {
    let rest = agent.strip_prefix("sidecar/")?;
    let open = rest.find('(')?;
    let name = rest[open + 1..].strip_suffix(')')?.trim();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_version_round_trip() {
        let agent = agent_version("edge-1");
        assert_eq!(hostname_from_agent(&agent), Some("edge-1"));
    }

    #[test]
    fn test_foreign_agents_have_no_hostname() {
        assert_eq!(hostname_from_agent("rust-libp2p/0.54.0"), None);
        assert_eq!(hostname_from_agent("sidecar/0.1.0"), None);
        assert_eq!(hostname_from_agent("sidecar/0.1.0 ()"), None);
        assert_eq!(hostname_from_agent("sidecar/0.1.0 (db"), None);
    }
}
