//! Swarm Management for the Sidecar overlay
//!
//! Builds the libp2p swarm, drives its event loop and keeps the peer table
//! that hostnames are resolved against.

use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId, Swarm, dcutr, identify, mdns, ping,
    swarm::{SwarmEvent, behaviour::toggle::Toggle},
};
use libp2p_stream as stream;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::behaviour::{
    IDENTIFY_PROTOCOL, SidecarBehaviour, SidecarBehaviourEvent, agent_version, hostname_from_agent,
};
use super::identity::NodeIdentity;
use crate::config::SidecarConfig;
use crate::error::{Result, SidecarError};
use crate::transport::PeerStatus;

/// Addresses remembered per peer, oldest dropped first
pub const MAX_PEER_ADDRESSES: usize = 8;

/// How long a disconnected peer stays resolvable by hostname
pub const STALE_PEER_GRACE: Duration = Duration::from_secs(600);

/// How often the peer table is swept for stale peers
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Connection information for a peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub hostname: Option<String>,
    pub addresses: Vec<Multiaddr>,
    pub connected: bool,
    pub connected_at: Instant,
    /// Last connection change or identify for this peer
    pub last_seen: Instant,
}

impl PeerInfo {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            hostname: None,
            addresses: Vec::new(),
            connected: false,
            connected_at: Instant::now(),
            last_seen: Instant::now(),
        }
    }

    /// Remember `address` as the most recent one, keeping at most
    /// [`MAX_PEER_ADDRESSES`]
    fn remember(&mut self, address: Multiaddr) {
        self.addresses.retain(|known| known != &address);
        self.addresses.push(address);
        if self.addresses.len() > MAX_PEER_ADDRESSES {
            let excess = self.addresses.len() - MAX_PEER_ADDRESSES;
            self.addresses.drain(..excess);
        }
    }

    fn status(&self) -> PeerStatus {
        PeerStatus {
            peer_id: self.peer_id.to_string(),
            hostname: self.hostname.clone(),
            addresses: self.addresses.iter().map(ToString::to_string).collect(),
            connected: self.connected,
            connected_for: if self.connected {
                self.connected_at.elapsed()
            } else {
                Duration::ZERO
            },
        }
    }
}

/// Peers seen on the overlay, keyed by peer ID
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connected(&self, peer_id: PeerId, address: Multiaddr) {
        let mut peers = self.peers.write().await;
        let info = peers.entry(peer_id).or_insert_with(|| PeerInfo::new(peer_id));
        if !info.connected {
            info.connected = true;
            info.connected_at = Instant::now();
        }
        info.last_seen = Instant::now();
        info.remember(address);
    }

    pub async fn disconnected(&self, peer_id: &PeerId) {
        if let Some(info) = self.peers.write().await.get_mut(peer_id) {
            info.connected = false;
            info.last_seen = Instant::now();
        }
    }

    pub async fn identified(&self, peer_id: PeerId, hostname: Option<String>, addresses: Vec<Multiaddr>) {
        let mut peers = self.peers.write().await;
        let info = peers.entry(peer_id).or_insert_with(|| PeerInfo::new(peer_id));
        if hostname.is_some() {
            info.hostname = hostname;
        }
        info.last_seen = Instant::now();
        for address in addresses {
            info.remember(address);
        }
    }

    /// Forget peers that have been disconnected for at least `grace`.
    ///
    /// Returns how many were removed.
    pub async fn prune(&self, grace: Duration) -> usize {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|_, info| info.connected || info.last_seen.elapsed() < grace);
        before - peers.len()
    }

    /// Resolve a destination host (peer ID or announced hostname) to a peer.
    ///
    /// Connected peers win over stale entries carrying the same hostname.
    pub async fn resolve(&self, host: &str) -> Option<PeerId> {
        if let Ok(peer_id) = host.parse::<PeerId>() {
            return Some(peer_id);
        }

        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|info| {
                info.hostname
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(host))
            })
            .max_by_key(|info| (info.connected, info.connected_at))
            .map(|info| info.peer_id)
    }

    pub async fn snapshot(&self) -> Vec<PeerStatus> {
        let peers = self.peers.read().await;
        let mut statuses: Vec<PeerStatus> = peers.values().map(PeerInfo::status).collect();
        statuses.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        statuses
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// Owner of the libp2p swarm
pub struct OverlayNetwork {
    /// Our identity
    identity: NodeIdentity,
    /// The libp2p swarm
    swarm: Swarm<SidecarBehaviour>,
    /// Known peers, shared with the transport
    peers: std::sync::Arc<PeerTable>,
}

impl OverlayNetwork {
    /// Build the swarm for `identity`
    pub fn new(config: &SidecarConfig, identity: NodeIdentity) -> Result<Self> {
        let local_peer_id = *identity.peer_id();
        let keypair = identity.keypair().clone();
        let agent = agent_version(identity.hostname());
        let enable_mdns = config.enable_mdns;
        let enable_relay = config.enable_relay;

        info!("Local peer ID: {}", local_peer_id);

        let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_quic()
            .with_relay_client(libp2p::noise::Config::new, libp2p::yamux::Config::default)
            .map_err(|e| SidecarError::NetworkInitialization(e.to_string()))?
            .with_behaviour(|key, relay| {
                let identify = identify::Behaviour::new(
                    identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                        .with_agent_version(agent)
                        .with_push_listen_addr_updates(true),
                );

                let ping = ping::Behaviour::new(
                    ping::Config::new()
                        .with_interval(Duration::from_secs(15))
                        .with_timeout(Duration::from_secs(10)),
                );

                let mdns = if enable_mdns {
                    Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
                } else {
                    None
                };
                let dcutr = enable_relay.then(|| dcutr::Behaviour::new(local_peer_id));

                Ok(SidecarBehaviour {
                    identify,
                    ping,
                    mdns: Toggle::from(mdns),
                    relay,
                    dcutr: Toggle::from(dcutr),
                    stream: stream::Behaviour::new(),
                })
            })
            .map_err(|e| SidecarError::NetworkInitialization(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        Ok(Self {
            identity,
            swarm,
            peers: std::sync::Arc::new(PeerTable::new()),
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Shared peer table
    pub fn peers(&self) -> std::sync::Arc<PeerTable> {
        std::sync::Arc::clone(&self.peers)
    }

    /// Get a control handle for opening and accepting streams
    pub fn stream_control(&self) -> stream::Control {
        self.swarm.behaviour().stream.new_control()
    }

    /// Start listening for QUIC on IPv4 and IPv6
    pub fn start_listening(&mut self, port: u16) -> Result<()> {
        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", port)
            .parse()
            .map_err(|e| SidecarError::NetworkInitialization(format!("Invalid address: {}", e)))?;

        self.swarm.listen_on(listen_addr)?;

        // IPv6 is best effort
        if let Ok(addr) = format!("/ip6/::/udp/{}/quic-v1", port).parse::<Multiaddr>() {
            if let Err(e) = self.swarm.listen_on(addr) {
                debug!("IPv6 listen unavailable: {}", e);
            }
        }

        Ok(())
    }

    /// Dial bootstrap peers for initial connectivity
    pub fn dial_bootstrap(&mut self, peers: &[String]) {
        for peer_addr in peers {
            match peer_addr.parse::<Multiaddr>() {
                Ok(addr) => {
                    info!("Dialing bootstrap peer: {}", addr);
                    if let Err(e) = self.swarm.dial(addr) {
                        warn!("Failed to dial bootstrap peer {}: {}", peer_addr, e);
                    }
                }
                Err(e) => warn!("Ignoring invalid bootstrap address {}: {}", peer_addr, e),
            }
        }
    }

    /// Run the network event loop until `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Starting overlay network as {}", self.identity);

        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,
                _ = prune.tick() => {
                    let removed = self.peers.prune(STALE_PEER_GRACE).await;
                    if removed > 0 {
                        debug!("Forgot {} stale peer(s)", removed);
                    }
                }
            }
        }

        info!("Overlay network stopped");
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<SidecarBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }

            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!("Connected to peer: {}", peer_id);
                self.peers
                    .connected(peer_id, endpoint.get_remote_address().clone())
                    .await;
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    debug!("Disconnected from peer: {}", peer_id);
                    self.peers.disconnected(&peer_id).await;
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    warn!("Failed to connect to {}: {}", peer_id, error);
                }
            }

            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event).await,

            _ => {}
        }
    }

    async fn handle_behaviour_event(&mut self, event: SidecarBehaviourEvent) {
        match event {
            SidecarBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    debug!("Discovered peer via mDNS: {} at {}", peer_id, addr);
                    self.swarm.add_peer_address(peer_id, addr);
                    if !self.swarm.is_connected(&peer_id) {
                        // Connect so identify can tell us its hostname
                        let _ = self.swarm.dial(peer_id);
                    }
                }
            }

            SidecarBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                let hostname = hostname_from_agent(&info.agent_version).map(str::to_string);
                info!(
                    "Identified peer {} as {}",
                    peer_id,
                    hostname.as_deref().unwrap_or("<unnamed>")
                );
                for addr in &info.listen_addrs {
                    self.swarm.add_peer_address(peer_id, addr.clone());
                }
                self.peers
                    .identified(peer_id, hostname, info.listen_addrs)
                    .await;
            }

            SidecarBehaviourEvent::Dcutr(dcutr::Event {
                remote_peer_id,
                result,
            }) => match result {
                Ok(_) => info!("Hole punch succeeded with {}", remote_peer_id),
                Err(e) => warn!("Hole punch failed with {}: {:?}", remote_peer_id, e),
            },

            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> Multiaddr {
        "/ip4/10.0.0.5/udp/4001/quic-v1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_resolve_by_peer_id() {
        let table = PeerTable::new();
        let peer = PeerId::random();
        assert_eq!(table.resolve(&peer.to_string()).await, Some(peer));
    }

    #[tokio::test]
    async fn test_resolve_by_hostname() {
        let table = PeerTable::new();
        let peer = PeerId::random();

        assert_eq!(table.resolve("db").await, None);
        table.connected(peer, address()).await;
        table.identified(peer, Some("db".to_string()), vec![]).await;

        assert_eq!(table.resolve("DB").await, Some(peer));
        assert_eq!(table.resolve("cache").await, None);
    }

    #[tokio::test]
    async fn test_connected_peer_preferred_over_stale() {
        let table = PeerTable::new();
        let stale = PeerId::random();
        let live = PeerId::random();

        table.identified(stale, Some("db".to_string()), vec![]).await;
        table.connected(live, address()).await;
        table.identified(live, Some("db".to_string()), vec![]).await;

        assert_eq!(table.resolve("db").await, Some(live));
    }

    #[tokio::test]
    async fn test_snapshot_tracks_connection_state() {
        let table = PeerTable::new();
        let peer = PeerId::random();

        table.connected(peer, address()).await;
        table.connected(peer, address()).await;
        let status = table.snapshot().await;
        assert_eq!(status.len(), 1);
        assert!(status[0].connected);
        assert_eq!(status[0].addresses.len(), 1);

        table.disconnected(&peer).await;
        let status = table.snapshot().await;
        assert!(!status[0].connected);
        assert_eq!(status[0].connected_for, Duration::ZERO);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_addresses_capped_and_deduplicated() {
        let table = PeerTable::new();
        let peer = PeerId::random();

        let addresses: Vec<Multiaddr> = (0..20)
            .map(|i| format!("/ip4/10.0.0.{}/udp/4001/quic-v1", i).parse().unwrap())
            .collect();
        table.identified(peer, None, addresses.clone()).await;
        // Seen again, so it becomes the newest
        table.connected(peer, addresses[0].clone()).await;

        let status = table.snapshot().await;
        let known = &status[0].addresses;
        assert_eq!(known.len(), MAX_PEER_ADDRESSES);
        assert_eq!(known.last(), Some(&addresses[0].to_string()));
        assert!(known.contains(&addresses[19].to_string()));
        assert!(!known.contains(&addresses[1].to_string()));

        let mut unique = known.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), known.len());
    }

    #[tokio::test]
    async fn test_prune_forgets_only_stale_disconnected_peers() {
        let table = PeerTable::new();
        let live = PeerId::random();
        let gone = PeerId::random();

        table.connected(live, address()).await;
        table.connected(gone, address()).await;
        table.identified(gone, Some("db".to_string()), vec![]).await;
        table.disconnected(&gone).await;

        // Within the grace period the hostname still resolves
        assert_eq!(table.prune(STALE_PEER_GRACE).await, 0);
        assert_eq!(table.resolve("db").await, Some(gone));

        assert_eq!(table.prune(Duration::ZERO).await, 1);
        assert_eq!(table.len().await, 1);
        assert_eq!(table.resolve("db").await, None);
        assert!(table.snapshot().await[0].connected);
    }
}
