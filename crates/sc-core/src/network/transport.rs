//! Overlay Transport
//!
//! [`Transport`] over the libp2p overlay. Listeners bind a host TCP socket and
//! also claim the port in the node's overlay namespace, so peers reach them
//! through tunnel streams. Dials resolve the destination host to a peer and
//! open a tunnel stream to the requested port on that peer.

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::PeerId;
use libp2p_stream as stream;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use super::behaviour::TUNNEL_PROTOCOL;
use super::identity::NodeIdentity;
use super::swarm::{OverlayNetwork, PeerTable};
use crate::binding::split_host_port;
use crate::config::SidecarConfig;
use crate::error::{Result, SidecarError};
use crate::protocol::{PROTOCOL_VERSION, TunnelRequest, TunnelResponse, read_frame, write_frame};
use crate::proxy::relay;
use crate::transport::direct::bind_tcp;
use crate::transport::{
    Accepted, BoxConnection, CertificateProvider, Listener, PeerStatus, Protocol, Transport,
};

/// Inbound tunnels queued per overlay listener
const INBOUND_QUEUE: usize = 64;

/// Ports claimed in this node's overlay namespace
#[derive(Debug, Default)]
struct PortRegistry {
    ports: Mutex<HashMap<u16, mpsc::Sender<Accepted>>>,
}

impl PortRegistry {
    fn register(&self, port: u16) -> Result<mpsc::Receiver<Accepted>> {
        let mut ports = self
            .ports
            .lock()
            .map_err(|_| SidecarError::StreamError("port registry poisoned".to_string()))?;

        if ports.get(&port).is_some_and(|tx| !tx.is_closed()) {
            return Err(SidecarError::PortBindFailed {
                port,
                reason: "port already registered on the overlay".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        ports.insert(port, tx);
        Ok(rx)
    }

    fn unregister(&self, port: u16) {
        if let Ok(mut ports) = self.ports.lock() {
            ports.remove(&port);
        }
    }

    fn sender(&self, port: u16) -> Option<mpsc::Sender<Accepted>> {
        self.ports
            .lock()
            .ok()
            .and_then(|ports| ports.get(&port).cloned())
    }
}

/// State shared by the transport and its inbound stream handler
#[derive(Debug)]
struct InboundContext {
    registry: Arc<PortRegistry>,
    expose: Vec<u16>,
    handshake_timeout: Duration,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

/// Transport over the libp2p overlay
pub struct OverlayTransport {
    identity: NodeIdentity,
    bind_host: String,
    control: stream::Control,
    peers: Arc<PeerTable>,
    inbound: Arc<InboundContext>,
    certificates: Arc<dyn CertificateProvider>,
    tasks: TaskTracker,
}

impl OverlayTransport {
    /// Join the overlay as the node described by `config`.
    ///
    /// Loads (or creates) the node identity, starts the swarm and the inbound
    /// tunnel handler. Both run until `shutdown` fires.
    pub async fn start(config: &SidecarConfig, shutdown: CancellationToken) -> Result<Self> {
        let hostname = config.require_hostname()?.to_string();
        config.ensure_state_dir()?;

        let identity = NodeIdentity::load_or_generate(config.identity_path(), &hostname)?;
        let mut network = OverlayNetwork::new(config, identity.clone())?;
        network.start_listening(config.listen_port)?;
        network.dial_bootstrap(&config.bootstrap_peers);

        let control = network.stream_control();
        let incoming = control
            .clone()
            .accept(TUNNEL_PROTOCOL)
            .map_err(|e| SidecarError::NetworkInitialization(e.to_string()))?;
        let peers = network.peers();

        let certificates = config.identity_certificates()?;

        let options = config.proxy_options();
        let inbound = Arc::new(InboundContext {
            registry: Arc::new(PortRegistry::default()),
            expose: config.expose.clone(),
            handshake_timeout: options.handshake_timeout,
            idle_timeout: options.idle_timeout,
            shutdown: shutdown.clone(),
        });

        let tasks = TaskTracker::new();
        tasks.spawn(network.run(shutdown.clone()));
        tasks.spawn(accept_tunnels(incoming, Arc::clone(&inbound), tasks.clone()));

        info!("Joined overlay as {}", identity);

        Ok(Self {
            identity,
            bind_host: config.bind_host.clone(),
            control,
            peers,
            inbound,
            certificates: Arc::new(certificates),
            tasks,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Wait for the swarm and tunnel tasks to finish after shutdown
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn resolve(&self, host: &str) -> Result<PeerId> {
        self.peers
            .resolve(host)
            .await
            .ok_or_else(|| SidecarError::PeerNotFound(host.to_string()))
    }

    /// Reach `addr` on its peer: loopback for ourselves, a tunnel otherwise
    async fn dial_tcp(&self, addr: &str) -> Result<BoxConnection> {
        let (host, port) = split_host_port(addr)?;
        let peer_id = self.resolve(host).await?;

        if peer_id == *self.identity.peer_id() {
            let stream = TcpStream::connect(("127.0.0.1", port))
                .await
                .map_err(|e| SidecarError::dial(addr, e))?;
            stream.set_nodelay(true)?;
            return Ok(Box::new(stream));
        }

        debug!("Opening tunnel to {} port {}", peer_id, port);
        let stream = self
            .control
            .clone()
            .open_stream(peer_id, TUNNEL_PROTOCOL)
            .await
            .map_err(|e| SidecarError::dial(addr, format!("{:?}", e)))?;

        let mut stream = stream.compat();
        write_frame(&mut stream, &TunnelRequest::new(port)).await?;
        let response: TunnelResponse = read_frame(&mut stream).await?;

        if !response.accepted {
            return Err(SidecarError::dial(
                addr,
                response.reason.unwrap_or_else(|| "rejected".to_string()),
            ));
        }

        Ok(Box::new(stream))
    }
}

impl std::fmt::Debug for OverlayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayTransport")
            .field("identity", &self.identity)
            .field("bind_host", &self.bind_host)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for OverlayTransport {
    async fn listen(&self, protocol: Protocol, addr: &str) -> Result<Box<dyn Listener>> {
        match protocol {
            Protocol::Tcp => {
                let tcp = bind_tcp(&self.bind_host, addr).await?;
                let port = tcp.local_addr()?.port();
                let inbound = self.inbound.registry.register(port)?;

                debug!("Overlay listener bound on port {}", port);
                Ok(Box::new(OverlayListener {
                    port,
                    tcp,
                    inbound,
                    registry: Arc::clone(&self.inbound.registry),
                }))
            }
        }
    }

    async fn dial(&self, protocol: Protocol, addr: &str) -> Result<BoxConnection> {
        match protocol {
            Protocol::Tcp => self.dial_tcp(addr).await,
        }
    }

    fn certificates(&self) -> Arc<dyn CertificateProvider> {
        Arc::clone(&self.certificates)
    }

    async fn peer_status(&self) -> Result<Vec<PeerStatus>> {
        Ok(self.peers.snapshot().await)
    }
}

/// Listener fed by host TCP and by overlay tunnels for the same port
struct OverlayListener {
    port: u16,
    tcp: TcpListener,
    inbound: mpsc::Receiver<Accepted>,
    registry: Arc<PortRegistry>,
}

#[async_trait]
impl Listener for OverlayListener {
    async fn accept(&mut self) -> io::Result<Option<Accepted>> {
        tokio::select! {
            result = self.tcp.accept() => {
                let (stream, addr) = result?;
                stream.set_nodelay(true)?;
                Ok(Some(Accepted {
                    connection: Box::new(stream),
                    remote: addr.to_string(),
                }))
            }
            tunnel = self.inbound.recv() => Ok(tunnel),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr().ok()
    }
}

impl Drop for OverlayListener {
    fn drop(&mut self) {
        self.registry.unregister(self.port);
    }
}

/// Accept tunnel streams from peers until shutdown
async fn accept_tunnels(
    mut incoming: stream::IncomingStreams,
    context: Arc<InboundContext>,
    tasks: TaskTracker,
) {
    loop {
        let (peer_id, stream) = tokio::select! {
            _ = context.shutdown.cancelled() => break,
            next = incoming.next() => match next {
                Some(next) => next,
                None => break,
            },
        };

        let span = info_span!("tunnel", peer = %peer_id);
        let context = Arc::clone(&context);
        tasks.spawn(
            async move {
                if let Err(e) = handle_tunnel(&context, peer_id, stream).await {
                    warn!("Tunnel from {} failed: {}", peer_id, e);
                }
            }
            .instrument(span),
        );
    }

    debug!("Tunnel acceptor stopped");
}

/// Route one inbound tunnel to a registered listener or an exposed local port
async fn handle_tunnel(context: &InboundContext, peer_id: PeerId, stream: libp2p::Stream) -> Result<()> {
    let mut stream = stream.compat();

    let request: TunnelRequest = tokio::time::timeout(context.handshake_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| SidecarError::HandshakeTimeout)??;

    if request.version != PROTOCOL_VERSION {
        let reason = format!("unsupported tunnel version {}", request.version);
        write_frame(&mut stream, &TunnelResponse::rejected(&reason)).await?;
        return Err(SidecarError::UnsupportedProtocol(reason));
    }

    let port = request.port;

    if let Some(tx) = context.registry.sender(port) {
        match tx.reserve().await {
            Ok(permit) => {
                write_frame(&mut stream, &TunnelResponse::accepted()).await?;
                debug!("Tunnel from {} delivered to listener on port {}", peer_id, port);
                permit.send(Accepted {
                    connection: Box::new(stream),
                    remote: peer_id.to_string(),
                });
                return Ok(());
            }
            Err(_) => context.registry.unregister(port),
        }
    }

    if context.expose.contains(&port) {
        let local = match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(local) => local,
            Err(e) => {
                write_frame(&mut stream, &TunnelResponse::rejected(e.to_string())).await?;
                return Err(SidecarError::dial(format!("127.0.0.1:{}", port), e));
            }
        };
        local.set_nodelay(true)?;
        write_frame(&mut stream, &TunnelResponse::accepted()).await?;

        info!("Bridging tunnel from {} to localhost:{}", peer_id, port);
        let report = relay(stream, local, context.idle_timeout, &context.shutdown).await;
        debug!("Bridge from {} closed: {}", peer_id, report);
        return Ok(());
    }

    write_frame(
        &mut stream,
        &TunnelResponse::rejected(format!("port {} is not served", port)),
    )
    .await?;
    debug!("Rejected tunnel from {} to port {}", peer_id, port);
    Ok(())
}
