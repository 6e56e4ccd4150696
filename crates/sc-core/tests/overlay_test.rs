//! Integration tests for the overlay transport
//!
//! Two nodes on loopback, mDNS off, the second bootstrapped to the first's
//! QUIC address. Dials go through real tunnel streams.

use sc_core::{OverlayTransport, Protocol, SidecarConfig, SidecarError, Transport};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });

    addr
}

/// A UDP port that was free a moment ago
fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// TCP port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn node_config(hostname: &str, state: &TempDir) -> SidecarConfig {
    SidecarConfig::new()
        .with_hostname(hostname)
        .with_state_dir(state.path())
        .with_bind_host("127.0.0.1")
        .with_mdns(false)
        .with_relay(false)
}

struct Pair {
    a: OverlayTransport,
    b: OverlayTransport,
    shutdown: CancellationToken,
    _state: (TempDir, TempDir),
}

impl Pair {
    /// Node A listens on a fixed QUIC port; node B bootstraps to it
    async fn start(expose_on_a: &[u16]) -> Self {
        let shutdown = CancellationToken::new();
        let state_a = TempDir::new().unwrap();
        let state_b = TempDir::new().unwrap();

        let quic_port = free_udp_port();
        let config_a = expose_on_a.iter().fold(
            node_config("node-a", &state_a).with_listen_port(quic_port),
            |config, port| config.with_exposed_port(*port),
        );
        let a = OverlayTransport::start(&config_a, shutdown.clone())
            .await
            .unwrap();

        let bootstrap = format!(
            "/ip4/127.0.0.1/udp/{}/quic-v1/p2p/{}",
            quic_port,
            a.identity().peer_id()
        );
        let config_b = node_config("node-b", &state_b).with_bootstrap_peer(bootstrap);
        let b = OverlayTransport::start(&config_b, shutdown.clone())
            .await
            .unwrap();

        let pair = Self {
            a,
            b,
            shutdown,
            _state: (state_a, state_b),
        };
        pair.wait_until_b_knows_a().await;
        pair
    }

    /// Node B is connected to node A and has learned its hostname
    async fn wait_until_b_knows_a(&self) {
        let a_peer = self.a.identity().peer_id().to_string();
        timeout(Duration::from_secs(20), async {
            loop {
                let peers = self.b.peer_status().await.unwrap();
                let ready = peers.iter().any(|peer| {
                    peer.peer_id == a_peer
                        && peer.connected
                        && peer.hostname.as_deref() == Some("node-a")
                });
                if ready {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("node B never identified node A");
    }

    async fn stop(self) {
        self.shutdown.cancel();
        timeout(Duration::from_secs(10), async {
            self.a.wait().await;
            self.b.wait().await;
        })
        .await
        .expect("overlay tasks did not stop");
    }
}

#[tokio::test]
async fn test_dial_by_peer_id_reaches_registered_listener() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let pair = Pair::start(&[]).await;

    let mut listener = pair.a.listen(Protocol::Tcp, ":0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let destination = format!("{}:{}", pair.a.identity().peer_id(), port);
    let mut outbound = timeout(Duration::from_secs(10), pair.b.dial(Protocol::Tcp, &destination))
        .await
        .expect("tunnel dial hung")
        .unwrap();

    let accepted = timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("tunnel never delivered")
        .unwrap()
        .expect("listener closed");
    assert_eq!(accepted.remote, pair.b.identity().peer_id().to_string());
    let mut inbound = accepted.connection;

    outbound.write_all(b"over the overlay").await.unwrap();
    outbound.flush().await.unwrap();
    let mut buf = [0u8; 16];
    timeout(Duration::from_secs(5), inbound.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"over the overlay");

    inbound.write_all(b"and back").await.unwrap();
    inbound.flush().await.unwrap();
    let mut buf = [0u8; 8];
    timeout(Duration::from_secs(5), outbound.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"and back");

    drop(listener);
    pair.stop().await;
}

#[tokio::test]
async fn test_exposed_port_bridged_by_hostname() {
    let echo = start_echo_server().await;
    let pair = Pair::start(&[echo.port()]).await;

    let destination = format!("node-a:{}", echo.port());
    let mut connection = timeout(Duration::from_secs(10), pair.b.dial(Protocol::Tcp, &destination))
        .await
        .expect("tunnel dial hung")
        .unwrap();

    connection.write_all(b"echo through node-a").await.unwrap();
    connection.flush().await.unwrap();
    let mut buf = [0u8; 19];
    timeout(Duration::from_secs(5), connection.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"echo through node-a");

    drop(connection);
    pair.stop().await;
}

#[tokio::test]
async fn test_unserved_port_refused() {
    let pair = Pair::start(&[]).await;
    let port = closed_port().await;

    let destination = format!("{}:{}", pair.a.identity().peer_id(), port);
    let result = timeout(Duration::from_secs(10), pair.b.dial(Protocol::Tcp, &destination))
        .await
        .expect("refusal hung");
    match result {
        Err(SidecarError::DialError { reason, .. }) => {
            assert!(reason.contains("not served"), "unexpected reason: {}", reason)
        }
        Err(other) => panic!("expected a dial error, got {}", other),
        Ok(_) => panic!("dial to an unserved port succeeded"),
    }

    // Unknown hostnames never reach the network
    assert!(matches!(
        pair.b.dial(Protocol::Tcp, "node-z:22").await,
        Err(SidecarError::PeerNotFound(_))
    ));

    pair.stop().await;
}
