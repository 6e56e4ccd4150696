//! Binding Listener
//!
//! Turns one [`Binding`] into a running forwarder: accepts connections on the
//! binding's port, optionally terminates TLS, dials the destination through
//! the transport and relays the two ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::relay::relay;
use crate::binding::Binding;
use crate::config::ProxyOptions;
use crate::error::{Result, SidecarError};
use crate::tls::TlsTerminator;
use crate::transport::{Accepted, BoxConnection, Listener, Protocol, Transport};

/// Statistics for one binding
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub connections_accepted: AtomicU64,
    pub sessions_total: AtomicU64,
    pub sessions_active: AtomicU64,
    pub dial_failures: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl ProxyStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self, sent: u64, received: u64) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    pub fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn get_total_sessions(&self) -> u64 {
        self.sessions_total.load(Ordering::Relaxed)
    }

    pub fn get_active_sessions(&self) -> u64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    pub fn get_dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    pub fn get_handshake_failures(&self) -> u64 {
        self.handshake_failures.load(Ordering::Relaxed)
    }

    /// Bytes relayed from clients to the destination
    pub fn get_bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes relayed from the destination back to clients
    pub fn get_bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// Everything a connection task needs, shared across the binding's tasks
struct ConnectionContext {
    binding: Binding,
    transport: Arc<dyn Transport>,
    tls: Option<TlsTerminator>,
    options: ProxyOptions,
    stats: Arc<ProxyStats>,
    shutdown: CancellationToken,
}

/// Accepts connections for one binding and forwards them
pub struct BindingListener {
    /// The listen socket
    listener: Box<dyn Listener>,

    /// Shared state for connection tasks
    context: Arc<ConnectionContext>,

    /// In-flight connection tasks
    tasks: TaskTracker,
}

impl BindingListener {
    /// Open the binding's listen socket.
    ///
    /// Fails with [`SidecarError::PortBindFailed`] when the port cannot be bound.
    pub async fn start(
        binding: Binding,
        transport: Arc<dyn Transport>,
        options: ProxyOptions,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = transport
            .listen(Protocol::Tcp, &binding.listen_addr())
            .await
            .map_err(|e| match e {
                SidecarError::PortBindFailed { .. } => e,
                other => SidecarError::PortBindFailed {
                    port: binding.from,
                    reason: other.to_string(),
                },
            })?;

        let tls = if binding.tls {
            Some(TlsTerminator::new(transport.certificates())?)
        } else {
            None
        };

        info!(
            "Started proxy bind from {} to {} (tls: {})",
            binding.from, binding.to, binding.tls
        );

        Ok(Self {
            listener,
            context: Arc::new(ConnectionContext {
                binding,
                transport,
                tls,
                options,
                stats: ProxyStats::new(),
                shutdown,
            }),
            tasks: TaskTracker::new(),
        })
    }

    /// The binding this listener serves
    pub fn binding(&self) -> &Binding {
        &self.context.binding
    }

    /// Local address of the listen socket, when it has one
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get statistics
    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.context.stats)
    }

    /// Run the accept loop until shutdown or until the listener closes.
    ///
    /// The listen socket is closed before waiting for in-flight connections.
    pub async fn run(self) -> Result<()> {
        let Self {
            mut listener,
            context,
            tasks,
        } = self;
        let port = context.binding.from;
        let shutdown = context.shutdown.clone();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Listener on port {} shutting down", port);
                    break;
                }
                result = listener.accept() => result,
            };

            match accepted {
                Ok(Some(accepted)) => {
                    context.stats.connection_accepted();
                    let span = info_span!("conn", port, remote = %accepted.remote);
                    tasks.spawn(handle_connection(Arc::clone(&context), accepted).instrument(span));
                }
                Ok(None) => {
                    info!("Listener on port {} closed", port);
                    break;
                }
                Err(e) => {
                    error!("Accept error on port {}: {}", port, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(context.options.accept_backoff) => {}
                    }
                }
            }
        }

        // Stop new acceptances before draining
        drop(listener);
        tasks.close();

        if !tasks.is_empty() {
            debug!("Waiting for {} connections on port {}", tasks.len(), port);
        }
        tasks.wait().await;

        info!("Stopped proxy bind from {} to {}", port, context.binding.to);
        Ok(())
    }
}

/// Handshake (if TLS), dial, relay. Every path drops the accepted connection exactly once.
async fn handle_connection(context: Arc<ConnectionContext>, accepted: Accepted) {
    let client = match &context.tls {
        Some(tls) => match tls
            .accept(accepted.connection, context.options.handshake_timeout)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                context.stats.handshake_failed();
                warn!("TLS handshake failed: {}", e);
                return;
            }
        },
        None => accepted.connection,
    };

    let destination = &context.binding.to;
    let remote = match dial(&context).await {
        Ok(remote) => remote,
        Err(e) => {
            context.stats.dial_failed();
            warn!("Dial {} failed: {}", destination, e);
            // Dropping `client` closes the accepted connection
            return;
        }
    };

    debug!("Relaying to {}", destination);
    context.stats.session_opened();

    let report = relay(
        client,
        remote,
        context.options.idle_timeout,
        &context.shutdown,
    )
    .await;

    context.stats.session_closed(
        report.client_to_destination.bytes,
        report.destination_to_client.bytes,
    );
    info!("Closed connection to {}: {}", destination, report);
}

/// Dial the binding's destination, bounded by the dial timeout and shutdown
async fn dial(context: &ConnectionContext) -> Result<BoxConnection> {
    let destination = &context.binding.to;

    tokio::select! {
        _ = context.shutdown.cancelled() => Err(SidecarError::dial(destination, "shutting down")),
        result = tokio::time::timeout(
            context.options.dial_timeout,
            context.transport.dial(Protocol::Tcp, destination),
        ) => match result {
            Ok(connection) => connection,
            Err(_) => Err(SidecarError::DialTimeout {
                destination: destination.clone(),
            }),
        },
    }
}
