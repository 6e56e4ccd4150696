//! Proxy Engine
//!
//! Starts one [`BindingListener`] per binding on the shared transport and
//! waits for all of them. A binding whose port cannot be bound is logged and
//! abandoned; the others keep running.

use sc_core::{
    Binding, BindingListener, ProxyOptions, Result, Transport, validate_bindings,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Events from the engine to whoever is watching it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A binding's listener is accepting
    ListenerStarted {
        port: u16,
        local_addr: Option<SocketAddr>,
    },

    /// A binding could not be started and was abandoned
    ListenerFailed { port: u16, reason: String },

    /// A binding's listener exited
    ListenerStopped { port: u16 },

    /// All listeners have exited
    Stopped,
}

/// Summary returned when the engine stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    /// Ports whose listener started
    pub started: Vec<u16>,

    /// Ports whose listener failed to start, with the reason
    pub failed: Vec<(u16, String)>,
}

impl EngineReport {
    pub fn all_started(&self) -> bool {
        self.failed.is_empty()
    }
}

enum ListenerOutcome {
    Ran(u16),
    Failed(u16, String),
}

/// Supervisor for the configured bindings
pub struct ProxyEngine {
    bindings: Vec<Binding>,
    transport: Arc<dyn Transport>,
    options: ProxyOptions,
    event_tx: mpsc::Sender<EngineEvent>,
    event_rx: Option<mpsc::Receiver<EngineEvent>>,
}

impl ProxyEngine {
    /// Create an engine for `bindings`.
    ///
    /// The set must be non-empty with unique ports and well-formed destinations.
    pub fn new(
        bindings: Vec<Binding>,
        transport: Arc<dyn Transport>,
        options: ProxyOptions,
    ) -> Result<Self> {
        validate_bindings(&bindings)?;

        let (event_tx, event_rx) = mpsc::channel(256);

        Ok(Self {
            bindings,
            transport,
            options,
            event_tx,
            event_rx: Some(event_rx),
        })
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Take the event receiver; `None` once taken
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.event_rx.take()
    }

    /// Run every binding until `shutdown` fires and all listeners have exited
    pub async fn run(mut self, shutdown: CancellationToken) -> EngineReport {
        // Nobody is watching; let sends fail fast instead of filling the queue
        drop(self.event_rx.take());

        self.log_peer_status().await;
        info!("Starting {} binding(s)", self.bindings.len());

        let mut listeners = JoinSet::new();
        for binding in std::mem::take(&mut self.bindings) {
            listeners.spawn(run_binding(
                binding,
                Arc::clone(&self.transport),
                self.options,
                shutdown.clone(),
                self.event_tx.clone(),
            ));
        }

        let mut report = EngineReport::default();
        while let Some(joined) = listeners.join_next().await {
            match joined {
                Ok(ListenerOutcome::Ran(port)) => report.started.push(port),
                Ok(ListenerOutcome::Failed(port, reason)) => report.failed.push((port, reason)),
                Err(e) => error!("Listener task failed: {}", e),
            }
        }

        report.started.sort_unstable();
        report.failed.sort_unstable();

        let _ = self.event_tx.send(EngineEvent::Stopped).await;
        info!(
            "Proxy engine stopped ({} ran, {} failed)",
            report.started.len(),
            report.failed.len()
        );
        report
    }

    async fn log_peer_status(&self) {
        match self.transport.peer_status().await {
            Ok(peers) if peers.is_empty() => info!("No overlay peers known yet"),
            Ok(peers) => {
                for peer in peers {
                    info!("Peer {}", peer);
                }
            }
            Err(e) => warn!("Failed to get peer status: {}", e),
        }
    }
}

async fn run_binding(
    binding: Binding,
    transport: Arc<dyn Transport>,
    options: ProxyOptions,
    shutdown: CancellationToken,
    events: mpsc::Sender<EngineEvent>,
) -> ListenerOutcome {
    let port = binding.from;

    let listener = match BindingListener::start(binding, transport, options, shutdown).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to start proxy bind on port {}: {}", port, e);
            let reason = e.to_string();
            let _ = events
                .send(EngineEvent::ListenerFailed {
                    port,
                    reason: reason.clone(),
                })
                .await;
            return ListenerOutcome::Failed(port, reason);
        }
    };

    let _ = events
        .send(EngineEvent::ListenerStarted {
            port,
            local_addr: listener.local_addr(),
        })
        .await;

    let stats = listener.stats();
    if let Err(e) = listener.run().await {
        warn!("Listener on port {} exited with error: {}", port, e);
    }

    debug!(
        "Port {} served {} connections ({} sessions, {} dial failures)",
        port,
        stats.get_connections_accepted(),
        stats.get_total_sessions(),
        stats.get_dial_failures()
    );
    let _ = events.send(EngineEvent::ListenerStopped { port }).await;

    ListenerOutcome::Ran(port)
}
