//! Run Command Implementation
//!
//! Bootstraps the node (settings, state directory, bindings, transport) and
//! runs the proxy engine until SIGINT or SIGTERM.

use anyhow::{Context, Result, bail};
use sc_core::{DirectTransport, OverlayTransport, Transport, load_bindings};
use sc_daemon::{EngineEvent, ProxyEngine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::NodeArgs;

/// Run the forwarder
pub async fn run(args: &NodeArgs) -> Result<()> {
    let config = args.config()?;
    let hostname = config.require_hostname()?.to_string();
    config.ensure_state_dir()?;

    let bindings = load_bindings(&config.bindings_path).with_context(|| {
        format!("Invalid bindings in {}", config.bindings_path.display())
    })?;
    info!(
        "Loaded {} binding(s) from {}",
        bindings.len(),
        config.bindings_path.display()
    );

    let shutdown = CancellationToken::new();

    let overlay = if args.direct {
        None
    } else {
        let overlay = OverlayTransport::start(&config, shutdown.clone())
            .await
            .context("Failed to join the overlay")?;
        info!("Node link: {}", overlay.identity().to_link());
        Some(Arc::new(overlay))
    };

    let transport: Arc<dyn Transport> = match &overlay {
        Some(overlay) => overlay.clone(),
        None => {
            info!("Using direct transport on {}", config.bind_host);
            Arc::new(
                DirectTransport::new(&hostname)
                    .with_bind_host(config.bind_host.clone())
                    .with_certificates(Arc::new(config.identity_certificates()?)),
            )
        }
    };

    let mut engine = ProxyEngine::new(bindings, transport, config.proxy_options())?;
    if let Some(mut events) = engine.take_event_receiver() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::ListenerFailed { port, reason } => {
                        warn!("Binding on port {} abandoned: {}", port, reason)
                    }
                    event => debug!("Engine event: {:?}", event),
                }
            }
        });
    }

    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let report = engine.run(shutdown.clone()).await;

    // Stops the overlay too when every binding failed to start
    shutdown.cancel();
    if let Some(overlay) = overlay {
        overlay.wait().await;
    }

    if report.started.is_empty() {
        bail!("No binding could be started");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn cancel_on_signal(shutdown: CancellationToken) {
    wait_for_signal().await;
    info!("Shutting down...");
    shutdown.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
