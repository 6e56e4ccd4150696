//! CLI Command Definitions
//!
//! Defines the command-line interface using clap.

pub mod check;
pub mod info;
pub mod run;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sc_core::SidecarConfig;
use std::path::PathBuf;

/// Sidecar - binding-driven TCP forwarder for private overlay networks
///
/// Listens on the ports declared in the bindings file and relays each
/// connection to its destination through the overlay, optionally
/// terminating TLS on the way in.
#[derive(Parser, Debug)]
#[command(name = "sidecar")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub node: NodeArgs,

    /// Defaults to `run`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the forwarder (default)
    #[command(visible_alias = "r")]
    Run,

    /// Validate the bindings file and print the forwards
    Check {
        /// Print the bindings as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show node information
    ///
    /// Displays the peer ID, link and state directory of this node.
    #[command(visible_alias = "i")]
    Info,
}

/// Node settings shared by all commands
#[derive(Args, Debug, Clone, Default)]
pub struct NodeArgs {
    /// Hostname announced on the overlay
    #[arg(long, env = "SIDECAR_NAME", global = true)]
    pub hostname: Option<String>,

    /// State directory for the node identity and certificates
    #[arg(long, env = "SIDECAR_STATEDIR", value_name = "DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// JSON bindings file
    #[arg(long, env = "SIDECAR_BINDINGS", value_name = "FILE", global = true)]
    pub bindings: Option<PathBuf>,

    /// TOML settings file
    #[arg(long, env = "SIDECAR_CONFIG", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Bootstrap peer multiaddr (repeatable, comma-separated in the environment)
    #[arg(long = "peer", env = "SIDECAR_PEERS", value_delimiter = ',', global = true)]
    pub peers: Vec<String>,

    /// Loopback port overlay peers may reach on this node
    #[arg(long, env = "SIDECAR_EXPOSE", value_delimiter = ',', global = true)]
    pub expose: Vec<u16>,

    /// Port for the overlay QUIC listener
    #[arg(long, value_name = "PORT", global = true)]
    pub listen_port: Option<u16>,

    /// Host address binding listeners bind on
    #[arg(long, value_name = "ADDR", global = true)]
    pub bind_host: Option<String>,

    /// Disable mDNS peer discovery
    #[arg(long, global = true)]
    pub no_mdns: bool,

    /// Forward over plain host TCP instead of the overlay
    #[arg(long, global = true)]
    pub direct: bool,
}

impl NodeArgs {
    /// Settings file first, then flags and environment on top
    pub fn config(&self) -> Result<SidecarConfig> {
        let mut config = match &self.config {
            Some(path) => SidecarConfig::load(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => SidecarConfig::default(),
        };

        if let Some(hostname) = &self.hostname {
            config = config.with_hostname(hostname.clone());
        }
        if let Some(state_dir) = &self.state_dir {
            config = config.with_state_dir(state_dir.clone());
        }
        if let Some(bindings) = &self.bindings {
            config = config.with_bindings_path(bindings.clone());
        }
        if let Some(port) = self.listen_port {
            config = config.with_listen_port(port);
        }
        if let Some(host) = &self.bind_host {
            config = config.with_bind_host(host.clone());
        }
        if self.no_mdns {
            config = config.with_mdns(false);
        }
        for peer in &self.peers {
            if !config.bootstrap_peers.contains(peer) {
                config = config.with_bootstrap_peer(peer.clone());
            }
        }
        for port in &self.expose {
            config = config.with_exposed_port(*port);
        }

        config.validate()?;
        Ok(config)
    }
}
