//! Node Identity
//!
//! The node's ed25519 keypair (persisted in the state directory), the peer ID
//! derived from it, and the hostname it announces on the overlay.

use libp2p::identity::{Keypair, PeerId};
use std::path::Path;
use tracing::info;

use crate::brand::LINK_SCHEME;
use crate::config::write_private;
use crate::error::{Result, SidecarError};

/// Overlay identity of this node
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
    hostname: String,
}

impl NodeIdentity {
    /// Generate a fresh identity
    pub fn generate(hostname: impl Into<String>) -> Self {
        Self::from_keypair(Keypair::generate_ed25519(), hostname)
    }

    fn from_keypair(keypair: Keypair, hostname: impl Into<String>) -> Self {
        let peer_id = PeerId::from(keypair.public());
        Self {
            keypair,
            peer_id,
            hostname: hostname.into(),
        }
    }

    /// Load the keypair at `path`, generating and saving one on first start
    pub fn load_or_generate(path: impl AsRef<Path>, hostname: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            Self::load(path, hostname)
        } else {
            let identity = Self::generate(hostname);
            identity.save(path)?;
            info!("Generated new node identity {}", identity.peer_id);
            Ok(identity)
        }
    }

    /// Load a protobuf-encoded keypair
    pub fn load(path: impl AsRef<Path>, hostname: impl Into<String>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let keypair = Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| SidecarError::ConfigError(format!("Invalid keypair file: {}", e)))?;

        Ok(Self::from_keypair(keypair, hostname))
    }

    /// Save the keypair, readable by the owner only
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = self
            .keypair
            .to_protobuf_encoding()
            .map_err(|e| SidecarError::ConfigError(format!("Failed to encode keypair: {}", e)))?;

        write_private(path, &bytes)?;
        Ok(())
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Shareable link for this node
    pub fn to_link(&self) -> String {
        format!("{}://{}", LINK_SCHEME, self.peer_id)
    }

    /// Parse a peer ID from a link or a bare peer ID
    pub fn parse_link(link: &str) -> Result<PeerId> {
        let prefix = format!("{}://", LINK_SCHEME);
        let peer_id_str = link.strip_prefix(prefix.as_str()).unwrap_or(link);

        peer_id_str
            .parse()
            .map_err(|e| SidecarError::InvalidPeerId(format!("Invalid peer ID: {}", e)))
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id.to_string())
            .field("hostname", &self.hostname)
            .finish()
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.hostname, self.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_or_generate_is_stable() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state").join("identity.key");

        let first = NodeIdentity::load_or_generate(&path, "edge-1").unwrap();
        let second = NodeIdentity::load_or_generate(&path, "edge-1").unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(second.hostname(), "edge-1");
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_keypair_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let path = temp.path().join("identity.key");
        NodeIdentity::generate("edge-1").save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_link_round_trip() {
        let identity = NodeIdentity::generate("edge-1");
        let link = identity.to_link();
        assert!(link.starts_with("sidecar://"));

        assert_eq!(NodeIdentity::parse_link(&link).unwrap(), *identity.peer_id());
        assert_eq!(
            NodeIdentity::parse_link(&identity.peer_id().to_string()).unwrap(),
            *identity.peer_id()
        );
        assert!(NodeIdentity::parse_link("sidecar://not-a-peer").is_err());
    }
}
