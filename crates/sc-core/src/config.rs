//! Configuration management for Sidecar
//!
//! Startup parameters are collected once into a [`SidecarConfig`] (TOML file,
//! then command-line/environment overrides) and passed down explicitly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::binding::DEFAULT_BINDINGS_PATH;
use crate::error::{Result, SidecarError};
use crate::tls::IdentityCertificates;

/// Default QUIC port for the overlay node (0 = random)
pub const DEFAULT_LISTEN_PORT: u16 = 0;

/// Default timeout for dialing a destination
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for completing a TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle timeout per relay session
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Main configuration for a Sidecar node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Node hostname announced on the overlay
    pub hostname: Option<String>,

    /// Directory holding the node identity and issued certificates
    pub state_dir: PathBuf,

    /// Path to the JSON bindings file
    pub bindings_path: PathBuf,

    /// Port for the overlay QUIC listener (0 = random)
    pub listen_port: u16,

    /// Host address binding listeners bind on
    pub bind_host: String,

    /// Enable mDNS for local network peer discovery
    pub enable_mdns: bool,

    /// Enable relay client for NAT traversal
    pub enable_relay: bool,

    /// Bootstrap peers dialed at startup
    pub bootstrap_peers: Vec<String>,

    /// Loopback ports overlay peers may reach on this node
    pub expose: Vec<u16>,

    /// Extra server names certificates may be issued for
    pub extra_names: Vec<String>,

    /// Dial timeout in seconds (must be non-zero)
    pub dial_timeout_secs: u64,

    /// Idle timeout in seconds (0 = disabled)
    pub idle_timeout_secs: u64,

    /// TLS handshake timeout in seconds (must be non-zero)
    pub handshake_timeout_secs: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            state_dir: Self::default_state_dir(),
            bindings_path: PathBuf::from(DEFAULT_BINDINGS_PATH),
            listen_port: DEFAULT_LISTEN_PORT,
            bind_host: "0.0.0.0".to_string(),
            enable_mdns: true,
            enable_relay: true,
            bootstrap_peers: Vec::new(),
            expose: Vec::new(),
            extra_names: Vec::new(),
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT.as_secs(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
        }
    }
}

impl SidecarConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| SidecarError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that cannot produce a working node
    pub fn validate(&self) -> Result<()> {
        if self.dial_timeout_secs == 0 {
            return Err(SidecarError::ConfigError(
                "dial_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(SidecarError::ConfigError(
                "handshake_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| SidecarError::ConfigError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Returns the default state directory
    pub fn default_state_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("sidecar"))
            .unwrap_or_else(|| PathBuf::from("./sidecar-state"))
    }

    /// Returns the identity keypair path inside the state directory
    pub fn identity_path(&self) -> PathBuf {
        self.state_dir.join("identity.key")
    }

    /// Returns the certificate directory inside the state directory
    pub fn certs_dir(&self) -> PathBuf {
        self.state_dir.join("certs")
    }

    /// Certificate issuer for this node's hostname and extra names,
    /// persisting under [`Self::certs_dir`]
    pub fn identity_certificates(&self) -> Result<IdentityCertificates> {
        let certificates = IdentityCertificates::new(self.require_hostname()?)
            .with_store_dir(self.certs_dir());

        Ok(self
            .extra_names
            .iter()
            .fold(certificates, |certificates, name| certificates.with_name(name)))
    }

    /// Returns the configured hostname or fails
    pub fn require_hostname(&self) -> Result<&str> {
        match self.hostname.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(SidecarError::MissingHostname),
        }
    }

    /// Creates the state directory if it does not exist
    pub fn ensure_state_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).map_err(|e| SidecarError::StateDir {
            path: self.state_dir.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Per-connection proxy options derived from this configuration
    pub fn proxy_options(&self) -> ProxyOptions {
        let idle_timeout = match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        ProxyOptions::new()
            .with_dial_timeout(Duration::from_secs(self.dial_timeout_secs))
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .with_idle_timeout(idle_timeout)
    }

    /// Builder pattern: set hostname
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Builder pattern: set state directory
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    /// Builder pattern: set bindings file path
    pub fn with_bindings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bindings_path = path.into();
        self
    }

    /// Builder pattern: set overlay listen port
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Builder pattern: set bind host for binding listeners
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Builder pattern: enable/disable mDNS
    pub fn with_mdns(mut self, enable: bool) -> Self {
        self.enable_mdns = enable;
        self
    }

    /// Builder pattern: enable/disable relay
    pub fn with_relay(mut self, enable: bool) -> Self {
        self.enable_relay = enable;
        self
    }

    /// Builder pattern: add bootstrap peer
    pub fn with_bootstrap_peer(mut self, peer: impl Into<String>) -> Self {
        self.bootstrap_peers.push(peer.into());
        self
    }

    /// Builder pattern: expose a loopback port to overlay peers
    pub fn with_exposed_port(mut self, port: u16) -> Self {
        if !self.expose.contains(&port) {
            self.expose.push(port);
        }
        self
    }
}

/// Timeouts applied to every proxied connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Deadline for dialing the destination
    pub dial_timeout: Duration,

    /// Deadline for completing a TLS handshake
    pub handshake_timeout: Duration,

    /// Maximum time a relay direction may sit without reading
    pub idle_timeout: Option<Duration>,

    /// Pause after a failed accept before retrying
    pub accept_backoff: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            accept_backoff: Duration::from_millis(100),
        }
    }
}

impl ProxyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }
}

/// Write a secret into the state directory, readable by the owner only.
///
/// On unix the file is created with mode 0600, so the contents are never
/// visible under a wider mode. An existing file is narrowed before it is
/// truncated.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        options.mode(0o600);
        if path.exists() {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = SidecarConfig::default();
        assert_eq!(config.listen_port, 0);
        assert!(config.enable_mdns);
        assert!(config.enable_relay);
        assert_eq!(config.bindings_path, PathBuf::from(DEFAULT_BINDINGS_PATH));
        assert!(config.hostname.is_none());
    }

    #[test]
    fn test_builder_pattern() {
        let config = SidecarConfig::new()
            .with_hostname("edge-1")
            .with_listen_port(4001)
            .with_mdns(false)
            .with_exposed_port(22)
            .with_exposed_port(22);

        assert_eq!(config.require_hostname().unwrap(), "edge-1");
        assert_eq!(config.listen_port, 4001);
        assert!(!config.enable_mdns);
        assert_eq!(config.expose, vec![22]);
    }

    #[test]
    fn test_missing_hostname() {
        let config = SidecarConfig::default();
        assert!(matches!(
            config.require_hostname(),
            Err(SidecarError::MissingHostname)
        ));

        let blank = SidecarConfig::default().with_hostname("  ");
        assert!(blank.require_hostname().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("sidecar.toml");

        let original = SidecarConfig::new()
            .with_hostname("edge-1")
            .with_bootstrap_peer("/ip4/10.0.0.1/udp/4001/quic-v1");
        original.save(&path).unwrap();

        let loaded = SidecarConfig::load(&path).unwrap();
        assert_eq!(loaded.hostname.as_deref(), Some("edge-1"));
        assert_eq!(loaded.bootstrap_peers, original.bootstrap_peers);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SidecarConfig = toml::from_str("hostname = \"edge-2\"\nexpose = [22, 443]").unwrap();
        assert_eq!(config.hostname.as_deref(), Some("edge-2"));
        assert_eq!(config.expose, vec![22, 443]);
        assert_eq!(config.dial_timeout_secs, DEFAULT_DIAL_TIMEOUT.as_secs());
    }

    #[test]
    fn test_ensure_state_dir() {
        let temp = tempdir().unwrap();
        let config = SidecarConfig::new().with_state_dir(temp.path().join("a").join("b"));

        config.ensure_state_dir().unwrap();
        assert!(config.state_dir.is_dir());
        assert_eq!(config.identity_path(), config.state_dir.join("identity.key"));
    }

    #[test]
    fn test_proxy_options_from_config() {
        let mut config = SidecarConfig::default();
        config.idle_timeout_secs = 0;
        config.dial_timeout_secs = 3;

        let options = config.proxy_options();
        assert_eq!(options.idle_timeout, None);
        assert_eq!(options.dial_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_zero_dial_or_handshake_timeout_rejected() {
        assert!(SidecarConfig::default().validate().is_ok());

        let mut config = SidecarConfig::default();
        config.dial_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(SidecarError::ConfigError(_))));

        let mut config = SidecarConfig::default();
        config.handshake_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(SidecarError::ConfigError(_))));

        // Zero stays meaningful for the idle timeout
        let mut config = SidecarConfig::default();
        config.idle_timeout_secs = 0;
        assert!(config.validate().is_ok());

        let temp = tempdir().unwrap();
        let path = temp.path().join("sidecar.toml");
        std::fs::write(&path, "hostname = \"edge-1\"\ndial_timeout_secs = 0\n").unwrap();
        assert!(matches!(
            SidecarConfig::load(&path),
            Err(SidecarError::ConfigError(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_narrows_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let fresh = temp.path().join("fresh.key");
        write_private(&fresh, b"secret").unwrap();
        let mode = std::fs::metadata(&fresh).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let existing = temp.path().join("existing.key");
        std::fs::write(&existing, b"old").unwrap();
        std::fs::set_permissions(&existing, std::fs::Permissions::from_mode(0o644)).unwrap();
        write_private(&existing, b"new").unwrap();
        let mode = std::fs::metadata(&existing).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read(&existing).unwrap(), b"new");
    }

    #[test]
    fn test_identity_certificates_cover_extra_names() {
        let temp = tempdir().unwrap();
        let mut config = SidecarConfig::new()
            .with_hostname("edge-1")
            .with_state_dir(temp.path());
        config.extra_names = vec!["db.internal".to_string(), "EDGE-1".to_string()];

        let certificates = config.identity_certificates().unwrap();
        assert_eq!(certificates.hostname(), "edge-1");
        assert_eq!(certificates.names(), ["edge-1", "db.internal"]);

        assert!(SidecarConfig::new().identity_certificates().is_err());
    }
}
