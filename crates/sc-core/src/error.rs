//! Error types for Sidecar
//!
//! Provides a unified error handling strategy using thiserror.

use thiserror::Error;

/// Result type alias for Sidecar operations
pub type Result<T> = std::result::Result<T, SidecarError>;

/// Unified error type for all Sidecar operations
#[derive(Error, Debug)]
pub enum SidecarError {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Node hostname not set (use --hostname or SIDECAR_NAME)")]
    MissingHostname,

    #[error("Bindings empty")]
    EmptyBindings,

    #[error("Source port {0} is declared by more than one binding")]
    DuplicatePort(u16),

    #[error("Invalid destination '{destination}': {reason}")]
    InvalidDestination { destination: String, reason: String },

    #[error("Failed to prepare state directory {path}: {reason}")]
    StateDir { path: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Network Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to initialize overlay network: {0}")]
    NetworkInitialization(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Failed to dial {destination}: {reason}")]
    DialError { destination: String, reason: String },

    #[error("Timed out dialing {destination}")]
    DialTimeout { destination: String },

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Invalid peer ID format: {0}")]
    InvalidPeerId(String),

    // ─────────────────────────────────────────────────────────────
    // Proxy Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to bind to port {port}: {reason}")]
    PortBindFailed { port: u16, reason: String },

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    // ─────────────────────────────────────────────────────────────
    // TLS Errors
    // ─────────────────────────────────────────────────────────────
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SidecarError {
    /// Shorthand for a dial failure on a destination
    pub fn dial(destination: impl Into<String>, reason: impl ToString) -> Self {
        SidecarError::DialError {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<libp2p::TransportError<std::io::Error>> for SidecarError {
    fn from(err: libp2p::TransportError<std::io::Error>) -> Self {
        SidecarError::NetworkInitialization(err.to_string())
    }
}

impl From<serde_json::Error> for SidecarError {
    fn from(err: serde_json::Error) -> Self {
        SidecarError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for SidecarError {
    fn from(err: bincode::Error) -> Self {
        SidecarError::Serialization(err.to_string())
    }
}

impl From<rustls::Error> for SidecarError {
    fn from(err: rustls::Error) -> Self {
        SidecarError::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for SidecarError {
    fn from(err: rcgen::Error) -> Self {
        SidecarError::Certificate(err.to_string())
    }
}
