//! Binding Definitions
//!
//! A binding declares one forward: a local source port, a destination reachable
//! through the transport, and whether TLS is terminated on accept.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::{Result, SidecarError};

/// Default path of the bindings file
pub const DEFAULT_BINDINGS_PATH: &str = "/etc/sidecar/bindings.json";

/// One declared forward from a local port to a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Local port to listen on
    pub from: u16,

    /// Destination address (`host:port`) reachable through the transport
    pub to: String,

    /// Terminate TLS on accepted connections
    #[serde(default)]
    pub tls: bool,
}

impl Binding {
    pub fn new(from: u16, to: impl Into<String>) -> Self {
        Self {
            from,
            to: to.into(),
            tls: false,
        }
    }

    /// Builder pattern: enable/disable TLS termination
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn source_port(&self) -> u16 {
        self.from
    }

    pub fn destination(&self) -> &str {
        &self.to
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls
    }

    /// Address handed to `Transport::listen`
    pub fn listen_addr(&self) -> String {
        format!(":{}", self.from)
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{} -> {} (tls: {})", self.from, self.to, self.tls)
    }
}

/// Load and validate bindings from a JSON file
pub fn load_bindings(path: impl AsRef<Path>) -> Result<Vec<Binding>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        SidecarError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    parse_bindings(&contents)
}

/// Parse and validate bindings from a JSON document
pub fn parse_bindings(json: &str) -> Result<Vec<Binding>> {
    let bindings: Vec<Binding> = serde_json::from_str(json)?;
    validate_bindings(&bindings)?;
    Ok(bindings)
}

/// Check a binding set: non-empty, unique non-zero source ports, well-formed destinations
pub fn validate_bindings(bindings: &[Binding]) -> Result<()> {
    if bindings.is_empty() {
        return Err(SidecarError::EmptyBindings);
    }

    let mut seen = HashSet::with_capacity(bindings.len());
    for binding in bindings {
        if binding.from == 0 {
            return Err(SidecarError::ConfigError(format!(
                "binding to {} has no source port",
                binding.to
            )));
        }
        if !seen.insert(binding.from) {
            return Err(SidecarError::DuplicatePort(binding.from));
        }
        split_host_port(&binding.to)?;
    }

    Ok(())
}

/// Split a `host:port` destination, accepting bracketed IPv6 literals
pub fn split_host_port(destination: &str) -> Result<(&str, u16)> {
    let invalid = |reason: &str| SidecarError::InvalidDestination {
        destination: destination.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = destination
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?,
        None if host.contains(':') => return Err(invalid("IPv6 literals must be bracketed")),
        None => host,
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
    if port == 0 {
        return Err(invalid("port must be non-zero"));
    }

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_bindings() {
        let bindings = parse_bindings(
            r#"[
                {"from": 8443, "to": "10.0.0.5:443", "tls": true},
                {"from": 2222, "to": "10.0.0.5:22"}
            ]"#,
        )
        .unwrap();

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0], Binding::new(8443, "10.0.0.5:443").with_tls(true));
        assert!(!bindings[1].tls_enabled());
        assert_eq!(bindings[1].listen_addr(), ":2222");
    }

    #[test]
    fn test_empty_bindings_rejected() {
        assert!(matches!(parse_bindings("[]"), Err(SidecarError::EmptyBindings)));
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let bindings = vec![Binding::new(80, "a:80"), Binding::new(80, "b:80")];
        assert!(matches!(
            validate_bindings(&bindings),
            Err(SidecarError::DuplicatePort(80))
        ));
    }

    #[test]
    fn test_zero_source_port_rejected() {
        let bindings = vec![Binding::new(0, "a:80")];
        assert!(matches!(
            validate_bindings(&bindings),
            Err(SidecarError::ConfigError(_))
        ));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            parse_bindings(r#"{"from": 1}"#),
            Err(SidecarError::Serialization(_))
        ));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("db:5432").unwrap(), ("db", 5432));
        assert_eq!(split_host_port("[fd7a::1]:22").unwrap(), ("fd7a::1", 22));
        assert!(split_host_port("db").is_err());
        assert!(split_host_port(":22").is_err());
        assert!(split_host_port("db:0").is_err());
        assert!(split_host_port("db:http").is_err());
        assert!(split_host_port("fd7a::1:22").is_err());
    }

    #[test]
    fn test_load_bindings_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"from": 2222, "to": "node-a:22", "tls": false}}]"#).unwrap();

        let bindings = load_bindings(file.path()).unwrap();
        assert_eq!(bindings, vec![Binding::new(2222, "node-a:22")]);
    }

    #[test]
    fn test_load_bindings_missing_file() {
        let result = load_bindings("/nonexistent/bindings.json");
        assert!(matches!(result, Err(SidecarError::ConfigError(_))));
    }
}
