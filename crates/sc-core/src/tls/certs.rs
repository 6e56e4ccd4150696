//! Identity-backed certificate issuance
//!
//! Issues self-signed certificates for the node's own names, caching them in
//! memory and, when a directory is configured, on disk between runs.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::config::write_private;
use crate::error::{Result, SidecarError};
use crate::transport::{CertificateProvider, HandshakeInfo};

/// Certificate provider for the names this node owns on the overlay
#[derive(Debug)]
pub struct IdentityCertificates {
    /// Primary name, used when the client sends no SNI or an unknown one
    hostname: String,

    /// All names certificates may be issued for (normalized)
    names: Vec<String>,

    /// Where issued certificates are persisted
    store_dir: Option<PathBuf>,

    /// Issued certificates by name
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl IdentityCertificates {
    /// Create a provider issuing for `hostname`, kept in memory only
    pub fn new(hostname: impl AsRef<str>) -> Self {
        let hostname = normalize_name(hostname.as_ref());
        Self {
            names: vec![hostname.clone()],
            hostname,
            store_dir: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Builder pattern: persist certificates under `dir`
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Builder pattern: allow issuing for an additional name
    pub fn with_name(mut self, name: impl AsRef<str>) -> Self {
        let name = normalize_name(name.as_ref());
        if !name.is_empty() && !self.names.contains(&name) {
            self.names.push(name);
        }
        self
    }

    /// Primary hostname
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Names this provider issues for
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of certificates issued or loaded so far
    pub fn issued_count(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Pick the certificate name for a handshake
    fn select_name(&self, handshake: &HandshakeInfo) -> String {
        handshake
            .server_name
            .as_deref()
            .map(normalize_name)
            .filter(|name| self.names.contains(name))
            .unwrap_or_else(|| self.hostname.clone())
    }

    /// Return the cached certificate for `name`, loading or generating it first
    fn certificate_named(&self, name: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(key) = self
            .cache
            .read()
            .map_err(|_| SidecarError::Certificate("certificate cache poisoned".to_string()))?
            .get(name)
        {
            return Ok(Arc::clone(key));
        }

        let mut cache = self
            .cache
            .write()
            .map_err(|_| SidecarError::Certificate("certificate cache poisoned".to_string()))?;

        // Another handshake may have issued it while we waited
        if let Some(key) = cache.get(name) {
            return Ok(Arc::clone(key));
        }

        let key = Arc::new(self.load_or_issue(name)?);
        cache.insert(name.to_string(), Arc::clone(&key));
        Ok(key)
    }

    fn load_or_issue(&self, name: &str) -> Result<CertifiedKey> {
        if let Some(dir) = &self.store_dir {
            let (cert_path, key_path) = store_paths(dir, name);
            if cert_path.exists() && key_path.exists() {
                let cert_pem = std::fs::read_to_string(&cert_path)?;
                let key_pem = std::fs::read_to_string(&key_path)?;
                debug!("Loaded certificate for {} from {}", name, cert_path.display());
                return certified_key_from_pem(&cert_pem, &key_pem);
            }
        }

        let generated = rcgen::generate_simple_self_signed(vec![name.to_string()])?;
        let cert_pem = generated.cert.pem();
        let key_pem = generated.key_pair.serialize_pem();

        if let Some(dir) = &self.store_dir {
            persist(dir, name, &cert_pem, &key_pem)?;
        }

        info!("Issued certificate for {}", name);
        certified_key_from_pem(&cert_pem, &key_pem)
    }
}

impl CertificateProvider for IdentityCertificates {
    fn certificate_for(&self, handshake: &HandshakeInfo) -> Result<Arc<CertifiedKey>> {
        let name = self.select_name(handshake);
        self.certificate_named(&name)
    }
}

/// Build a `CertifiedKey` from PEM-encoded certificate chain and private key
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SidecarError::Certificate(format!("Failed to parse certificate PEM: {e}")))?;

    if certs.is_empty() {
        return Err(SidecarError::Certificate(
            "No certificates found in PEM".to_string(),
        ));
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
            .map_err(|e| SidecarError::Certificate(format!("Failed to parse private key PEM: {e}")))?
            .ok_or_else(|| SidecarError::Certificate("No private key found in PEM".to_string()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| SidecarError::Certificate(format!("Failed to create signing key: {e}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

fn persist(dir: &Path, name: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let (cert_path, key_path) = store_paths(dir, name);

    std::fs::write(&cert_path, cert_pem)?;
    write_private(&key_path, key_pem.as_bytes())?;

    Ok(())
}

fn store_paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    let file_stem: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            _ => '_',
        })
        .collect();
    (
        dir.join(format!("{file_stem}.crt")),
        dir.join(format!("{file_stem}.key")),
    )
}

/// Lowercase, trimmed, without a trailing dot
fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Edge-1.Mesh."), "edge-1.mesh");
        assert_eq!(normalize_name("  db  "), "db");
    }

    #[test]
    fn test_store_paths_sanitized() {
        let (cert, key) = store_paths(Path::new("/state/certs"), "*.mesh/x");
        assert_eq!(cert, PathBuf::from("/state/certs/_.mesh_x.crt"));
        assert_eq!(key, PathBuf::from("/state/certs/_.mesh_x.key"));
    }

    #[test]
    fn test_known_sni_gets_own_certificate() {
        let provider = IdentityCertificates::new("edge-1").with_name("api.edge-1");

        let primary = provider.certificate_for(&HandshakeInfo::default()).unwrap();
        let api = provider
            .certificate_for(&HandshakeInfo::for_server_name("API.edge-1"))
            .unwrap();

        assert_ne!(primary.cert[0], api.cert[0]);
        assert_eq!(provider.issued_count(), 2);
    }

    #[test]
    fn test_unknown_sni_falls_back_to_hostname() {
        let provider = IdentityCertificates::new("edge-1");

        let primary = provider
            .certificate_for(&HandshakeInfo::for_server_name("edge-1"))
            .unwrap();
        let unknown = provider
            .certificate_for(&HandshakeInfo::for_server_name("elsewhere.example"))
            .unwrap();

        assert!(Arc::ptr_eq(&primary, &unknown));
        assert_eq!(provider.issued_count(), 1);
    }

    #[test]
    fn test_certificates_cached() {
        let provider = IdentityCertificates::new("edge-1");
        let first = provider.certificate_for(&HandshakeInfo::default()).unwrap();
        let second = provider.certificate_for(&HandshakeInfo::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_certificates_persisted_and_reloaded() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("certs");

        let first = IdentityCertificates::new("edge-1").with_store_dir(&dir);
        let issued = first.certificate_for(&HandshakeInfo::default()).unwrap();
        assert!(dir.join("edge-1.crt").exists());
        assert!(dir.join("edge-1.key").exists());

        let second = IdentityCertificates::new("edge-1").with_store_dir(&dir);
        let reloaded = second.certificate_for(&HandshakeInfo::default()).unwrap();
        assert_eq!(issued.cert, reloaded.cert);
    }

    #[cfg(unix)]
    #[test]
    fn test_persisted_key_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let dir = temp.path().join("certs");
        let certificates = IdentityCertificates::new("edge-1").with_store_dir(&dir);
        certificates.certificate_for(&HandshakeInfo::default()).unwrap();

        let key_mode = std::fs::metadata(dir.join("edge-1.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600);
    }

    #[test]
    fn test_certified_key_from_invalid_pem() {
        assert!(certified_key_from_pem("", "").is_err());

        let generated = rcgen::generate_simple_self_signed(vec!["x".to_string()]).unwrap();
        let result = certified_key_from_pem(&generated.cert.pem(), "not a key");
        assert!(matches!(result, Err(SidecarError::Certificate(_))));
    }
}
