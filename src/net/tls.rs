use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::digest::{digest, SHA256};
use std::path::Path;
use tracing::{info, warn};
use wtransport::tls::Sha256Digest;
use wtransport::Identity;

// Dev certificate paths
const DEV_CERT_FILE: &str = "certs/cert.pem";
const DEV_KEY_FILE: &str = "certs/key.pem";

/// Names put into a generated self-signed certificate
const SELF_SIGNED_SANS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// TLS identity of the QUIC server engine
pub struct TlsConfig {
    /// The wtransport Identity containing certificate and key
    pub identity: Identity,
    /// Base64-encoded SHA-256 hash of the certificate (for client pinning)
    pub cert_hash: String,
}

impl TlsConfig {
    /// Load TLS configuration
    ///
    /// Uses `cert_path`/`key_path` when both are set, then `certs/` if present,
    /// and finally falls back to a fresh self-signed certificate.
    pub async fn load(cert_path: Option<&str>, key_path: Option<&str>) -> Result<Self> {
        if let (Some(cert_path), Some(key_path)) = (cert_path, key_path) {
            info!("Loading TLS certificate from configured paths");
            return Self::load_from_paths(cert_path, key_path).await;
        }

        if Path::new(DEV_CERT_FILE).exists() && Path::new(DEV_KEY_FILE).exists() {
            info!("Loading dev certificate from certs/");
            return Self::load_from_paths(DEV_CERT_FILE, DEV_KEY_FILE).await;
        }

        warn!("No TLS certificate configured, generating a self-signed one");
        Self::self_signed()
    }

    async fn load_from_paths(cert_path: &str, key_path: &str) -> Result<Self> {
        let identity = Identity::load_pemfiles(cert_path, key_path)
            .await
            .context("Failed to load certificate from PEM files")?;
        Ok(Self::from_identity(identity))
    }

    /// Generate a self-signed certificate valid for local addresses
    pub fn self_signed() -> Result<Self> {
        let identity =
            Identity::self_signed(SELF_SIGNED_SANS).context("Failed to generate self-signed certificate")?;
        Ok(Self::from_identity(identity))
    }

    fn from_identity(identity: Identity) -> Self {
        let cert_hash = Self::compute_cert_hash(&identity);
        info!("Certificate hash: {}", cert_hash);
        Self {
            identity,
            cert_hash,
        }
    }

    fn compute_cert_hash(identity: &Identity) -> String {
        identity
            .certificate_chain()
            .as_slice()
            .first()
            .map(|cert| {
                let hash = digest(&SHA256, cert.der());
                STANDARD.encode(hash.as_ref())
            })
            .unwrap_or_default()
    }

    /// Digest clients pin to reach this server
    pub fn digest(&self) -> Option<Sha256Digest> {
        parse_cert_hash(&self.cert_hash)
    }
}

/// Parse a base64 SHA-256 certificate hash as printed by the server
pub fn parse_cert_hash(encoded: &str) -> Option<Sha256Digest> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    Some(Sha256Digest::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_hash_format() {
        let config = TlsConfig::self_signed().unwrap();
        let decoded = STANDARD.decode(&config.cert_hash).unwrap();
        assert_eq!(decoded.len(), 32);
        assert!(config.digest().is_some());
    }

    #[test]
    fn test_parse_cert_hash_rejects_garbage() {
        assert!(parse_cert_hash("not base64!").is_none());
        assert!(parse_cert_hash(&STANDARD.encode([1u8; 16])).is_none());
        assert!(parse_cert_hash(&STANDARD.encode([1u8; 32])).is_some());
    }

    #[tokio::test]
    async fn test_load_without_paths_falls_back() {
        let config = TlsConfig::load(Some("cert.pem"), None).await.unwrap();
        assert!(config.digest().is_some());
    }
}
