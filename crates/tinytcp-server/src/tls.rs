//! TLS acceptor construction from PEM material.

use std::{fs, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio_rustls::TlsAcceptor;

use crate::ServerError;

/// Paths to the PEM encoded certificate chain and private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// Private key (PKCS#8, PKCS#1 or SEC1).
    pub key_path: PathBuf,
}

impl TlsConfig {
    /// Create a config from the two PEM paths.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self { cert_path: cert_path.into(), key_path: key_path.into() }
    }

    /// Read both files and build an acceptor.
    ///
    /// # Errors
    ///
    /// [`ServerError::Tls`] if a file is unreadable or the material invalid.
    pub fn build_acceptor(&self) -> Result<TlsAcceptor, ServerError> {
        let cert_pem = fs::read(&self.cert_path).map_err(|e| {
            ServerError::Tls(format!("failed to read {}: {e}", self.cert_path.display()))
        })?;
        let key_pem = fs::read(&self.key_path).map_err(|e| {
            ServerError::Tls(format!("failed to read {}: {e}", self.key_path.display()))
        })?;
        acceptor_from_pem(&cert_pem, &key_pem)
    }
}

/// Build an acceptor from in-memory PEM data.
///
/// # Errors
///
/// [`ServerError::Tls`] if no certificate or key is found, or rustls rejects
/// the pair.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, ServerError> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ServerError::Tls("no certificate found in PEM data".to_string()));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Tls(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key found in PEM data".to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("invalid certificate/key pair: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
