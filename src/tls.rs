//! TLS material for the controller/agent channel.
//!
//! Loads PEM files named by [`TlsConfig`] and produces the server-side config
//! used by agents and the client-side config used by the controller's
//! connection pool. Both sides authenticate each other (mTLS).

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Error type for TLS configuration issues.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Loaded TLS materials ready for use with tonic.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
    server_name: String,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Load TLS materials from file paths specified in the config.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Any required path is not configured
    /// - Any file does not exist or cannot be read
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_cert_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::MissingCaCert)?;
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        if !ca_cert_path.exists() {
            return Err(TlsError::CaCertNotFound(ca_cert_path.clone()));
        }
        if !cert_path.exists() {
            return Err(TlsError::CertNotFound(cert_path.clone()));
        }
        if !key_path.exists() {
            return Err(TlsError::KeyNotFound(key_path.clone()));
        }

        let ca_pem = fs::read(ca_cert_path).await?;
        let cert_pem = fs::read(cert_path).await?;
        let key_pem = fs::read(key_path).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
            server_name: config.server_name().to_string(),
        })
    }

    /// Resolve the optional TLS identity for a process.
    ///
    /// Disabled TLS yields `None`. Incomplete or unreadable material is an
    /// error unless `allow_insecure` is set, in which case the process falls
    /// back to plaintext with a warning.
    pub async fn resolve(config: &TlsConfig) -> Result<Option<Self>, TlsError> {
        if !config.enabled {
            return Ok(None);
        }

        if !config.is_complete() {
            if config.allow_insecure {
                tracing::warn!("TLS enabled but certificate paths incomplete, running in insecure mode");
                return Ok(None);
            }
            // Surface which path is missing.
            return Self::load(config).await.map(Some);
        }

        match Self::load(config).await {
            Ok(identity) => {
                tracing::info!("TLS enabled with mTLS authentication");
                Ok(Some(identity))
            }
            Err(e) if config.allow_insecure => {
                tracing::warn!(error = %e, "TLS certificate loading failed, running in insecure mode");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Server TLS config for agents: presents the agent certificate and
    /// requires a controller certificate signed by the CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client TLS config for the controller's connection pool.
    ///
    /// Agents are usually dialled by IP, so certificate validation checks CA
    /// trust against a shared server name rather than the dialled host.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(self.server_name.clone())
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}
