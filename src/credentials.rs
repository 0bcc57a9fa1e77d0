//! Credential provider
//!
//! Builds the two layers of credentials a node connection carries:
//! - transport security from the node's TLS certificate
//! - a per-call credential carrying the hex-encoded secret token
//!
//! Call credentials are only ever handed out stacked on transport
//! credentials through [`CredentialSet`].

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Certificate, ClientTlsConfig};
use tonic::Request;
use tracing::debug;

use crate::config::CertSource;
use crate::error::{NodeLinkError, Result};

/// TLS credentials for the transport
#[derive(Debug, Clone)]
pub struct TransportCredentials {
    pem: Vec<u8>,
    domain: Option<String>,
}

impl TransportCredentials {
    /// Read and validate the certificate
    pub fn from_source(source: &CertSource, domain: Option<&str>) -> Result<Self> {
        let pem = match source {
            CertSource::Path(path) => std::fs::read(path).map_err(|e| {
                NodeLinkError::Credential(format!(
                    "cannot read certificate {}: {}",
                    path.display(),
                    e
                ))
            })?,
            CertSource::Pem { pem } => pem.clone().into_bytes(),
        };

        Self::from_pem(pem, domain)
    }

    pub fn from_pem(pem: Vec<u8>, domain: Option<&str>) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NodeLinkError::Credential(format!("malformed certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(NodeLinkError::Credential(
                "no certificate found in PEM data".to_string(),
            ));
        }

        debug!(certificates = certs.len(), "Loaded transport certificate");

        Ok(Self {
            pem,
            domain: domain.map(str::to_string),
        })
    }

    pub fn pem(&self) -> &[u8] {
        &self.pem
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// tonic TLS settings trusting this certificate
    pub fn tls_config(&self) -> ClientTlsConfig {
        let config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(&self.pem));
        match &self.domain {
            Some(domain) => config.domain_name(domain.clone()),
            None => config,
        }
    }
}

/// Secret token attached to every call as request metadata
#[derive(Clone)]
pub struct CallCredential {
    key: AsciiMetadataKey,
    value: AsciiMetadataValue,
}

impl std::fmt::Debug for CallCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCredential")
            .field("key", &self.key)
            .field("value", &"<redacted>")
            .finish()
    }
}

impl CallCredential {
    /// Read the secret token file
    pub fn from_file(path: &Path, header: &str) -> Result<Self> {
        let secret = std::fs::read(path).map_err(|e| {
            NodeLinkError::Credential(format!("cannot read secret {}: {}", path.display(), e))
        })?;

        if secret.is_empty() {
            return Err(NodeLinkError::Credential(format!(
                "secret {} is empty",
                path.display()
            )));
        }

        Self::from_bytes(&secret, header)
    }

    pub fn from_bytes(secret: &[u8], header: &str) -> Result<Self> {
        let key = AsciiMetadataKey::from_bytes(header.as_bytes()).map_err(|e| {
            NodeLinkError::Credential(format!("invalid secret header {:?}: {}", header, e))
        })?;
        let value = hex::encode(secret)
            .parse::<AsciiMetadataValue>()
            .map_err(|e| NodeLinkError::Credential(format!("invalid secret value: {}", e)))?;

        Ok(Self { key, value })
    }

    pub fn header(&self) -> &str {
        self.key.as_str()
    }

    /// Attach the secret to an outgoing request
    pub fn apply<T>(&self, request: &mut Request<T>) {
        request
            .metadata_mut()
            .insert(self.key.clone(), self.value.clone());
    }
}

/// Transport credentials with an optional call credential stacked on top
#[derive(Debug, Clone)]
pub struct CredentialSet {
    pub transport: TransportCredentials,
    pub call: Option<CallCredential>,
}

impl CredentialSet {
    pub fn combine(transport: TransportCredentials, call: Option<CallCredential>) -> Self {
        Self { transport, call }
    }
}

/// Poll until the secret file exists, or fail after `ceiling`
pub async fn wait_for_secret(path: &Path, ceiling: Duration, poll: Duration) -> Result<()> {
    let deadline = Instant::now() + ceiling;

    loop {
        if path.exists() {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(NodeLinkError::Timeout {
                operation: "waiting for secret token",
                after: ceiling,
            });
        }

        debug!(path = %path.display(), "Secret token not present yet");
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}
