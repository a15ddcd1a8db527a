//! Publicly trusted TLS certificates for the external hostname.
//!
//! Certificates are obtained with an ACME DNS-01 challenge published through the same
//! dynamic DNS provider that serves the A record, so no inbound port 80 is needed.
//! Once stored they are reused across restarts; only a missing pair triggers issuance.

mod acme;
mod propagation;
mod store;

use alloc::sync::Arc;
use core::{fmt, time::Duration};
use std::io;

use async_trait::async_trait;
use secrecy::{ExposeSecret as _, SecretString};
use thiserror::Error as ThisError;
use tracing::{info, warn};

pub use acme::AcmeIssuer;
pub use propagation::PropagationChecker;
pub use store::{CertificateStore, TlsCredential};

use crate::external::qualified_hostname;

#[derive(Debug, ThisError)]
pub enum CertError {
    #[error("no certificate stored for {0}")]
    NotFound(String),
    #[error("stored certificate for {hostname} is unusable: {reason}")]
    Load { hostname: String, reason: String },
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("ACME account registration failed: {0}")]
    Registration(String),
    #[error("DNS-01 challenge setup failed: {0}")]
    ChallengeConfiguration(String),
    #[error("challenge TXT record for {domain} not visible after {waited:?}")]
    ChallengeTimeout { domain: String, waited: Duration },
    #[error("DNS provider rejected the challenge record update")]
    AuthRejected,
    #[error("certificate issuance failed: {0}")]
    Issuance(String),
    #[error("saving certificate failed: {0}")]
    Persist(#[source] io::Error),
    #[error("certificate material could not be parsed: {0}")]
    Parse(String),
}

impl CertError {
    /// Operator-facing hints on what to check next.
    pub fn hints(&self) -> Vec<&'static str> {
        match *self {
            Self::ChallengeTimeout { .. } => vec![
                "The TXT record did not propagate in time; this is usually transient, retry later.",
                "Check that outbound DNS (UDP/TCP port 53) is not blocked by a firewall.",
                "Some networks intercept DNS; the configured public resolvers must be reachable.",
            ],
            Self::AuthRejected => vec![
                "DuckDNS answered KO: verify the token on duckdns.org.",
                "Verify that the hostname belongs to the account owning the token.",
            ],
            Self::Registration(_) | Self::Issuance(_) => vec![
                "The certificate authority rejected the request; check network access to it.",
                "Let's Encrypt rate limits apply per domain; wait before retrying repeatedly.",
            ],
            Self::Persist(_) => vec!["Check that the certificate directory is writable."],
            Self::NotFound(_)
            | Self::Load { .. }
            | Self::KeyGeneration(_)
            | Self::ChallengeConfiguration(_)
            | Self::Parse(_) => Vec::new(),
        }
    }
}

/// A freshly issued chain and key, not yet on disk.
pub struct IssuedCertificate {
    pub cert_chain_pem: String,
    pub private_key_pem: SecretString,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("cert_chain_pem_len", &self.cert_chain_pem.len())
            .finish_non_exhaustive()
    }
}

/// Obtains a certificate for one domain by proving control of it.
#[async_trait]
pub trait CertificateIssuer: Send + Sync + fmt::Debug {
    async fn issue(
        &self,
        domain: &str,
        dns_token: &SecretString,
    ) -> Result<IssuedCertificate, CertError>;
}

/// Load-or-obtain front for the certificate store.
#[derive(Debug, Clone)]
pub struct CertificateProvisioner {
    store: CertificateStore,
    issuer: Arc<dyn CertificateIssuer>,
    suffix: String,
}

impl CertificateProvisioner {
    pub fn new(
        store: CertificateStore,
        issuer: Arc<dyn CertificateIssuer>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            issuer,
            suffix: suffix.into(),
        }
    }

    /// Reads the stored pair for `hostname` (a bare label gets the suffix appended).
    ///
    /// # Errors
    ///
    /// [`CertError::NotFound`] if either file is missing, [`CertError::Load`] if the
    /// files cannot be read or parsed.
    pub async fn load_existing(&self, hostname: &str) -> Result<TlsCredential, CertError> {
        self.store
            .load(&qualified_hostname(hostname, &self.suffix))
            .await
    }

    /// Issues a new certificate, stores it and returns it ready for use.
    ///
    /// # Errors
    ///
    /// Any issuance error, [`CertError::Persist`] if writing fails, or
    /// [`CertError::Parse`] if the issued material is unusable.
    #[tracing::instrument(skip(self, dns_token))]
    pub async fn obtain_via_dns_challenge(
        &self,
        hostname: &str,
        dns_token: &SecretString,
    ) -> Result<TlsCredential, CertError> {
        let domain = qualified_hostname(hostname, &self.suffix);
        info!(%domain, "Requesting certificate via DNS-01");
        let issued = self.issuer.issue(&domain, dns_token).await?;
        self.store
            .save(&domain, issued.cert_chain_pem.as_bytes(), &issued.private_key_pem)
            .await?;
        info!(%domain, "Certificate issued and stored");
        TlsCredential::from_pem(
            &domain,
            issued.cert_chain_pem.as_bytes(),
            issued.private_key_pem.expose_secret().as_bytes(),
        )
    }

    /// Uses the stored certificate when there is one, otherwise issues a new one.
    ///
    /// # Errors
    ///
    /// Errors from [`Self::obtain_via_dns_challenge`].
    pub async fn load_or_obtain(
        &self,
        hostname: &str,
        dns_token: &SecretString,
    ) -> Result<TlsCredential, CertError> {
        match self.load_existing(hostname).await {
            Ok(credential) => {
                info!(hostname = %credential.hostname(), "Using stored certificate");
                Ok(credential)
            }
            Err(CertError::NotFound(_)) => self.obtain_via_dns_challenge(hostname, dns_token).await,
            Err(e) => {
                warn!("Stored certificate is unusable, requesting a new one: {e}");
                self.obtain_via_dns_challenge(hostname, dns_token).await
            }
        }
    }
}
