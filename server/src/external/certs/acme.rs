//! ACME DNS-01 issuance with `instant-acme`.
//!
//! The challenge TXT record is published through the dynamic DNS provider and removed
//! again after validation, whether or not it succeeded.

use alloc::sync::Arc;
use core::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use secrecy::SecretString;
use tokio::time::sleep;
use tracing::{Instrument as _, debug, info, warn};

use super::{CertError, CertificateIssuer, IssuedCertificate, PropagationChecker};
use crate::external::ddns::{DnsUpdateError, DynamicDns};

const MAX_ORDER_POLLS: u32 = 10;

#[derive(Debug, Clone)]
pub struct AcmeIssuer {
    directory_url: String,
    dns: Arc<dyn DynamicDns>,
    propagation: PropagationChecker,
}

impl AcmeIssuer {
    pub fn new(
        directory_url: impl Into<String>,
        dns: Arc<dyn DynamicDns>,
        propagation: PropagationChecker,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            dns,
            propagation,
        }
    }

    /// Registers a throwaway account; its key is never reused.
    async fn register(&self) -> Result<Account, CertError> {
        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &[],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(|e| CertError::Registration(e.to_string()))?;
        debug!(directory = %self.directory_url, "ACME account registered");
        Ok(account)
    }

    /// Publishes the TXT value, waits for propagation and tells the CA to validate.
    async fn answer_challenge(
        &self,
        order: &mut Order,
        domain: &str,
        dns_token: &SecretString,
    ) -> Result<(), CertError> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| CertError::ChallengeConfiguration(e.to_string()))?;

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                other => {
                    return Err(CertError::Issuance(format!(
                        "authorization is {other:?}"
                    )));
                }
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| {
                    CertError::ChallengeConfiguration("CA offered no dns-01 challenge".to_owned())
                })?;
            let value = order.key_authorization(challenge).dns_value();

            self.dns
                .set_txt(domain, dns_token, &value)
                .await
                .map_err(|e| match e {
                    DnsUpdateError::AuthFailed => CertError::AuthRejected,
                    other => CertError::ChallengeConfiguration(other.to_string()),
                })?;
            info!(domain, "Challenge TXT record published, waiting for propagation");

            self.propagation.wait_for_txt(domain, &value).await?;

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| CertError::Issuance(e.to_string()))?;
        }
        Ok(())
    }

    async fn wait_until_ready(order: &mut Order) -> Result<(), CertError> {
        let mut delay = Duration::from_millis(500);
        for _ in 0..MAX_ORDER_POLLS {
            sleep(delay).await;
            let state = order
                .refresh()
                .await
                .map_err(|e| CertError::Issuance(e.to_string()))?;
            match state.status {
                OrderStatus::Ready => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(CertError::Issuance("CA marked the order invalid".to_owned()));
                }
                OrderStatus::Pending | OrderStatus::Processing | OrderStatus::Valid => {
                    debug!(status = ?state.status, "Order not ready yet");
                }
            }
            delay = (delay * 2).min(Duration::from_secs(10));
        }
        Err(CertError::Issuance(
            "order did not become ready in time".to_owned(),
        ))
    }

    async fn finalize(order: &mut Order, domain: &str) -> Result<IssuedCertificate, CertError> {
        let key_pair = KeyPair::generate().map_err(|e| CertError::KeyGeneration(e.to_string()))?;
        let mut params = CertificateParams::new(vec![domain.to_owned()])
            .map_err(|e| CertError::KeyGeneration(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| CertError::KeyGeneration(e.to_string()))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|e| CertError::Issuance(e.to_string()))?;

        let mut polls = 0;
        let cert_chain_pem = loop {
            match order
                .certificate()
                .await
                .map_err(|e| CertError::Issuance(e.to_string()))?
            {
                Some(chain) => break chain,
                None if polls < MAX_ORDER_POLLS => {
                    polls += 1;
                    sleep(Duration::from_secs(1)).await;
                }
                None => {
                    return Err(CertError::Issuance(
                        "certificate was not issued in time".to_owned(),
                    ));
                }
            }
        };

        Ok(IssuedCertificate {
            cert_chain_pem,
            private_key_pem: SecretString::from(key_pair.serialize_pem()),
        })
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(
        &self,
        domain: &str,
        dns_token: &SecretString,
    ) -> Result<IssuedCertificate, CertError> {
        let span = tracing::info_span!("cert.acquire", domain);
        async move {
            let account = self.register().await?;
            let mut order = account
                .new_order(&NewOrder {
                    identifiers: &[Identifier::Dns(domain.to_owned())],
                })
                .await
                .map_err(|e| CertError::Issuance(e.to_string()))?;

            let validated = match self.answer_challenge(&mut order, domain, dns_token).await {
                Ok(()) => Self::wait_until_ready(&mut order).await,
                Err(e) => Err(e),
            };
            if let Err(e) = self.dns.clear_txt(domain, dns_token).await {
                warn!("Failed to remove challenge TXT record: {e}");
            }
            validated?;

            let issued = Self::finalize(&mut order, domain).await?;
            info!("Certificate issued");
            Ok(issued)
        }
        .instrument(span)
        .await
    }
}
