//! In-memory stand-ins for the DNS provider, the router and the CA.

use alloc::sync::Arc;
use core::{
    net::IpAddr,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::SecretString;

use super::{
    certs::{CertError, CertificateIssuer, IssuedCertificate},
    ddns::{DnsUpdateError, DynamicDns, ExternalAddress},
    gateway::{Gateway, GatewayDiscovery, GatewayError, PortMapping, PortMappingEntry, Protocol},
};

/// Answers `OK` to everything and counts address updates.
#[derive(Debug, Default)]
pub(crate) struct StubDns {
    updates: AtomicUsize,
    addresses: Mutex<Vec<ExternalAddress>>,
}

impl StubDns {
    pub(crate) fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub(crate) fn last_address(&self) -> Option<ExternalAddress> {
        self.addresses.lock().unwrap().last().copied()
    }
}

#[async_trait]
impl DynamicDns for StubDns {
    async fn update_address(
        &self,
        _label: &str,
        _token: &SecretString,
        address: ExternalAddress,
    ) -> Result<(), DnsUpdateError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.addresses.lock().unwrap().push(address);
        Ok(())
    }

    async fn set_txt(
        &self,
        _label: &str,
        _token: &SecretString,
        _value: &str,
    ) -> Result<(), DnsUpdateError> {
        Ok(())
    }

    async fn clear_txt(&self, _label: &str, _token: &SecretString) -> Result<(), DnsUpdateError> {
        Ok(())
    }
}

/// Router with an in-memory mapping table and external IP `203.0.113.9`.
#[derive(Debug, Default)]
pub(crate) struct StubGateway {
    entries: Mutex<Vec<PortMappingEntry>>,
    deletes: AtomicUsize,
    fail_add: AtomicBool,
    hide_ip: AtomicBool,
}

impl StubGateway {
    pub(crate) fn seed(&self, entries: Vec<PortMappingEntry>) {
        *self.entries.lock().unwrap() = entries;
    }

    pub(crate) fn entries(&self) -> Vec<PortMappingEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_add(&self) {
        self.fail_add.store(true, Ordering::SeqCst);
    }

    pub(crate) fn hide_external_ip(&self) {
        self.hide_ip.store(true, Ordering::SeqCst);
    }

    pub(crate) fn has_mapping(&self, port: u16) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.external_port == port && e.protocol == Protocol::Tcp)
    }
}

#[async_trait]
impl Gateway for StubGateway {
    async fn generic_port_mapping_entry(
        &self,
        index: u32,
    ) -> Result<Option<PortMappingEntry>, GatewayError> {
        let entries = self.entries.lock().unwrap();
        Ok(usize::try_from(index)
            .ok()
            .and_then(|i| entries.get(i))
            .cloned())
    }

    async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<(), GatewayError> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(GatewayError::Upnp {
                code: 718,
                description: "ConflictInMappingEntry".to_owned(),
            });
        }
        self.entries.lock().unwrap().push(PortMappingEntry {
            external_port: mapping.external_port,
            protocol: mapping.protocol,
            internal_client: mapping.internal_client.to_string(),
            internal_port: mapping.internal_port,
            description: mapping.description.clone(),
            enabled: mapping.enabled,
        });
        Ok(())
    }

    async fn delete_port_mapping(
        &self,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<(), GatewayError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| !(e.external_port == external_port && e.protocol == protocol));
        if entries.len() == before {
            return Err(GatewayError::Upnp {
                code: 714,
                description: "NoSuchEntryInArray".to_owned(),
            });
        }
        Ok(())
    }

    async fn external_ip_address(&self) -> Result<IpAddr, GatewayError> {
        if self.hide_ip.load(Ordering::SeqCst) {
            return Err(GatewayError::Malformed("external address \"\"".to_owned()));
        }
        Ok(IpAddr::from([203, 0, 113, 9]))
    }
}

/// Hands out a shared [`StubGateway`], or fails as if no router answered.
#[derive(Debug)]
pub(crate) struct StubDiscovery {
    pub(crate) gateway: Option<Arc<StubGateway>>,
}

#[async_trait]
impl GatewayDiscovery for StubDiscovery {
    async fn discover(&self) -> Result<Arc<dyn Gateway>, GatewayError> {
        match &self.gateway {
            Some(gw) => Ok(gw.clone()),
            None => Err(GatewayError::NotFound),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum IssuerBehaviour {
    Succeed,
    TimeOut,
    RejectAuth,
}

/// Certificate authority returning self-signed certificates or a chosen failure.
#[derive(Debug)]
pub(crate) struct StubIssuer {
    behaviour: IssuerBehaviour,
    delay: Duration,
    issued: AtomicUsize,
}

impl StubIssuer {
    const fn with(behaviour: IssuerBehaviour) -> Self {
        Self {
            behaviour,
            delay: Duration::ZERO,
            issued: AtomicUsize::new(0),
        }
    }

    pub(crate) const fn succeeding() -> Self {
        Self::with(IssuerBehaviour::Succeed)
    }

    pub(crate) const fn timing_out() -> Self {
        Self::with(IssuerBehaviour::TimeOut)
    }

    pub(crate) const fn rejecting_auth() -> Self {
        Self::with(IssuerBehaviour::RejectAuth)
    }

    pub(crate) const fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn issued_count(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateIssuer for StubIssuer {
    async fn issue(
        &self,
        domain: &str,
        _dns_token: &SecretString,
    ) -> Result<IssuedCertificate, CertError> {
        tokio::time::sleep(self.delay).await;
        match self.behaviour {
            IssuerBehaviour::Succeed => {
                let rcgen::CertifiedKey { cert, signing_key } =
                    rcgen::generate_simple_self_signed(vec![domain.to_owned()])
                        .map_err(|e| CertError::KeyGeneration(e.to_string()))?;
                self.issued.fetch_add(1, Ordering::SeqCst);
                Ok(IssuedCertificate {
                    cert_chain_pem: cert.pem(),
                    private_key_pem: SecretString::from(signing_key.serialize_pem()),
                })
            }
            IssuerBehaviour::TimeOut => Err(CertError::ChallengeTimeout {
                domain: domain.to_owned(),
                waited: Duration::from_secs(300),
            }),
            IssuerBehaviour::RejectAuth => Err(CertError::AuthRejected),
        }
    }
}
