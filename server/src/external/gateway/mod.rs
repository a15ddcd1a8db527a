//! Router port forwarding through a UPnP Internet Gateway Device.
//!
//! Discovery finds a `WANIPConnection` service (version 2 first, then 1) and yields a
//! [`Gateway`]. [`PortMapper`] holds the mapping policy and works against any gateway,
//! so both protocol versions share one code path.

mod local_addr;
mod soap;
mod ssdp;
mod xml;

use alloc::sync::Arc;
use core::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

use crate::external::ddns::ExternalAddress;

pub use local_addr::{resolve_local_address, select_local_address};
pub use soap::IgdClient;
pub use ssdp::SSDP_MULTICAST;

/// Settle time after every delete, for routers that apply changes lazily.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Upper bound for the mapping table scan.
pub const DEFAULT_SCAN_LIMIT: u32 = 50;
/// Direct deletes issued after the scan, for entries the scan did not surface.
pub const DIRECT_DELETE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("TCP") => Some(Self::Tcp),
            s if s.eq_ignore_ascii_case("UDP") => Some(Self::Udp),
            _ => None,
        }
    }
}

/// A mapping to be created on the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal_port: u16,
    pub internal_client: Ipv4Addr,
    pub protocol: Protocol,
    pub description: String,
    pub enabled: bool,
    /// Seconds; 0 means the mapping never expires.
    pub lease_duration: u32,
}

/// An existing mapping as reported by the gateway's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingEntry {
    pub external_port: u16,
    pub protocol: Protocol,
    pub internal_client: String,
    pub internal_port: u16,
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, ThisError)]
pub enum GatewayError {
    #[error("no UPnP gateway responded")]
    NotFound,
    #[error("no usable local IPv4 address")]
    NoLocalAddress,
    #[error("gateway refused port mapping for {port}: {reason}")]
    MappingFailed { port: u16, reason: String },
    #[error("gateway returned UPnP error {code}: {description}")]
    Upnp { code: u16, description: String },
    #[error("gateway request failed: {0}")]
    Transport(String),
    #[error("malformed gateway response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// The subset of `WANIPConnection` actions this server uses.
#[async_trait]
pub trait Gateway: Send + Sync + fmt::Debug {
    /// `GetGenericPortMappingEntry`. `Ok(None)` past the end of the table.
    async fn generic_port_mapping_entry(
        &self,
        index: u32,
    ) -> Result<Option<PortMappingEntry>, GatewayError>;

    async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<(), GatewayError>;

    async fn delete_port_mapping(
        &self,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<(), GatewayError>;

    async fn external_ip_address(&self) -> Result<IpAddr, GatewayError>;
}

/// Finds the gateway on the local network.
#[async_trait]
pub trait GatewayDiscovery: Send + Sync + fmt::Debug {
    async fn discover(&self) -> Result<Arc<dyn Gateway>, GatewayError>;
}

/// SSDP discovery, trying `WANIPConnection:2` before `WANIPConnection:1`.
#[derive(Debug, Clone)]
pub struct UpnpDiscovery {
    /// Where M-SEARCH requests go, [`SSDP_MULTICAST`] outside of tests.
    pub search_target: SocketAddr,
    pub search_timeout: Duration,
    client: reqwest::Client,
}

impl UpnpDiscovery {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(search_target: SocketAddr, search_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            search_target,
            search_timeout,
            client,
        })
    }
}

#[async_trait]
impl GatewayDiscovery for UpnpDiscovery {
    #[tracing::instrument(skip(self), fields(target = %self.search_target))]
    async fn discover(&self) -> Result<Arc<dyn Gateway>, GatewayError> {
        for service_type in [ssdp::WAN_IP_CONNECTION_V2, ssdp::WAN_IP_CONNECTION_V1] {
            let location = match ssdp::search(self.search_target, service_type, self.search_timeout)
                .await
            {
                Ok(location) => location,
                Err(e) => {
                    debug!(service_type, "No answer to SSDP search: {e}");
                    continue;
                }
            };
            match ssdp::control_url(&self.client, &location, service_type).await {
                Ok(control_url) => {
                    info!(service_type, %control_url, "Found UPnP gateway");
                    return Ok(Arc::new(IgdClient::new(
                        self.client.clone(),
                        control_url,
                        service_type,
                    )));
                }
                Err(e) => warn!(service_type, %location, "Unusable device description: {e}"),
            }
        }
        Err(GatewayError::NotFound)
    }
}

/// Installs and removes the single forward of the HTTPS port.
///
/// `external_port` is the port opened on the router, `internal_port` the port this
/// server listens on. The two differ when the listener was moved with `--port`.
#[derive(Debug, Clone)]
pub struct PortMapper {
    pub external_port: u16,
    pub internal_port: u16,
    pub description: String,
    pub settle_delay: Duration,
    pub scan_limit: u32,
}

impl PortMapper {
    pub fn new(external_port: u16, internal_port: u16, description: impl Into<String>) -> Self {
        Self {
            external_port,
            internal_port,
            description: description.into(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }

    #[must_use]
    pub const fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Clears any previous forward of the external port, then creates a fresh one to
    /// `local_address`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MappingFailed`] if the gateway rejects the new mapping.
    #[tracing::instrument(skip(self, gateway), fields(port = self.external_port))]
    pub async fn install_mapping(
        &self,
        gateway: &dyn Gateway,
        local_address: Ipv4Addr,
    ) -> Result<(), GatewayError> {
        self.clear_stale_entries(gateway).await;

        for attempt in 1..=DIRECT_DELETE_ATTEMPTS {
            match gateway
                .delete_port_mapping(self.external_port, Protocol::Tcp)
                .await
            {
                Ok(()) => debug!(attempt, "Deleted leftover mapping"),
                Err(e) => debug!(attempt, "Direct delete: {e}"),
            }
            tokio::time::sleep(self.settle_delay).await;
        }

        let mapping = PortMapping {
            external_port: self.external_port,
            internal_port: self.internal_port,
            internal_client: local_address,
            protocol: Protocol::Tcp,
            description: self.description.clone(),
            enabled: true,
            lease_duration: 0,
        };
        gateway
            .add_port_mapping(&mapping)
            .await
            .map_err(|e| GatewayError::MappingFailed {
                port: self.external_port,
                reason: e.to_string(),
            })?;
        info!(%local_address, "Port mapping installed");
        Ok(())
    }

    async fn clear_stale_entries(&self, gateway: &dyn Gateway) {
        let mut index = 0;
        let mut visited = 0;
        while visited < self.scan_limit {
            visited += 1;
            let entry = match gateway.generic_port_mapping_entry(index).await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    debug!(index, "Stopping mapping scan: {e}");
                    break;
                }
            };
            if entry.external_port != self.external_port || entry.protocol != Protocol::Tcp {
                index += 1;
                continue;
            }
            debug!(index, client = %entry.internal_client, "Removing previous mapping");
            if let Err(e) = gateway
                .delete_port_mapping(entry.external_port, entry.protocol)
                .await
            {
                warn!(index, "Could not remove previous mapping: {e}");
                index += 1;
            }
            // A successful delete shifts later entries down; re-read the same index.
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    /// The gateway's public address, or [`ExternalAddress::ProviderInferred`] when the
    /// router cannot report one.
    pub async fn external_address(&self, gateway: &dyn Gateway) -> ExternalAddress {
        match gateway.external_ip_address().await {
            Ok(ip) => ExternalAddress::Known(ip),
            Err(e) => {
                info!("Gateway did not report its external address, DNS provider will infer it: {e}");
                ExternalAddress::ProviderInferred
            }
        }
    }

    /// Deletes the forward. Failures are logged; the mapping may already be gone.
    #[tracing::instrument(skip(self, gateway), fields(port = self.external_port))]
    pub async fn remove_mapping(&self, gateway: &dyn Gateway) {
        match gateway
            .delete_port_mapping(self.external_port, Protocol::Tcp)
            .await
        {
            Ok(()) => info!("Port mapping removed"),
            Err(e) => warn!("Failed to remove port mapping: {e}"),
        }
    }
}
