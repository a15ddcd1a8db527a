//! SOAP client for the `WANIPConnection` control URL.
//!
//! Versions 1 and 2 of the service share the actions used here; only the service
//! type in the envelope and `SOAPAction` header differs.

use core::net::IpAddr;

use async_trait::async_trait;
use reqwest::{StatusCode, header};
use tracing::debug;
use url::Url;

use super::{
    Gateway, GatewayError, PortMapping, PortMappingEntry, Protocol,
    xml::{first_text, soap_envelope},
};

/// `SpecifiedArrayIndexInvalid`: the index is past the end of the mapping table.
const UPNP_ARRAY_INDEX_INVALID: u16 = 713;
/// `NoSuchEntryInArray`.
const UPNP_NO_SUCH_ENTRY: u16 = 714;

#[derive(Debug, Clone)]
pub struct IgdClient {
    client: reqwest::Client,
    control_url: Url,
    service_type: String,
}

impl IgdClient {
    pub fn new(client: reqwest::Client, control_url: Url, service_type: impl Into<String>) -> Self {
        Self {
            client,
            control_url,
            service_type: service_type.into(),
        }
    }

    #[tracing::instrument(skip(self, args), fields(control_url = %self.control_url))]
    async fn invoke(&self, action: &str, args: &[(&str, String)]) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(self.control_url.clone())
            .header(header::CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#{action}\"", self.service_type))
            .body(soap_envelope(&self.service_type, action, args)?)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            return Err(parse_fault(&text)?);
        }
        if !status.is_success() {
            return Err(GatewayError::Transport(format!("{action} returned HTTP {status}")));
        }
        debug!(action, "SOAP call succeeded");
        Ok(text)
    }
}

fn parse_fault(body: &str) -> Result<GatewayError, GatewayError> {
    let code = first_text(body, "errorCode")?
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| GatewayError::Malformed("SOAP fault without errorCode".to_owned()))?;
    let description = first_text(body, "errorDescription")?.unwrap_or_default();
    Ok(GatewayError::Upnp { code, description })
}

fn required(body: &str, tag: &str) -> Result<String, GatewayError> {
    first_text(body, tag)?.ok_or_else(|| GatewayError::Malformed(format!("missing <{tag}>")))
}

fn parse_entry(body: &str) -> Result<PortMappingEntry, GatewayError> {
    let port = |tag: &str| -> Result<u16, GatewayError> {
        let raw = required(body, tag)?;
        raw.parse()
            .map_err(|_| GatewayError::Malformed(format!("<{tag}> is not a port: {raw:?}")))
    };
    let protocol_raw = required(body, "NewProtocol")?;
    Ok(PortMappingEntry {
        external_port: port("NewExternalPort")?,
        protocol: Protocol::parse(&protocol_raw)
            .ok_or_else(|| GatewayError::Malformed(format!("unknown protocol {protocol_raw:?}")))?,
        internal_client: required(body, "NewInternalClient")?,
        internal_port: port("NewInternalPort")?,
        description: first_text(body, "NewPortMappingDescription")?.unwrap_or_default(),
        enabled: first_text(body, "NewEnabled")?.is_some_and(|v| v == "1" || v == "true"),
    })
}

#[async_trait]
impl Gateway for IgdClient {
    async fn generic_port_mapping_entry(
        &self,
        index: u32,
    ) -> Result<Option<PortMappingEntry>, GatewayError> {
        let args = [("NewPortMappingIndex", index.to_string())];
        match self.invoke("GetGenericPortMappingEntry", &args).await {
            Ok(body) => parse_entry(&body).map(Some),
            Err(GatewayError::Upnp {
                code: UPNP_ARRAY_INDEX_INVALID | UPNP_NO_SUCH_ENTRY,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<(), GatewayError> {
        let args = [
            ("NewRemoteHost", String::new()),
            ("NewExternalPort", mapping.external_port.to_string()),
            ("NewProtocol", mapping.protocol.as_str().to_owned()),
            ("NewInternalPort", mapping.internal_port.to_string()),
            ("NewInternalClient", mapping.internal_client.to_string()),
            ("NewEnabled", if mapping.enabled { "1" } else { "0" }.to_owned()),
            ("NewPortMappingDescription", mapping.description.clone()),
            ("NewLeaseDuration", mapping.lease_duration.to_string()),
        ];
        self.invoke("AddPortMapping", &args).await.map(drop)
    }

    async fn delete_port_mapping(
        &self,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<(), GatewayError> {
        let args = [
            ("NewRemoteHost", String::new()),
            ("NewExternalPort", external_port.to_string()),
            ("NewProtocol", protocol.as_str().to_owned()),
        ];
        self.invoke("DeletePortMapping", &args).await.map(drop)
    }

    async fn external_ip_address(&self) -> Result<IpAddr, GatewayError> {
        let body = self.invoke("GetExternalIPAddress", &[]).await?;
        let raw = required(&body, "NewExternalIPAddress")?;
        raw.parse()
            .map_err(|_| GatewayError::Malformed(format!("external address {raw:?}")))
    }
}
