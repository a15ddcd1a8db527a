//! SSDP M-SEARCH and device-description lookup.

use core::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use tokio::{net::UdpSocket, time::Instant};
use tracing::debug;
use url::Url;

use super::{GatewayError, xml::services};

pub(super) const WAN_IP_CONNECTION_V2: &str = "urn:schemas-upnp-org:service:WANIPConnection:2";
pub(super) const WAN_IP_CONNECTION_V1: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// Standard SSDP multicast group and port.
pub const SSDP_MULTICAST: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 1900);

fn search_request(service_type: &str, wait: Duration) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {service_type}\r\n\r\n",
        wait.as_secs().clamp(1, 5)
    )
}

fn location_header(response: &str) -> Option<Url> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("location") {
            return None;
        }
        Url::parse(value.trim()).ok()
    })
}

/// Sends a search for `service_type` to `target` (normally [`SSDP_MULTICAST`]) and
/// returns the first device description URL.
pub(super) async fn search(
    target: SocketAddr,
    service_type: &str,
    wait: Duration,
) -> Result<Url, GatewayError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket
        .send_to(search_request(service_type, wait).as_bytes(), target)
        .await?;

    let deadline = Instant::now() + wait;
    let mut buf = vec![0_u8; 2048];
    loop {
        let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await
        {
            Ok(res) => res?,
            Err(_elapsed) => return Err(GatewayError::NotFound),
        };
        let Some(data) = buf.get(..len) else {
            continue;
        };
        let response = String::from_utf8_lossy(data);
        if !response.contains(service_type) {
            debug!(%from, "Ignoring SSDP answer for another service");
            continue;
        }
        if let Some(location) = location_header(&response) {
            return Ok(location);
        }
    }
}

/// Fetches the device description and resolves the control URL of `service_type`.
pub(super) async fn control_url(
    client: &reqwest::Client,
    location: &Url,
    service_type: &str,
) -> Result<Url, GatewayError> {
    let description = client
        .get(location.clone())
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    find_control_url(&description, location, service_type)
}

fn find_control_url(
    description: &str,
    location: &Url,
    service_type: &str,
) -> Result<Url, GatewayError> {
    let Some(service) = services(description)?
        .into_iter()
        .find(|s| s.service_type == service_type)
    else {
        return Err(GatewayError::Malformed(format!(
            "device description does not list {service_type}"
        )));
    };
    if service.control_url.is_empty() {
        return Err(GatewayError::Malformed(format!(
            "{service_type} has no controlURL"
        )));
    }
    location.join(&service.control_url).map_err(|e| {
        GatewayError::Malformed(format!("bad controlURL {:?}: {e}", service.control_url))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceList><device><deviceList><device>
      <serviceList>
        <service>
          <serviceType>urn:schemas-upnp-org:service:WANCommonInterfaceConfig:1</serviceType>
          <controlURL>/upnp/control/WANCommonIFC1</controlURL>
        </service>
        <service>
          <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
          <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
          <controlURL>/upnp/control/WANIPConn1</controlURL>
        </service>
      </serviceList>
    </device></deviceList></device></deviceList>
  </device>
</root>"#;

    #[test]
    fn control_url_is_joined_with_location() {
        let location = Url::parse("http://192.168.1.1:49000/igddesc.xml").unwrap();
        let url = find_control_url(DESCRIPTION, &location, WAN_IP_CONNECTION_V1).unwrap();
        assert_eq!(
            url.as_str(),
            "http://192.168.1.1:49000/upnp/control/WANIPConn1",
            "relative control URL resolved against the description URL"
        );
    }

    #[test]
    fn absolute_control_url_in_cdata_is_kept() {
        let description = "<root><device><serviceList><service>\
            <serviceType>urn:schemas-upnp-org:service:WANIPConnection:2</serviceType>\
            <controlURL><![CDATA[http://192.168.1.1:5000/ctl/IPConn]]></controlURL>\
            </service></serviceList></device></root>";
        let location = Url::parse("http://192.168.1.1:49000/igddesc.xml").unwrap();
        let url = find_control_url(description, &location, WAN_IP_CONNECTION_V2).unwrap();
        assert_eq!(url.as_str(), "http://192.168.1.1:5000/ctl/IPConn", "absolute URL wins");
    }

    #[test]
    fn missing_service_is_malformed() {
        let location = Url::parse("http://192.168.1.1:49000/igddesc.xml").unwrap();
        let err = find_control_url(DESCRIPTION, &location, WAN_IP_CONNECTION_V2).unwrap_err();
        assert!(matches!(err, GatewayError::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn location_header_is_case_insensitive() {
        let response = "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=120\r\n\
                        Location: http://192.168.1.1:1900/rootDesc.xml\r\n\
                        ST: urn:schemas-upnp-org:service:WANIPConnection:1\r\n\r\n";
        let location = location_header(response);
        assert_eq!(
            location.map(String::from).as_deref(),
            Some("http://192.168.1.1:1900/rootDesc.xml"),
            "location parsed"
        );
    }

    #[test]
    fn search_request_names_the_service() {
        let req = search_request(WAN_IP_CONNECTION_V2, Duration::from_secs(30));
        assert!(req.starts_with("M-SEARCH * HTTP/1.1\r\n"), "request line");
        assert!(req.contains("MX: 5\r\n"), "MX is clamped");
        assert!(req.contains(&format!("ST: {WAN_IP_CONNECTION_V2}\r\n")), "search target");
    }
}
