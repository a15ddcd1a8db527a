//! XML reading and writing for device descriptions and SOAP bodies.

use core::fmt::Display;

use quick_xml::{
    Reader, Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};

use super::GatewayError;

const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SOAP_ENCODING: &str = "http://schemas.xmlsoap.org/soap/encoding/";

fn malformed(e: impl Display) -> GatewayError {
    GatewayError::Malformed(e.to_string())
}

/// A `<service>` entry of a device description.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(super) struct ServiceEntry {
    pub service_type: String,
    pub control_url: String,
}

/// Text of the first element whose local name is `tag`, whatever its namespace
/// prefix. Entities and CDATA sections are resolved; surrounding whitespace is trimmed.
pub(super) fn first_text(xml: &str, tag: &str) -> Result<Option<String>, GatewayError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut captured: Option<String> = None;
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) if captured.is_none() && e.local_name().as_ref() == tag.as_bytes() => {
                captured = Some(String::new());
            }
            Event::Empty(e) if captured.is_none() && e.local_name().as_ref() == tag.as_bytes() => {
                return Ok(Some(String::new()));
            }
            Event::Text(t) => {
                if let Some(buf) = captured.as_mut() {
                    buf.push_str(&t.unescape().map_err(malformed)?);
                }
            }
            Event::CData(c) => {
                if let Some(buf) = captured.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(e) if captured.is_some() && e.local_name().as_ref() == tag.as_bytes() => {
                return Ok(captured.map(|s| s.trim().to_owned()));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Every `<service>` of a device description, nested devices included.
pub(super) fn services(xml: &str) -> Result<Vec<ServiceEntry>, GatewayError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut found = Vec::new();
    let mut current: Option<ServiceEntry> = None;
    let mut field: Option<Vec<u8>> = None;
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) => {
                let name = e.local_name();
                if name.as_ref() == b"service" {
                    current = Some(ServiceEntry::default());
                } else if current.is_some() {
                    field = Some(name.as_ref().to_vec());
                }
            }
            Event::Text(t) => {
                append(current.as_mut(), field.as_deref(), &t.unescape().map_err(malformed)?);
            }
            Event::CData(c) => {
                append(current.as_mut(), field.as_deref(), &String::from_utf8_lossy(&c));
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"service"
                    && let Some(service) = current.take()
                {
                    found.push(service);
                }
                field = None;
            }
            Event::Eof => return Ok(found),
            _ => {}
        }
    }
}

fn append(service: Option<&mut ServiceEntry>, field: Option<&[u8]>, text: &str) {
    let Some(service) = service else {
        return;
    };
    match field {
        Some(b"serviceType") => service.service_type.push_str(text.trim()),
        Some(b"controlURL") => service.control_url.push_str(text.trim()),
        _ => {}
    }
}

/// Builds a SOAP request envelope for `action` of `service_type`.
pub(super) fn soap_envelope(
    service_type: &str,
    action: &str,
    args: &[(&str, String)],
) -> Result<String, GatewayError> {
    let action_tag = format!("u:{action}");
    let mut writer = Writer::new(Vec::new());

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", None, None)))
        .map_err(malformed)?;
    writer
        .write_event(Event::Start(BytesStart::new("s:Envelope").with_attributes([
            ("xmlns:s", SOAP_ENVELOPE_NS),
            ("s:encodingStyle", SOAP_ENCODING),
        ])))
        .map_err(malformed)?;
    writer
        .write_event(Event::Start(BytesStart::new("s:Body")))
        .map_err(malformed)?;
    writer
        .write_event(Event::Start(
            BytesStart::new(action_tag.as_str()).with_attributes([("xmlns:u", service_type)]),
        ))
        .map_err(malformed)?;
    for &(name, ref value) in args {
        writer
            .write_event(Event::Start(BytesStart::new(name)))
            .map_err(malformed)?;
        writer
            .write_event(Event::Text(BytesText::new(value)))
            .map_err(malformed)?;
        writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(malformed)?;
    }
    for tag in [action_tag.as_str(), "s:Body", "s:Envelope"] {
        writer
            .write_event(Event::End(BytesEnd::new(tag)))
            .map_err(malformed)?;
    }

    String::from_utf8(writer.into_inner()).map_err(malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_found_under_any_prefix() {
        let body = r#"<s:Envelope xmlns:s="x"><s:Body>
            <m:GetExternalIPAddressResponse xmlns:m="y">
              <m:NewExternalIPAddress dt="string"> 203.0.113.9 </m:NewExternalIPAddress>
            </m:GetExternalIPAddressResponse></s:Body></s:Envelope>"#;
        assert_eq!(
            first_text(body, "NewExternalIPAddress").unwrap().as_deref(),
            Some("203.0.113.9"),
            "prefixed element with attributes"
        );
        assert_eq!(first_text(body, "Missing").unwrap(), None, "absent element");
    }

    #[test]
    fn entities_and_cdata_are_resolved() {
        let body = "<r><a>Diary &#38; Co &lt;3</a><b><![CDATA[/ctl?x=1&y=2]]></b><c/></r>";
        assert_eq!(first_text(body, "a").unwrap().as_deref(), Some("Diary & Co <3"), "entities");
        assert_eq!(first_text(body, "b").unwrap().as_deref(), Some("/ctl?x=1&y=2"), "cdata");
        assert_eq!(first_text(body, "c").unwrap().as_deref(), Some(""), "empty element");
    }

    #[test]
    fn services_are_collected_from_nested_devices() {
        let description = r#"<root xmlns="urn:schemas-upnp-org:device-1-0"><device>
            <serviceList><service>
              <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
              <controlURL>/l3f</controlURL>
            </service></serviceList>
            <deviceList><device><serviceList><service>
              <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
              <controlURL><![CDATA[/upnp/control/WANIPConn1]]></controlURL>
            </service></serviceList></device></deviceList>
          </device></root>"#;
        let found = services(description).unwrap();
        assert_eq!(found.len(), 2, "both services: {found:?}");
        assert_eq!(
            found.get(1),
            Some(&ServiceEntry {
                service_type: "urn:schemas-upnp-org:service:WANIPConnection:1".to_owned(),
                control_url: "/upnp/control/WANIPConn1".to_owned(),
            }),
            "nested service with CDATA control URL"
        );
    }

    #[test]
    fn envelope_escapes_argument_values() {
        let envelope = soap_envelope(
            "urn:schemas-upnp-org:service:WANIPConnection:1",
            "AddPortMapping",
            &[("NewPortMappingDescription", "Diary & <Co>".to_owned())],
        )
        .unwrap();
        assert!(
            envelope.contains(
                "<NewPortMappingDescription>Diary &amp; &lt;Co&gt;</NewPortMappingDescription>"
            ),
            "escaped value: {envelope}"
        );
        assert_eq!(
            first_text(&envelope, "NewPortMappingDescription").unwrap().as_deref(),
            Some("Diary & <Co>"),
            "reads back"
        );
    }

    #[test]
    fn broken_markup_is_malformed() {
        let err = first_text("<a><b></a>", "zzz").unwrap_err();
        assert!(matches!(err, GatewayError::Malformed(_)), "got {err:?}");
    }
}
