use std::io::Read;

use url::Url;

use crate::{
    device::ServiceInfo,
    error::{Error, Result},
    xml::{XmlReader, XmlWriter},
};

const NS_SOAP_ENVELOPE: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SOAP_ENCODING: &str = "http://schemas.xmlsoap.org/soap/encoding/";
const NS_UPNP_CONTROL: &str = "urn:schemas-upnp-org:control-1-0";

/// A queued invocation of one action on one service.
#[derive(Debug, Clone)]
pub struct Action {
    service_type: String,
    control_url: Url,
    name: String,
    args: Vec<(String, String)>,
}

impl Action {
    pub fn new(service: &ServiceInfo, name: &str) -> Self {
        Self {
            service_type: service.service_type.clone(),
            control_url: service.control_url.clone(),
            name: name.to_owned(),
            args: Vec::new(),
        }
    }

    /// Appends an input argument. Order is preserved on the wire.
    pub fn arg(mut self, name: &str, value: &str) -> Self {
        self.args.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub(crate) fn control_url(&self) -> &Url {
        &self.control_url
    }

    /// The `SOAPACTION` header value, quotes included.
    pub(crate) fn soap_action(&self) -> String {
        format!("\"{}#{}\"", self.service_type, self.name)
    }

    /// Serializes the request envelope.
    pub(crate) fn envelope(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        XmlWriter::write_document(&mut body, |writer| {
            writer
                .element_ns((NS_SOAP_ENVELOPE, "Envelope"))
                .prefix("s", NS_SOAP_ENVELOPE)
                .attr((NS_SOAP_ENVELOPE, "encodingStyle"), SOAP_ENCODING)
                .contents(|writer| {
                    writer
                        .element_ns((NS_SOAP_ENVELOPE, "Body"))
                        .contents(|writer| {
                            writer
                                .element_ns((self.service_type.as_str(), self.name.as_str()))
                                .prefix("u", &self.service_type)
                                .contents(|writer| {
                                    for (name, value) in &self.args {
                                        writer.element(name).text(value)?;
                                    }
                                    Ok(())
                                })
                        })
                })
        })?;
        Ok(body)
    }
}

/// A SOAP fault, with the UPnP error code when the device supplied one.
#[derive(Debug, Clone)]
pub struct SoapFault {
    pub fault_code: String,
    pub fault_string: String,
    pub error_code: Option<u32>,
    pub error_description: Option<String>,
}

/// The outcome of one executed action.
///
/// A reply is truthy (`is_success`) when the HTTP status was 2xx and no
/// fault came back; transport failures leave status 0.
#[derive(Debug, Clone)]
pub struct ActionReply {
    status: u16,
    action: String,
    args: Vec<(String, String)>,
    fault: Option<SoapFault>,
}

impl ActionReply {
    pub(crate) fn with_status(action: &str, status: u16) -> Self {
        Self {
            status,
            action: action.to_owned(),
            args: Vec::new(),
            fault: None,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.fault.is_none()
    }

    /// Looks up a reply argument by name; `None` when the device did not
    /// send it.
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn args(&self) -> impl Iterator<Item = (&str, &str)> {
        self.args.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn fault(&self) -> Option<&SoapFault> {
        self.fault.as_ref()
    }
}

/// Stream-parses a SOAP reply envelope into reply arguments, or a fault.
pub(crate) fn parse_action_reply<R: Read>(
    status: u16,
    action: &str,
    source: R,
) -> Result<ActionReply> {
    let mut reader = XmlReader::new(source);
    let mut reply = ActionReply::with_status(action, status);

    let root = reader
        .next_element()?
        .ok_or_else(|| Error::Parse("empty SOAP reply".into()))?;
    if root.name.as_ref() != (Some(NS_SOAP_ENVELOPE), "Envelope") {
        return Err(Error::Parse(format!(
            "unexpected SOAP document element {}",
            root.name.local_name
        )));
    }

    while let Some(element) = reader.next_element()? {
        if element.name.as_ref() != (Some(NS_SOAP_ENVELOPE), "Body") {
            reader.skip()?;
            continue;
        }

        while let Some(inner) = reader.next_element()? {
            if inner.name.as_ref() == (Some(NS_SOAP_ENVELOPE), "Fault") {
                reply.fault = Some(parse_fault(&mut reader)?);
            } else if inner.name.local_name == format!("{action}Response") {
                while let Some(arg) = reader.next_element()? {
                    let name = arg.name.local_name;
                    let value = reader.text()?.unwrap_or_default();
                    reply.args.push((name, value));
                }
            } else {
                reader.skip()?;
            }
        }
    }

    Ok(reply)
}

fn parse_fault<R: Read>(reader: &mut XmlReader<R>) -> Result<SoapFault> {
    let mut fault = SoapFault {
        fault_code: String::new(),
        fault_string: String::new(),
        error_code: None,
        error_description: None,
    };

    while let Some(element) = reader.next_element()? {
        match element.name.local_name.as_str() {
            "faultcode" => fault.fault_code = reader.text()?.unwrap_or_default(),
            "faultstring" => fault.fault_string = reader.text()?.unwrap_or_default(),
            "detail" => {
                while let Some(detail) = reader.next_element()? {
                    if detail.name.as_ref() == (Some(NS_UPNP_CONTROL), "UPnPError") {
                        while let Some(field) = reader.next_element()? {
                            match field.name.local_name.as_str() {
                                "errorCode" => {
                                    fault.error_code =
                                        reader.text()?.and_then(|t| t.trim().parse().ok());
                                }
                                "errorDescription" => {
                                    fault.error_description = reader.text()?;
                                }
                                _ => reader.skip()?,
                            }
                        }
                    } else {
                        reader.skip()?;
                    }
                }
            }
            _ => reader.skip()?,
        }
    }

    Ok(fault)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::ServiceInfo;

    fn service() -> ServiceInfo {
        ServiceInfo {
            service_type: "urn:schemas-upnp-org:service:AVTransport:1".to_owned(),
            service_id: "urn:upnp-org:serviceId:AVTransport".to_owned(),
            control_url: Url::parse("http://10.0.0.9:1980/AVTransport/Control").unwrap(),
            event_sub_url: None,
            scpd_url: None,
        }
    }

    #[test]
    fn envelope_structure() {
        let action = Action::new(&service(), "SetAVTransportURI")
            .arg("InstanceID", "0")
            .arg("CurrentURI", "http://10.0.0.2/video.mp4")
            .arg("CurrentURIMetaData", "");

        assert_eq!(
            action.soap_action(),
            "\"urn:schemas-upnp-org:service:AVTransport:1#SetAVTransportURI\""
        );

        let envelope = String::from_utf8(action.envelope().unwrap()).unwrap();
        assert!(envelope.contains(
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">"#
        ));
        assert!(envelope.contains("<s:Body>"));
        assert!(envelope.contains(
            r#"<u:SetAVTransportURI xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">"#
        ));
        assert!(envelope.contains("<InstanceID>0</InstanceID>"));
        assert!(envelope.contains("<CurrentURI>http://10.0.0.2/video.mp4</CurrentURI>"));
        assert!(envelope.contains("<CurrentURIMetaData"));
    }

    #[test]
    fn parse_reply_arguments() {
        let reply_xml = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetTransportInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
      <CurrentTransportState>PLAYING</CurrentTransportState>
      <CurrentTransportStatus>OK</CurrentTransportStatus>
      <CurrentSpeed>1</CurrentSpeed>
    </u:GetTransportInfoResponse>
  </s:Body>
</s:Envelope>"#;

        let reply = parse_action_reply(200, "GetTransportInfo", reply_xml.as_bytes()).unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.arg("CurrentTransportState"), Some("PLAYING"));
        assert_eq!(reply.arg("CurrentSpeed"), Some("1"));
        assert_eq!(reply.arg("NoSuchArgument"), None);
        assert_eq!(reply.args().count(), 3);
    }

    #[test]
    fn parse_empty_response_is_truthy() {
        let reply_xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:SetAVTransportURIResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/>
  </s:Body>
</s:Envelope>"#;

        let reply = parse_action_reply(200, "SetAVTransportURI", reply_xml.as_bytes()).unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.arg("Anything"), None);
    }

    #[test]
    fn parse_fault_reply() {
        let reply_xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>402</errorCode>
          <errorDescription>Invalid Args</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;

        let reply = parse_action_reply(500, "Play", reply_xml.as_bytes()).unwrap();
        assert!(!reply.is_success());
        let fault = reply.fault().unwrap();
        assert_eq!(fault.fault_code, "s:Client");
        assert_eq!(fault.error_code, Some(402));
        assert_eq!(fault.error_description.as_deref(), Some("Invalid Args"));
    }
}
