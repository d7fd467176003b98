use std::io::Read;

use tracing::warn;
use url::Url;

use crate::{
    error::{Error, Result},
    xml::XmlReader,
};

/// One service exposed by a device. URLs are already resolved against the
/// device's location.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub service_type: String,
    pub service_id: String,
    pub control_url: Url,
    pub event_sub_url: Option<Url>,
    pub scpd_url: Option<Url>,
}

/// A discovered device, keyed by the location URL its description was
/// fetched from. Services of embedded sub-devices are flattened into
/// `services`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub location: Url,
    pub udn: String,
    pub friendly_name: String,
    pub device_type: String,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
    pub services: Vec<ServiceInfo>,
}

impl DeviceInfo {
    /// The first service whose type matches `service_type` exactly.
    pub fn service(&self, service_type: &str) -> Option<&ServiceInfo> {
        self.services
            .iter()
            .find(|s| s.service_type == service_type)
    }

    /// The first service whose type contains `fragment`, so callers can ask
    /// for `"AVTransport"` without spelling out the full urn.
    pub fn service_like(&self, fragment: &str) -> Option<&ServiceInfo> {
        self.services
            .iter()
            .find(|s| s.service_type.contains(fragment))
    }
}

/// Parses a UPnP device description document.
pub(crate) fn parse_description<R: Read>(location: &Url, source: R) -> Result<DeviceInfo> {
    let mut reader = XmlReader::new(source);

    let root = reader
        .next_element()?
        .ok_or_else(|| Error::Description("empty document".into()))?;
    if root.name.local_name != "root" {
        return Err(Error::Description(format!(
            "unexpected document element {}",
            root.name.local_name
        )));
    }

    let mut device = None;
    while let Some(element) = reader.next_element()? {
        if element.name.local_name == "device" {
            device = Some(parse_device(location, &mut reader)?);
        } else {
            reader.skip()?;
        }
    }

    let mut device = device.ok_or_else(|| Error::Description("missing device element".into()))?;
    device.location = location.clone();
    if device.udn.is_empty() {
        return Err(Error::Description("device has no UDN".into()));
    }
    Ok(device)
}

fn parse_device<R: Read>(location: &Url, reader: &mut XmlReader<R>) -> Result<DeviceInfo> {
    let mut device = DeviceInfo {
        location: location.clone(),
        udn: String::new(),
        friendly_name: String::new(),
        device_type: String::new(),
        manufacturer: None,
        model_name: None,
        services: Vec::new(),
    };

    while let Some(element) = reader.next_element()? {
        match element.name.local_name.as_str() {
            "UDN" => device.udn = reader.text()?.unwrap_or_default(),
            "friendlyName" => device.friendly_name = reader.text()?.unwrap_or_default(),
            "deviceType" => device.device_type = reader.text()?.unwrap_or_default(),
            "manufacturer" => device.manufacturer = reader.text()?,
            "modelName" => device.model_name = reader.text()?,
            "serviceList" => parse_service_list(location, reader, &mut device.services)?,
            "deviceList" => {
                // Embedded devices contribute their services to the root
                // device's index; their own identity is not tracked.
                while let Some(inner) = reader.next_element()? {
                    if inner.name.local_name == "device" {
                        let embedded = parse_device(location, reader)?;
                        device.services.extend(embedded.services);
                    } else {
                        reader.skip()?;
                    }
                }
            }
            _ => reader.skip()?,
        }
    }

    Ok(device)
}

fn parse_service_list<R: Read>(
    location: &Url,
    reader: &mut XmlReader<R>,
    services: &mut Vec<ServiceInfo>,
) -> Result<()> {
    while let Some(element) = reader.next_element()? {
        if element.name.local_name != "service" {
            reader.skip()?;
            continue;
        }

        let mut service_type = String::new();
        let mut service_id = String::new();
        let mut control_url = None;
        let mut event_sub_url = None;
        let mut scpd_url = None;

        while let Some(field) = reader.next_element()? {
            match field.name.local_name.as_str() {
                "serviceType" => service_type = reader.text()?.unwrap_or_default(),
                "serviceId" => service_id = reader.text()?.unwrap_or_default(),
                "controlURL" => control_url = resolve(location, reader.text()?),
                "eventSubURL" => event_sub_url = resolve(location, reader.text()?),
                "SCPDURL" => scpd_url = resolve(location, reader.text()?),
                _ => reader.skip()?,
            }
        }

        match control_url {
            Some(control_url) => services.push(ServiceInfo {
                service_type,
                service_id,
                control_url,
                event_sub_url,
                scpd_url,
            }),
            None => {
                warn!(service_type, "service without control URL skipped");
            }
        }
    }

    Ok(())
}

fn resolve(base: &Url, relative: Option<String>) -> Option<Url> {
    let relative = relative?;
    let relative = relative.trim();
    if relative.is_empty() {
        return None;
    }
    base.join(relative).ok()
}
