//! UPnP description document served at `/desc.html`.

use crate::device_manager::DeviceIdentity;
use crate::error::Result;
use crate::utils::xml_escape;

/// Device type announced in the description and by the beacon.
pub const DEVICE_TYPE: &str = "urn:schemas-upnp-org:device:BlePeripheral:1";

/// Render the description document for a device.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`](crate::Error::InvalidAddress) if no UDN
/// can be derived from the device address.
pub fn description_xml(identity: &DeviceIdentity) -> Result<String> {
    let udn = identity.udn()?;
    let name = xml_escape(&identity.name);

    Ok(format!(
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
<specVersion>
    <major>1</major>
    <minor>0</minor>
</specVersion>
<device>
    <deviceType>{DEVICE_TYPE}</deviceType>
    <friendlyName>{name}</friendlyName>
    <manufacturer>{name}</manufacturer>
    <modelDescription>{name}</modelDescription>
    <modelName>{name}</modelName>
    <UDN>{udn}</UDN>
</device>
</root>
"#
    ))
}
