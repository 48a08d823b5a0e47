//! BLE Service and Characteristic UUIDs.
//!
//! Well-known SIG assigned numbers, used to give discovered services and
//! characteristics a human-readable name in the status resource.

use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit SIG assigned number onto the Bluetooth base UUID.
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// The 16-bit assigned number of `uuid`, if it sits on the Bluetooth base UUID.
pub fn to_short(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !(0xffff_u128 << 96) == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

// Services
/// Generic Access service UUID.
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid = from_short(0x1800);
/// Generic Attribute service UUID.
pub const GENERIC_ATTRIBUTE_SERVICE_UUID: Uuid = from_short(0x1801);
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = from_short(0x180a);
/// Battery service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = from_short(0x180f);

// Characteristics
/// Device Name characteristic UUID.
pub const DEVICE_NAME_UUID: Uuid = from_short(0x2a00);
/// Appearance characteristic UUID.
pub const APPEARANCE_UUID: Uuid = from_short(0x2a01);
/// Service Changed characteristic UUID.
pub const SERVICE_CHANGED_UUID: Uuid = from_short(0x2a05);
/// Battery Level characteristic UUID.
pub const BATTERY_LEVEL_UUID: Uuid = from_short(0x2a19);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = from_short(0x2a29);
/// Model Number characteristic UUID.
pub const MODEL_NUMBER_UUID: Uuid = from_short(0x2a24);
/// Serial Number characteristic UUID.
pub const SERIAL_NUMBER_UUID: Uuid = from_short(0x2a25);
/// Firmware Revision characteristic UUID.
pub const FIRMWARE_REVISION_UUID: Uuid = from_short(0x2a26);
/// Hardware Revision characteristic UUID.
pub const HARDWARE_REVISION_UUID: Uuid = from_short(0x2a27);

/// Human-readable name of a well-known service.
pub fn service_name(uuid: &Uuid) -> Option<&'static str> {
    match to_short(uuid)? {
        0x1800 => Some("Generic Access"),
        0x1801 => Some("Generic Attribute"),
        0x180a => Some("Device Information"),
        0x180f => Some("Battery Service"),
        _ => None,
    }
}

/// Human-readable name of a well-known characteristic.
pub fn characteristic_name(uuid: &Uuid) -> Option<&'static str> {
    match to_short(uuid)? {
        0x2a00 => Some("Device Name"),
        0x2a01 => Some("Appearance"),
        0x2a04 => Some("Peripheral Preferred Connection Parameters"),
        0x2a05 => Some("Service Changed"),
        0x2a19 => Some("Battery Level"),
        0x2a24 => Some("Model Number String"),
        0x2a25 => Some("Serial Number String"),
        0x2a26 => Some("Firmware Revision String"),
        0x2a27 => Some("Hardware Revision String"),
        0x2a28 => Some("Software Revision String"),
        0x2a29 => Some("Manufacturer Name String"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            DEVICE_INFO_SERVICE_UUID.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BATTERY_LEVEL_UUID.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_short_roundtrip_and_vendor_uuids() {
        assert_eq!(to_short(&BATTERY_SERVICE_UUID), Some(0x180f));
        let vendor = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        assert_eq!(to_short(&vendor), None);
        assert_eq!(service_name(&vendor), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(service_name(&GENERIC_ACCESS_SERVICE_UUID), Some("Generic Access"));
        assert_eq!(characteristic_name(&DEVICE_NAME_UUID), Some("Device Name"));
        assert_eq!(characteristic_name(&from_short(0x2aff)), None);
    }
}
