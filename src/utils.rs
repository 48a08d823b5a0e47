//! Utility functions for the blind-bridge crate.
//!
//! Hardware address handling lives here because both the HTTP port and the
//! beacon identifier are derived from it.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Port that device ports are offset from.
pub const DEFAULT_BASE_PORT: u16 = 5000;

/// Number of trailing hex characters of the address used for the port offset.
pub const PORT_SUFFIX_LEN: usize = 3;

/// Strip separators from a hardware address and upper-case it.
///
/// Accepts `:`, `-` and `.` separators. The result is stable for a given
/// physical device regardless of how the radio stack formats the address.
///
/// # Example
///
/// ```
/// use blind_bridge::utils::normalize_address;
///
/// assert_eq!(normalize_address("aa:bb:cc:dd:ee:ff").unwrap(), "AABBCCDDEEFF");
/// ```
pub fn normalize_address(address: &str) -> Result<String> {
    let normalized: String = address
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.') && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if normalized.len() < PORT_SUFFIX_LEN || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidAddress {
            address: address.to_string(),
        });
    }

    Ok(normalized)
}

/// Derive the HTTP port for a device from its hardware address.
///
/// The last three hex characters of the normalized address are parsed as a
/// base-16 integer and added to `base_port`. Two devices sharing the same
/// trailing characters collide; no fallback is attempted.
///
/// # Example
///
/// ```
/// use blind_bridge::utils::derive_port;
///
/// assert_eq!(derive_port("AA:BB:CC:DD:EE:FF", 5000).unwrap(), 8839);
/// assert_eq!(derive_port("00:00:00:00:00:01", 5000).unwrap(), 5001);
/// ```
pub fn derive_port(address: &str, base_port: u16) -> Result<u16> {
    let normalized = normalize_address(address)?;
    let suffix = &normalized[normalized.len() - PORT_SUFFIX_LEN..];

    let offset = u16::from_str_radix(suffix, 16).map_err(|_| Error::InvalidAddress {
        address: address.to_string(),
    })?;

    base_port
        .checked_add(offset)
        .ok_or_else(|| Error::invalid_parameter("base_port", base_port))
}

/// Unique device name advertised by the beacon, `uuid:` plus the normalized address.
pub fn beacon_udn(address: &str) -> Result<String> {
    Ok(format!("uuid:{}", normalize_address(address)?))
}

/// Escape text for inclusion in an XML element.
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Best-effort detection of the address other hosts on the LAN can reach us on.
///
/// Connecting a UDP socket sends nothing; it only asks the OS which local
/// address it would route from. Falls back to loopback when there is no route.
pub fn detect_local_ip() -> IpAddr {
    for probe in ["239.255.255.250:1900", "8.8.8.8:80"] {
        let local = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|socket| socket.connect(probe).map(|_| socket))
            .and_then(|socket| socket.local_addr());

        match local {
            Ok(addr) if !addr.ip().is_unspecified() && !addr.ip().is_loopback() => {
                debug!("Detected local address {} via {}", addr.ip(), probe);
                return addr.ip();
            }
            Ok(_) => {}
            Err(e) => debug!("Route probe via {} failed: {}", probe, e),
        }
    }

    warn!("Could not detect a LAN address, advertising loopback");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("AA:BB:CC:DD:EE:FF").unwrap(), "AABBCCDDEEFF");
        assert_eq!(normalize_address("aa-bb-cc-dd-ee-ff").unwrap(), "AABBCCDDEEFF");
        assert_eq!(normalize_address("aabb.ccdd.eeff").unwrap(), "AABBCCDDEEFF");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(matches!(
            normalize_address("zz:yy"),
            Err(Error::InvalidAddress { .. })
        ));
        assert!(normalize_address("").is_err());
        assert!(normalize_address("a:b").is_err());
    }

    #[test]
    fn test_derive_port_examples() {
        assert_eq!(derive_port("AA:BB:CC:DD:EE:FF", 5000).unwrap(), 8839);
        assert_eq!(derive_port("00:00:00:00:00:01", 5000).unwrap(), 5001);
        assert_eq!(derive_port("aa:bb:cc:dd:ee:ff", 5000).unwrap(), 8839);
    }

    #[test]
    fn test_derive_port_overflow() {
        assert!(matches!(
            derive_port("FF:FF:FF:FF:FF:FF", 65000),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_beacon_udn() {
        assert_eq!(
            beacon_udn("c4:7c:8d:6a:1b:02").unwrap(),
            "uuid:C47C8D6A1B02"
        );
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("Blind <A&B>"), "Blind &lt;A&amp;B&gt;");
        assert_eq!(xml_escape("plain"), "plain");
    }

    proptest! {
        #[test]
        fn prop_port_in_range(bytes in proptest::array::uniform6(any::<u8>())) {
            let address = bytes
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(":");
            let port = derive_port(&address, DEFAULT_BASE_PORT).unwrap();
            prop_assert!(port >= DEFAULT_BASE_PORT);
            prop_assert!(port < DEFAULT_BASE_PORT + 0x1000);
        }

        #[test]
        fn prop_port_ignores_separators_and_case(bytes in proptest::array::uniform6(any::<u8>())) {
            let upper = bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(":");
            let lower = bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join("-");
            prop_assert_eq!(
                derive_port(&upper, DEFAULT_BASE_PORT).unwrap(),
                derive_port(&lower, DEFAULT_BASE_PORT).unwrap()
            );
            prop_assert_eq!(beacon_udn(&upper).unwrap(), beacon_udn(&lower).unwrap());
        }
    }
}
