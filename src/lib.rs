//! # blind-bridge
//!
//! Bridges Bluetooth Low Energy "SmartBlind" peripherals to the local network.
//!
//! Every blind found by the scanner gets its own [`DeviceManager`], which owns
//! the radio link, runs GATT discovery at most once per connection session and
//! serializes reads and writes. Each device is then served over HTTP on a port
//! derived from its hardware address, and announced over SSDP so clients can
//! find it without configuration.
//!
//! ## Features
//!
//! - **Shared discovery**: concurrent callers share one discovery computation
//!   and observe the identical outcome
//! - **Reconnect with backoff**: dropped links are re-established, and the next
//!   session is discovered again
//! - **HTTP adapter**: status, read, write and UPnP description resources
//! - **SSDP beacon**: `ssdp:alive` / `ssdp:byebye` and `M-SEARCH` answers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blind_bridge::{Bridge, BridgeConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let bridge = Bridge::new(BridgeConfig::default()).await?;
//!     bridge.start().await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!
//!     for (address, port) in bridge.ports() {
//!         println!("{} on port {}", address, port);
//!     }
//!
//!     bridge.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! The hardware address is hidden; the stack's peripheral identifier is used
//! in its place for port derivation and the beacon identifier.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group. Binding the
//! SSDP port may conflict with a local UPnP daemon; the beacon then only
//! announces.

// Public modules
pub mod beacon;
pub mod ble;
pub mod bridge;
pub mod capabilities;
pub mod config;
pub mod device_manager;
pub mod error;
pub mod http;
pub mod utils;

// Re-exports for convenience
pub use bridge::Bridge;
pub use capabilities::{
    CapabilitySet, CapabilityStatus, CharacteristicInfo, CharacteristicRef, ServiceInfo,
};
pub use config::{BridgeConfig, DeviceConfig, ReconnectPolicy, WriteTarget, DEFAULT_DEVICE_NAME};
pub use device_manager::{AddressType, DeviceIdentity, DeviceManager};
pub use error::{Error, Result};
pub use utils::derive_port;

pub use ble::connection::ConnectionState;
pub use ble::link::{LinkEvent, LinkLayer};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        let _ = std::any::TypeId::of::<DeviceManager>();
        let _ = std::any::TypeId::of::<Bridge>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<CapabilitySet>();
        let _ = std::any::TypeId::of::<BridgeConfig>();
    }

    #[test]
    fn test_port_derivation_reexport() {
        assert_eq!(derive_port("AA:BB:CC:DD:EE:FF", 5000).unwrap(), 8839);
    }
}
