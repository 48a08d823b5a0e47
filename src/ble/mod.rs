//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy side of the bridge: the
//! scanner that finds blinds, the link abstraction the device manager drives,
//! and connection state tracking.

pub mod connection;
#[cfg(test)]
pub(crate) mod fake;
pub mod link;
pub mod scanner;
pub mod uuids;

pub use connection::{ConnectionEvent, ConnectionState, ConnectionTracker, Transition};
pub use link::{BtleplugLink, LinkEvent, LinkLayer};
pub use scanner::{BleScanner, ScanEvent};
pub use uuids::*;
