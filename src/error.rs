//! Error types for the blind-bridge crate.

use std::sync::Arc;
use thiserror::Error;

/// The main error type for this crate.
///
/// `Error` is `Clone` so a single discovery outcome can be handed to every
/// caller waiting on it. Foreign errors are kept behind an [`Arc`].
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(Arc<btleplug::Error>),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// Establishing the link to the peripheral failed or timed out.
    #[error("Link error: {reason}")]
    Link {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Enumerating services and characteristics failed or timed out.
    #[error("Discovery error: {reason}")]
    Discovery {
        /// Description of why discovery failed.
        reason: String,
    },

    /// The connection session ended while discovery was still running.
    #[error("Session ended before discovery completed")]
    SessionEnded,

    /// Operation requires resolved capabilities but discovery has not completed.
    #[error("Device not connected")]
    NotConnected,

    /// Reading a characteristic failed.
    #[error("Read of {uuid} failed: {reason}")]
    Read {
        /// The characteristic that was read.
        uuid: String,
        /// The underlying link error.
        reason: String,
    },

    /// Writing a characteristic failed.
    #[error("Write to {uuid} failed: {reason}")]
    Write {
        /// The characteristic that was written.
        uuid: String,
        /// The underlying link error.
        reason: String,
    },

    /// Characteristic not found in the discovered capability set.
    #[error("Characteristic not found: {identifier}")]
    CharacteristicNotFound {
        /// The UUID or index that was looked up.
        identifier: String,
    },

    /// A hardware address could not be interpreted.
    #[error("Invalid hardware address: {address}")]
    InvalidAddress {
        /// The address as it was received.
        address: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// Socket level failure in the HTTP server or the beacon.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable tag for this error, used in HTTP payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bluetooth(_) | Self::BluetoothUnavailable => "bluetooth",
            Self::Link { .. } => "link",
            Self::Discovery { .. } => "discovery",
            Self::SessionEnded => "session_ended",
            Self::NotConnected => "not_connected",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::CharacteristicNotFound { .. } => "characteristic_not_found",
            Self::InvalidAddress { .. } => "invalid_address",
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }

    pub(crate) fn invalid_parameter(name: &str, value: impl ToString) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        Self::Bluetooth(Arc::new(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
