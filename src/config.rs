//! Runtime configuration.
//!
//! Timing parameters for the per-device link and the settings of the bridge
//! as a whole. The binary fills these from command line flags; library users
//! construct them directly.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::capabilities::CharacteristicRef;
use crate::error::{Error, Result};
use crate::utils::DEFAULT_BASE_PORT;

/// Local name advertised by the blinds this bridge serves.
pub const DEFAULT_DEVICE_NAME: &str = "SmartBlind";

/// Characteristic position the first firmware used for the motor command.
pub const LEGACY_WRITE_INDEX: usize = 4;

/// Reconnect behaviour after the link drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
    /// Attempts per outage, `None` retries until connected.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Policy that never reconnects automatically.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Whether automatic reconnects happen at all.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts != Some(0)
    }

    /// Delay before the given attempt (1-based), doubling up to the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Timing configuration for one device manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Bound on service and characteristic enumeration.
    pub discovery_timeout: Duration,
    /// Bound on a single characteristic read or write.
    pub io_timeout: Duration,
    /// How long status and description requests wait for pending discovery.
    pub status_wait: Duration,
    /// What to do when the link drops.
    pub reconnect: ReconnectPolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(15),
            io_timeout: Duration::from_secs(5),
            status_wait: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl DeviceConfig {
    /// Check that every bound is usable.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("discovery_timeout", self.discovery_timeout),
            ("io_timeout", self.io_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::invalid_parameter(name, format!("{:?}", value)));
            }
        }

        if self.reconnect.is_enabled() && self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(Error::invalid_parameter(
                "reconnect_max",
                format!("{:?}", self.reconnect.max_delay),
            ));
        }

        Ok(())
    }
}

/// Characteristic that `/char-write-req` writes to when the request names none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTarget(pub CharacteristicRef);

impl Default for WriteTarget {
    fn default() -> Self {
        Self(CharacteristicRef::Index(LEGACY_WRITE_INDEX))
    }
}

impl FromStr for WriteTarget {
    type Err = Error;

    /// Accepts a characteristic UUID or a decimal position.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(index) = s.parse::<usize>() {
            return Ok(Self(CharacteristicRef::Index(index)));
        }
        Uuid::parse_str(s)
            .map(|uuid| Self(CharacteristicRef::Uuid(uuid)))
            .map_err(|_| Error::invalid_parameter("write_char", s))
    }
}

/// Configuration for the whole bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Advertised local name that selects peripherals.
    pub device_name: String,
    /// Base for the per-device port.
    pub base_port: u16,
    /// Address the HTTP servers listen on.
    pub bind_host: IpAddr,
    /// Host placed in the beacon location, detected when unset.
    pub advertise_host: Option<IpAddr>,
    /// Whether to run the SSDP beacon.
    pub beacon_enabled: bool,
    /// Default characteristic for writes.
    pub write_target: WriteTarget,
    /// Per-device timing.
    pub device: DeviceConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            base_port: DEFAULT_BASE_PORT,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_host: None,
            beacon_enabled: true,
            write_target: WriteTarget::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Check the configuration before anything is started.
    pub fn validate(&self) -> Result<()> {
        if self.device_name.is_empty() {
            return Err(Error::invalid_parameter("device_name", "<empty>"));
        }
        self.device.validate()
    }
}
