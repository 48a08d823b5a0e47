//! The radio link to one peripheral.
//!
//! [`LinkLayer`] is the seam between the device manager and the Bluetooth
//! stack. [`BtleplugLink`] implements it on top of btleplug; tests drive the
//! device manager with a scripted fake instead.

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use tracing::{debug, trace};

use crate::capabilities::{
    CapabilitySet, CharacteristicInfo, CharacteristicProperty, ServiceInfo, ServiceKind,
};
use crate::error::{Error, Result};

/// Notifications from the stack about one peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link came up.
    Connected,
    /// The link went down.
    Disconnected,
    /// New signal strength reading in dBm.
    SignalUpdate(i16),
}

/// Primitive operations on the link to one peripheral.
#[async_trait]
pub trait LinkLayer: Send + Sync {
    /// Establish the link.
    async fn connect(&self) -> Result<()>;

    /// Tear the link down.
    async fn disconnect(&self) -> Result<()>;

    /// Enumerate all services and characteristics.
    async fn discover(&self) -> Result<CapabilitySet>;

    /// Read a characteristic value.
    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>>;

    /// Write a characteristic value.
    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        with_response: bool,
    ) -> Result<()>;
}

/// [`LinkLayer`] backed by a btleplug peripheral.
#[derive(Debug, Clone)]
pub struct BtleplugLink {
    /// The peripheral to communicate with.
    peripheral: Peripheral,
}

impl BtleplugLink {
    /// Wrap a peripheral handle obtained from the scanner.
    pub fn new(peripheral: Peripheral) -> Self {
        Self { peripheral }
    }

    /// Get the peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// Find the stack's handle for a discovered characteristic.
    fn characteristic(&self, info: &CharacteristicInfo) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == info.uuid && c.service_uuid == info.service_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                identifier: info.uuid.to_string(),
            })
    }
}

/// Translate btleplug property bits into property flags.
pub fn properties_from_flags(flags: CharPropFlags) -> Vec<CharacteristicProperty> {
    [
        (CharPropFlags::BROADCAST, CharacteristicProperty::Broadcast),
        (CharPropFlags::READ, CharacteristicProperty::Read),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CharacteristicProperty::WriteWithoutResponse,
        ),
        (CharPropFlags::WRITE, CharacteristicProperty::Write),
        (CharPropFlags::NOTIFY, CharacteristicProperty::Notify),
        (CharPropFlags::INDICATE, CharacteristicProperty::Indicate),
        (
            CharPropFlags::AUTHENTICATED_SIGNED_WRITES,
            CharacteristicProperty::AuthenticatedSignedWrites,
        ),
        (
            CharPropFlags::EXTENDED_PROPERTIES,
            CharacteristicProperty::ExtendedProperties,
        ),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, property)| property)
    .collect()
}

#[async_trait]
impl LinkLayer for BtleplugLink {
    async fn connect(&self) -> Result<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            debug!("Peripheral already connected at BLE level");
            return Ok(());
        }
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover(&self) -> Result<CapabilitySet> {
        self.peripheral.discover_services().await?;

        let mut services = Vec::new();
        let mut characteristics = Vec::new();

        for service in self.peripheral.services() {
            let kind = if service.primary {
                ServiceKind::Primary
            } else {
                ServiceKind::Secondary
            };
            services.push(ServiceInfo::new(service.uuid, kind));

            for characteristic in service.characteristics {
                debug!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid, service.uuid
                );
                characteristics.push(CharacteristicInfo::new(
                    characteristic.uuid,
                    service.uuid,
                    properties_from_flags(characteristic.properties),
                ));
            }
        }

        debug!(
            "Discovered {} services, {} characteristics",
            services.len(),
            characteristics.len()
        );

        Ok(CapabilitySet::new(services, characteristics))
    }

    async fn read(&self, info: &CharacteristicInfo) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(info)?;
        let data = self.peripheral.read(&characteristic).await?;

        trace!("Read {} bytes from characteristic {}", data.len(), info.uuid);

        Ok(data)
    }

    async fn write(
        &self,
        info: &CharacteristicInfo,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let characteristic = self.characteristic(info)?;

        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral.write(&characteristic, value, write_type).await?;

        trace!("Wrote {} bytes to characteristic {}", value.len(), info.uuid);

        Ok(())
    }
}
