//! BLE scanning functionality.
//!
//! Provides the scanner that finds peripherals advertising the configured
//! local name and reports their link events.

use btleplug::api::{
    AddressType as BtAddressType, BDAddr, Central, CentralEvent, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use crate::device_manager::{AddressType, DeviceIdentity};
use crate::error::{Error, Result};

/// Event emitted by the scanner.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A matching peripheral was seen for the first time.
    Discovered {
        /// The BLE peripheral identifier.
        id: PeripheralId,
        /// The peripheral handle.
        peripheral: Peripheral,
        /// What the advertisement told us about it.
        identity: DeviceIdentity,
        /// Signal strength in dBm.
        rssi: Option<i16>,
    },
    /// The stack reports the link to a known peripheral is up.
    Connected(PeripheralId),
    /// The stack reports the link to a known peripheral is down.
    Disconnected(PeripheralId),
    /// New signal strength for a known peripheral.
    SignalUpdate {
        /// The BLE peripheral identifier.
        id: PeripheralId,
        /// Signal strength in dBm.
        rssi: i16,
    },
}

/// BLE scanner for discovering peripherals by advertised name.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Local name a peripheral must advertise to be reported.
    device_name: String,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Peripherals already reported as discovered.
    known: Arc<RwLock<HashSet<PeripheralId>>>,
    /// Channel for scan events.
    event_tx: broadcast::Sender<ScanEvent>,
    /// Handle to the scanning task.
    scan_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl BleScanner {
    /// Create a scanner on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no usable adapter.
    pub async fn new(device_name: impl Into<String>) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, device_name))
    }

    /// Create a scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter, device_name: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            adapter,
            device_name: device_name.into(),
            is_scanning: Arc::new(RwLock::new(false)),
            known: Arc::new(RwLock::new(HashSet::new())),
            event_tx,
            scan_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Start scanning.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning cannot be started.
    pub async fn start_scanning(&self) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for \"{}\" peripherals", self.device_name);

        // Subscribe before scanning so no discovery is missed.
        let mut events = self.adapter.events().await?;

        self.adapter.start_scan(ScanFilter::default()).await?;

        *self.is_scanning.write() = true;

        let adapter = self.adapter.clone();
        let device_name = self.device_name.clone();
        let is_scanning = self.is_scanning.clone();
        let known = self.known.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while *is_scanning.read() {
                tokio::select! {
                    event = events.next() => {
                        let Some(event) = event else {
                            error!("Adapter event stream ended");
                            break;
                        };
                        Self::handle_event(event, &adapter, &device_name, &known, &event_tx).await;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        *self.is_scanning.write() = false;

        self.adapter.stop_scan().await?;

        let handle = self.scan_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Subscribe to scan events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_tx.subscribe()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        device_name: &str,
        known: &RwLock<HashSet<PeripheralId>>,
        event_tx: &broadcast::Sender<ScanEvent>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device seen: {:?}", id);
                Self::process_peripheral(adapter, id, device_name, known, event_tx).await;
            }
            CentralEvent::DeviceConnected(id) => {
                if known.read().contains(&id) {
                    debug!("Device connected: {:?}", id);
                    let _ = event_tx.send(ScanEvent::Connected(id));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if known.read().contains(&id) {
                    debug!("Device disconnected: {:?}", id);
                    let _ = event_tx.send(ScanEvent::Disconnected(id));
                }
            }
            _ => {}
        }
    }

    /// Report a peripheral if it matches, or its signal if already known.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        device_name: &str,
        known: &RwLock<HashSet<PeripheralId>>,
        event_tx: &broadcast::Sender<ScanEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        if known.read().contains(&id) {
            if let Some(rssi) = properties.rssi {
                let _ = event_tx.send(ScanEvent::SignalUpdate { id, rssi });
            }
            return;
        }

        let Some(local_name) = properties.local_name else {
            return;
        };

        trace!("Advertisement: {}", local_name);

        if local_name != device_name {
            return;
        }

        if !known.write().insert(id.clone()) {
            return;
        }

        let identity = DeviceIdentity::new(
            peripheral_address(properties.address, &id),
            address_type(properties.address_type),
            local_name,
        );

        info!("Adding {}", identity);

        let _ = event_tx.send(ScanEvent::Discovered {
            id,
            peripheral,
            identity,
            rssi: properties.rssi,
        });
    }
}

/// Hardware address of a peripheral as a string.
///
/// Some platforms hide the hardware address and report all zeros; the stack's
/// peripheral identifier is stable per device and stands in for it.
pub fn peripheral_address(address: BDAddr, id: &PeripheralId) -> String {
    if address == BDAddr::default() {
        id.to_string()
    } else {
        address.to_string()
    }
}

fn address_type(address_type: Option<BtAddressType>) -> AddressType {
    match address_type {
        Some(BtAddressType::Public) => AddressType::Public,
        Some(BtAddressType::Random) => AddressType::Random,
        None => AddressType::Unknown,
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}
