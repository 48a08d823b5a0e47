//! Application wiring.
//!
//! The [`Bridge`] scans for blinds and gives each one a [`DeviceManager`], an
//! HTTP adapter on its derived port and a beacon entry. It routes the stack's
//! link events to the owning manager.

use btleplug::platform::PeripheralId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::beacon::{BeaconEntry, SsdpBeacon};
use crate::ble::connection::ConnectionState;
use crate::ble::link::{BtleplugLink, LinkEvent, LinkLayer};
use crate::ble::scanner::{BleScanner, ScanEvent};
use crate::config::BridgeConfig;
use crate::device_manager::{DeviceIdentity, DeviceManager};
use crate::error::{Error, Result};
use crate::http::{DeviceRoutes, HttpServer};
use crate::utils::detect_local_ip;

/// One bridged device and the tasks serving it.
struct BridgedDevice {
    /// The device.
    manager: DeviceManager,
    /// HTTP port.
    port: u16,
    /// Beacon identifier, if the beacon is enabled.
    udn: Option<String>,
    /// HTTP server and lifecycle tasks.
    tasks: Vec<JoinHandle<()>>,
}

/// Scans for blinds and bridges each one to HTTP.
pub struct Bridge {
    /// Bridge configuration.
    config: BridgeConfig,
    /// BLE scanner.
    scanner: Arc<BleScanner>,
    /// Shared SSDP responder, if enabled.
    beacon: Option<SsdpBeacon>,
    /// Host put into beacon locations.
    advertise_host: IpAddr,
    /// Bridged devices by peripheral.
    devices: Arc<RwLock<HashMap<PeripheralId, BridgedDevice>>>,
    /// Whether the bridge is running.
    is_running: Arc<AtomicBool>,
    /// Background tasks (event routing, beacon).
    background: RwLock<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Create a bridge on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, Bluetooth is not
    /// available, or the beacon socket cannot be opened.
    pub async fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let scanner = Arc::new(BleScanner::new(config.device_name.clone()).await?);

        let advertise_host = config.advertise_host.unwrap_or_else(detect_local_ip);

        let beacon = if config.beacon_enabled {
            let interface = match advertise_host {
                IpAddr::V4(v4) if !v4.is_loopback() => v4,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            Some(SsdpBeacon::bind(interface).await?)
        } else {
            info!("SSDP beacon disabled");
            None
        };

        Ok(Self {
            config,
            scanner,
            beacon,
            advertise_host,
            devices: Arc::new(RwLock::new(HashMap::new())),
            is_running: Arc::new(AtomicBool::new(false)),
            background: RwLock::new(Vec::new()),
        })
    }

    /// Start scanning and bridging.
    pub async fn start(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!("Bridge already running");
            return Ok(());
        }

        if let Some(beacon) = &self.beacon {
            self.background.write().push(tokio::spawn(beacon.clone().run()));
        }

        // Subscribe before the scan starts so the first discoveries are seen.
        let mut rx = self.scanner.subscribe();
        self.scanner.start_scanning().await?;

        let ctx = BridgeContext {
            config: self.config.clone(),
            beacon: self.beacon.clone(),
            advertise_host: self.advertise_host,
            devices: self.devices.clone(),
        };
        let is_running = self.is_running.clone();

        let handle = tokio::spawn(async move {
            while is_running.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Ok(event) => ctx.handle_scan_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Scan event receiver lagged, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            debug!("Bridge event loop ended");
        });

        self.background.write().push(handle);

        info!(
            "Bridge started: name \"{}\", base port {}, advertising as {}",
            self.config.device_name, self.config.base_port, self.advertise_host
        );

        Ok(())
    }

    /// Managers of all bridged devices.
    pub fn devices(&self) -> Vec<DeviceManager> {
        self.devices
            .read()
            .values()
            .map(|d| d.manager.clone())
            .collect()
    }

    /// Ports of all bridged devices, by address.
    pub fn ports(&self) -> Vec<(String, u16)> {
        self.devices
            .read()
            .values()
            .map(|d| (d.manager.identity().address.clone(), d.port))
            .collect()
    }

    /// Stop scanning, withdraw beacon entries and disconnect every device.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down bridge");

        self.is_running.store(false, Ordering::SeqCst);

        for handle in self.background.write().drain(..) {
            handle.abort();
        }

        if let Err(e) = self.scanner.stop_scanning().await {
            warn!("Failed to stop scanning: {}", e);
        }

        let devices: Vec<BridgedDevice> = self.devices.write().drain().map(|(_, d)| d).collect();

        for device in devices {
            for task in &device.tasks {
                task.abort();
            }

            if let (Some(beacon), Some(udn)) = (&self.beacon, &device.udn) {
                if let Err(e) = beacon.withdraw(udn).await {
                    debug!("Failed to withdraw {}: {}", udn, e);
                }
            }

            if device.manager.state() != ConnectionState::Disconnected {
                if let Err(e) = device.manager.disconnect().await {
                    warn!("{}: disconnect failed: {}", device.manager.identity(), e);
                }
            }
        }

        Ok(())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

/// State the event loop needs.
struct BridgeContext {
    config: BridgeConfig,
    beacon: Option<SsdpBeacon>,
    advertise_host: IpAddr,
    devices: Arc<RwLock<HashMap<PeripheralId, BridgedDevice>>>,
}

impl BridgeContext {
    async fn handle_scan_event(&self, event: ScanEvent) {
        match event {
            ScanEvent::Discovered {
                id,
                peripheral,
                identity,
                rssi,
            } => {
                if self.devices.read().contains_key(&id) {
                    return;
                }

                let link: Arc<dyn LinkLayer> = Arc::new(BtleplugLink::new(peripheral));
                match self.add_device(identity, link).await {
                    Ok(device) => {
                        if let Some(rssi) = rssi {
                            let _ = device
                                .manager
                                .link_events()
                                .send(LinkEvent::SignalUpdate(rssi));
                        }
                        self.devices.write().insert(id, device);
                    }
                    Err(e) => error!("Could not bridge {:?}: {}", id, e),
                }
            }
            ScanEvent::Connected(id) => self.route(&id, LinkEvent::Connected),
            ScanEvent::Disconnected(id) => self.route(&id, LinkEvent::Disconnected),
            ScanEvent::SignalUpdate { id, rssi } => self.route(&id, LinkEvent::SignalUpdate(rssi)),
        }
    }

    fn route(&self, id: &PeripheralId, event: LinkEvent) {
        if let Some(device) = self.devices.read().get(id) {
            let _ = device.manager.link_events().send(event);
        }
    }

    /// Create the manager, bind its port, then start serving and discovery.
    async fn add_device(
        &self,
        identity: DeviceIdentity,
        link: Arc<dyn LinkLayer>,
    ) -> Result<BridgedDevice> {
        let port = identity.port(self.config.base_port)?;

        let manager = DeviceManager::new(identity, link, self.config.device.clone());
        manager.start();

        // Collisions between devices sharing the last address characters
        // surface here as a bind error.
        let server = HttpServer::bind(SocketAddr::new(self.config.bind_host, port)).await?;

        let advertisement = match &self.beacon {
            Some(beacon) => Some((
                beacon.clone(),
                BeaconEntry::for_server(&server, self.advertise_host, manager.identity())?,
            )),
            None => None,
        };
        let udn = advertisement.as_ref().map(|(_, entry)| entry.udn.clone());

        info!(
            "{} bridged on http://{}:{}/",
            manager.identity(),
            self.advertise_host,
            server.port()
        );

        let routes = DeviceRoutes::new(manager.clone(), self.config.write_target);
        let tasks = vec![
            tokio::spawn(server.serve(routes)),
            tokio::spawn(run_lifecycle(manager.clone(), advertisement)),
        ];

        Ok(BridgedDevice {
            manager,
            port,
            udn,
            tasks,
        })
    }
}

/// Keep a device discovered and its beacon entry in step with its sessions.
///
/// Advertises once the capability set resolves, withdraws when the link
/// drops, and retries failed discovery with the reconnect backoff.
pub(crate) async fn run_lifecycle(
    manager: DeviceManager,
    advertisement: Option<(SsdpBeacon, BeaconEntry)>,
) {
    let policy = manager.config().reconnect;
    let mut failures = 0;

    loop {
        match manager.capabilities().await {
            Ok(_) => {
                failures = 0;

                if let Some((beacon, entry)) = &advertisement {
                    if let Err(e) = beacon.advertise(entry.clone()).await {
                        warn!("{}: SSDP announce failed: {}", manager.identity(), e);
                    }
                }

                if !wait_for_state(&manager, ConnectionState::Disconnected).await {
                    return;
                }

                if let Some((beacon, entry)) = &advertisement {
                    if let Err(e) = beacon.withdraw(&entry.udn).await {
                        warn!("{}: SSDP withdraw failed: {}", manager.identity(), e);
                    }
                }

                if !wait_for_state(&manager, ConnectionState::Connected).await {
                    return;
                }
            }
            Err(Error::SessionEnded) => {
                debug!("{}: discovery interrupted by link loss", manager.identity());
                if !wait_for_state(&manager, ConnectionState::Connected).await {
                    return;
                }
            }
            Err(e) => {
                failures += 1;
                warn!("{}: capabilities unavailable: {}", manager.identity(), e);

                if !policy.allows(failures) {
                    info!(
                        "{}: not retrying discovery, waiting for a new connection",
                        manager.identity()
                    );
                    if !wait_for_state(&manager, ConnectionState::Connected).await {
                        return;
                    }
                    failures = 0;
                    continue;
                }

                tokio::time::sleep(policy.delay_for(failures)).await;

                if let Err(e) = manager.restart_session().await {
                    debug!("{}: restart failed: {}", manager.identity(), e);
                }
            }
        }
    }
}

/// Wait until the device reaches `wanted`. Returns `false` if it never can.
async fn wait_for_state(manager: &DeviceManager, wanted: ConnectionState) -> bool {
    let mut events = manager.subscribe();

    if manager.state() == wanted {
        return true;
    }

    loop {
        match events.recv().await {
            Ok(event) if event.state == wanted => return true,
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                if manager.state() == wanted {
                    return true;
                }
            }
            Err(RecvError::Closed) => return false,
        }
    }
}
