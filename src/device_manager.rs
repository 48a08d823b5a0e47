//! Per-device connection and capability management.
//!
//! A [`DeviceManager`] owns the link to one peripheral. It connects on demand,
//! runs capability discovery at most once per connection session, serializes
//! characteristic reads and writes, and reacts to link notifications. Adapters
//! (HTTP, beacon) only ever talk to the device through it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::ble::connection::{ConnectionEvent, ConnectionState, ConnectionTracker, Transition};
use crate::ble::link::{LinkEvent, LinkLayer};
use crate::capabilities::{
    CapabilityCache, CapabilitySet, CapabilityStatus, CharacteristicRef, DiscoveryOutcome,
    PendingDiscovery,
};
use crate::config::{DeviceConfig, ReconnectPolicy};
use crate::error::{Error, Result};
use crate::utils::{beacon_udn, derive_port};

/// Kind of Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// IEEE assigned public address.
    Public,
    /// Random (static or private) address.
    Random,
    /// The stack did not report the type.
    #[default]
    Unknown,
}

/// What was observed about a peripheral when it was first discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Hardware address as reported by the stack.
    pub address: String,
    /// Address type.
    pub address_type: AddressType,
    /// Advertised local name.
    pub name: String,
    /// Whether the peripheral accepts connections.
    pub connectable: bool,
}

impl DeviceIdentity {
    /// Create an identity for a connectable peripheral.
    pub fn new(
        address: impl Into<String>,
        address_type: AddressType,
        name: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            address_type,
            name: name.into(),
            connectable: true,
        }
    }

    /// HTTP port for this device.
    pub fn port(&self, base_port: u16) -> Result<u16> {
        derive_port(&self.address, base_port)
    }

    /// Beacon unique device name.
    pub fn udn(&self) -> Result<String> {
        beacon_udn(&self.address)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device: {} -- {}", self.name, self.address)
    }
}

/// Last signal strength reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalReading {
    /// RSSI in dBm.
    pub rssi: i16,
    /// When the reading arrived.
    pub at: DateTime<Utc>,
}

struct DeviceInner {
    /// Identity of the peripheral.
    identity: DeviceIdentity,
    /// Radio link.
    link: Arc<dyn LinkLayer>,
    /// Timeouts and reconnect policy.
    config: DeviceConfig,
    /// Connection state machine.
    connection: ConnectionTracker,
    /// Discovery memo for the current session.
    capabilities: CapabilityCache,
    /// Serializes connect attempts.
    connect_lock: tokio::sync::Mutex<()>,
    /// Serializes characteristic reads and writes.
    op_queue: tokio::sync::Mutex<()>,
    /// Signal strength telemetry.
    signal: RwLock<Option<SignalReading>>,
    /// Whether a reconnect task is running.
    reconnecting: AtomicBool,
    /// Sender half handed to the stack's event router.
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    /// Receiver half, taken by [`DeviceManager::start`].
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

/// Manages one peripheral. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<DeviceInner>,
}

impl DeviceManager {
    /// Create a manager for a peripheral reachable through `link`.
    ///
    /// Nothing touches the radio until the first connect or capability request.
    pub fn new(identity: DeviceIdentity, link: Arc<dyn LinkLayer>, config: DeviceConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(DeviceInner {
                connection: ConnectionTracker::new(identity.address.clone()),
                identity,
                link,
                config,
                capabilities: CapabilityCache::new(),
                connect_lock: tokio::sync::Mutex::new(()),
                op_queue: tokio::sync::Mutex::new(()),
                signal: RwLock::new(None),
                reconnecting: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Start processing link events. Calling it again has no effect.
    ///
    /// Events are handled one at a time in arrival order.
    pub fn start(&self) {
        let Some(mut rx) = self.inner.events_rx.lock().take() else {
            debug!("{}: event loop already running", self.inner.identity);
            return;
        };

        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                DeviceManager { inner }.handle_link_event(event);
            }
            trace!("Link event loop ended");
        });
    }

    /// Sender the stack uses to report link events for this device.
    pub fn link_events(&self) -> mpsc::UnboundedSender<LinkEvent> {
        self.inner.events_tx.clone()
    }

    /// Get the identity of the peripheral.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    /// Get the timing configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.subscribe()
    }

    /// Latest signal strength reading, if any arrived.
    pub fn signal(&self) -> Option<SignalReading> {
        *self.inner.signal.read()
    }

    // === Connection ===

    /// Connect to the peripheral. Returns immediately if already connected.
    ///
    /// # Errors
    ///
    /// [`Error::Link`] if the connect primitive fails or times out.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.connection.is_connected() {
            debug!("{}: already connected", self.inner.identity);
            return Ok(());
        }

        let _guard = self.inner.connect_lock.lock().await;

        // Another caller may have connected while we waited for the lock.
        if self.inner.connection.is_connected() {
            return Ok(());
        }

        self.inner.connection.apply(Transition::ConnectStarted);
        info!("{}: connecting", self.inner.identity);

        let limit = self.inner.config.connect_timeout;
        let outcome = match timeout(limit, self.inner.link.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Link {
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Link {
                reason: format!("connect timed out after {:?}", limit),
            }),
        };

        match outcome {
            Ok(()) => {
                self.on_link_up();
                Ok(())
            }
            Err(e) => {
                self.inner.connection.apply(Transition::ConnectFailed);
                warn!("{}: {}", self.inner.identity, e);
                Err(e)
            }
        }
    }

    /// Tear the link down without scheduling a reconnect.
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.inner.link.disconnect().await;
        self.end_session();
        result
    }

    /// Drop the current session and connect again.
    ///
    /// This is the explicit way out of a cached discovery failure.
    pub async fn restart_session(&self) -> Result<()> {
        if let Err(e) = self.inner.link.disconnect().await {
            debug!("{}: disconnect before restart failed: {}", self.inner.identity, e);
        }
        self.end_session();
        self.connect().await
    }

    /// Start the background reconnect loop. Returns `false` if the policy
    /// forbids it or a loop is already running.
    pub fn schedule_reconnect(&self) -> bool {
        let policy = self.inner.config.reconnect;
        if !policy.is_enabled() {
            return false;
        }

        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("{}: reconnect already scheduled", self.inner.identity);
            return false;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.reconnect_loop(policy).await;
            manager.inner.reconnecting.store(false, Ordering::SeqCst);
        });

        true
    }

    async fn reconnect_loop(&self, policy: ReconnectPolicy) {
        let mut attempts = 0;

        while policy.allows(attempts) {
            attempts += 1;
            let delay = policy.delay_for(attempts);
            debug!(
                "{}: reconnect attempt {} in {:?}",
                self.inner.identity, attempts, delay
            );
            tokio::time::sleep(delay).await;

            if self.inner.connection.is_connected() {
                return;
            }

            match self.connect().await {
                Ok(()) => {
                    info!(
                        "{}: reconnected after {} attempt(s)",
                        self.inner.identity, attempts
                    );
                    // New session, so discovery runs again.
                    let _ = self.pending_discovery();
                    return;
                }
                Err(e) => warn!(
                    "{}: reconnect attempt {} failed: {}",
                    self.inner.identity, attempts, e
                ),
            }
        }

        warn!(
            "{}: giving up reconnecting after {} attempt(s)",
            self.inner.identity, attempts
        );
    }

    // === Capabilities ===

    /// The capability set of the current session.
    ///
    /// The first call connects if needed and runs discovery; concurrent and
    /// later calls share that single computation and its outcome.
    ///
    /// # Errors
    ///
    /// [`Error::Link`] if connecting failed, [`Error::Discovery`] if
    /// enumeration failed or timed out. Failures are cached until a new
    /// connection succeeds.
    pub async fn capabilities(&self) -> Result<Arc<CapabilitySet>> {
        self.pending_discovery().await
    }

    /// Snapshot of the capability cache, never waits.
    pub fn capability_status(&self) -> CapabilityStatus {
        self.inner.capabilities.status()
    }

    /// Request capabilities but wait at most `wait` for them.
    pub async fn capabilities_within(&self, wait: Duration) -> CapabilityStatus {
        match timeout(wait, self.pending_discovery()).await {
            Ok(Ok(set)) => CapabilityStatus::Ready(set),
            Ok(Err(e)) => CapabilityStatus::Failed(e),
            Err(_) => CapabilityStatus::Pending,
        }
    }

    /// Number of discovery computations started so far.
    pub fn discoveries_started(&self) -> u64 {
        self.inner.capabilities.discoveries_started()
    }

    fn pending_discovery(&self) -> PendingDiscovery {
        let manager = self.clone();
        self.inner
            .capabilities
            .get_or_start(move || async move { manager.run_discovery().await })
    }

    async fn run_discovery(&self) -> DiscoveryOutcome {
        self.connect().await?;

        let limit = self.inner.config.discovery_timeout;
        let result = match timeout(limit, self.inner.link.discover()).await {
            Ok(Ok(set)) => Ok(Arc::new(set)),
            Ok(Err(e)) => Err(Error::Discovery {
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Discovery {
                reason: format!("discovery timed out after {:?}", limit),
            }),
        };

        match &result {
            Ok(set) => info!(
                "{}: discovered {} services, {} characteristics",
                self.inner.identity,
                set.services.len(),
                set.characteristics.len()
            ),
            Err(e) => warn!("{}: {}", self.inner.identity, e),
        }

        result
    }

    // === Characteristic operations ===

    /// Read a characteristic of the discovered set.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] before discovery has succeeded (no radio I/O
    /// happens), [`Error::CharacteristicNotFound`], or [`Error::Read`].
    pub async fn read_characteristic(&self, reference: &CharacteristicRef) -> Result<Vec<u8>> {
        let set = self
            .inner
            .capabilities
            .resolved()
            .ok_or(Error::NotConnected)?;
        let characteristic = set.find(reference)?;

        // Waiting for the queue counts against the timeout.
        let limit = self.inner.config.io_timeout;
        let read = async {
            let _turn = self.inner.op_queue.lock().await;
            self.inner.link.read(characteristic).await
        };

        match timeout(limit, read).await {
            Ok(Ok(value)) => {
                trace!(
                    "{}: read {} bytes from {}",
                    self.inner.identity,
                    value.len(),
                    characteristic.uuid
                );
                Ok(value)
            }
            Ok(Err(e)) => Err(Error::Read {
                uuid: characteristic.uuid.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Read {
                uuid: characteristic.uuid.to_string(),
                reason: format!("timed out after {:?}", limit),
            }),
        }
    }

    /// Write a characteristic of the discovered set, waiting for acknowledgment.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] before discovery has succeeded (no radio I/O
    /// happens), [`Error::CharacteristicNotFound`], or [`Error::Write`].
    pub async fn write_characteristic(
        &self,
        reference: &CharacteristicRef,
        value: &[u8],
    ) -> Result<bool> {
        let set = self
            .inner
            .capabilities
            .resolved()
            .ok_or(Error::NotConnected)?;
        let characteristic = set.find(reference)?;

        let limit = self.inner.config.io_timeout;
        let write = async {
            let _turn = self.inner.op_queue.lock().await;
            self.inner.link.write(characteristic, value, true).await
        };

        match timeout(limit, write).await {
            Ok(Ok(())) => {
                debug!(
                    "{}: wrote {:02X?} to {}",
                    self.inner.identity, value, characteristic.uuid
                );
                Ok(true)
            }
            Ok(Err(e)) => Err(Error::Write {
                uuid: characteristic.uuid.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Write {
                uuid: characteristic.uuid.to_string(),
                reason: format!("timed out after {:?}", limit),
            }),
        }
    }

    // === Link events ===

    /// Apply one link notification.
    pub(crate) fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => self.on_link_up(),
            LinkEvent::Disconnected => {
                if self.end_session() {
                    self.schedule_reconnect();
                }
            }
            LinkEvent::SignalUpdate(rssi) => {
                trace!("{}: rssi {}", self.inner.identity, rssi);
                *self.inner.signal.write() = Some(SignalReading {
                    rssi,
                    at: Utc::now(),
                });
            }
        }
    }

    fn on_link_up(&self) {
        if self.inner.connection.apply(Transition::LinkUp).is_none() {
            return;
        }

        info!("{}: Connected", self.inner.identity);

        if self.inner.capabilities.clear_failure() {
            debug!(
                "{}: cleared cached discovery failure for the new session",
                self.inner.identity
            );
        }
    }

    /// Returns whether a session actually ended.
    fn end_session(&self) -> bool {
        if self.inner.connection.apply(Transition::LinkDown).is_none() {
            return false;
        }

        info!("{}: Disconnected", self.inner.identity);

        if self.inner.capabilities.invalidate() {
            debug!("{}: capability set invalidated", self.inner.identity);
        }

        true
    }
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .field("capabilities", &self.inner.capabilities)
            .finish()
    }
}
