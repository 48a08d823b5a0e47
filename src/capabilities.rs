//! Discovered services and characteristics, and the cache that memoizes them.
//!
//! Enumerating a peripheral's GATT table is slow and most stacks refuse to run
//! two enumerations on one connection. [`CapabilityCache`] therefore holds a
//! single shared computation: the first caller starts it, every other caller
//! awaits the same future and sees the same outcome, success or failure.
//!
//! When a session ends mid-discovery the running computation is cancelled, and
//! the next one does not touch the link until the cancelled one has unwound.

use futures::future::{join_all, AbortHandle, Abortable, Aborted, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::ble::uuids::{characteristic_name, service_name};
use crate::error::{Error, Result};

/// GATT characteristic property flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CharacteristicProperty {
    /// Value may be broadcast in advertisements.
    Broadcast,
    /// Value may be read.
    Read,
    /// Value may be written without acknowledgment.
    WriteWithoutResponse,
    /// Value may be written with acknowledgment.
    Write,
    /// Value changes are notified.
    Notify,
    /// Value changes are indicated (acknowledged notify).
    Indicate,
    /// Signed writes are accepted.
    AuthenticatedSignedWrites,
    /// Extended properties descriptor is present.
    ExtendedProperties,
}

/// Whether a service is primary or included by another service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Primary service.
    Primary,
    /// Secondary (included) service.
    Secondary,
}

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    /// Service UUID.
    pub uuid: Uuid,
    /// Primary or secondary.
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    /// Well-known name, if the UUID is a SIG assigned number.
    pub name: Option<String>,
}

impl ServiceInfo {
    /// Describe a service, looking up its well-known name.
    pub fn new(uuid: Uuid, kind: ServiceKind) -> Self {
        Self {
            uuid,
            kind,
            name: service_name(&uuid).map(str::to_string),
        }
    }
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Well-known name, if the UUID is a SIG assigned number.
    pub name: Option<String>,
    /// Capability flags.
    #[serde(rename = "type")]
    pub properties: Vec<CharacteristicProperty>,
    /// UUID of the owning service.
    pub service_uuid: Uuid,
}

impl CharacteristicInfo {
    /// Describe a characteristic, looking up its well-known name.
    pub fn new(uuid: Uuid, service_uuid: Uuid, properties: Vec<CharacteristicProperty>) -> Self {
        Self {
            uuid,
            name: characteristic_name(&uuid).map(str::to_string),
            properties,
            service_uuid,
        }
    }

    /// Check for a property flag.
    pub fn has(&self, property: CharacteristicProperty) -> bool {
        self.properties.contains(&property)
    }
}

/// How a caller names a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRef {
    /// By UUID. Preferred, stable across firmware revisions.
    Uuid(Uuid),
    /// By position in discovery order, as the first HTTP clients addressed them.
    Index(usize),
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(uuid) => write!(f, "{}", uuid),
            Self::Index(index) => write!(f, "#{}", index),
        }
    }
}

/// The resolved services and characteristics of one connection session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    /// Services in discovery order.
    pub services: Vec<ServiceInfo>,
    /// Characteristics of all services, in discovery order.
    pub characteristics: Vec<CharacteristicInfo>,
}

impl CapabilitySet {
    /// Build a capability set.
    pub fn new(services: Vec<ServiceInfo>, characteristics: Vec<CharacteristicInfo>) -> Self {
        Self {
            services,
            characteristics,
        }
    }

    /// Resolve a characteristic reference.
    pub fn find(&self, reference: &CharacteristicRef) -> Result<&CharacteristicInfo> {
        let found = match reference {
            CharacteristicRef::Uuid(uuid) => self.characteristics.iter().find(|c| c.uuid == *uuid),
            CharacteristicRef::Index(index) => self.characteristics.get(*index),
        };

        found.ok_or_else(|| Error::CharacteristicNotFound {
            identifier: reference.to_string(),
        })
    }
}

/// Outcome of one discovery computation.
pub type DiscoveryOutcome = Result<Arc<CapabilitySet>>;

/// Handle to a discovery computation that any number of callers may await.
pub type PendingDiscovery = Shared<BoxFuture<'static, DiscoveryOutcome>>;

/// Non-blocking view of the cache.
#[derive(Debug, Clone)]
pub enum CapabilityStatus {
    /// No discovery has been requested in this session.
    NotStarted,
    /// Discovery is in flight.
    Pending,
    /// Discovery succeeded.
    Ready(Arc<CapabilitySet>),
    /// Discovery failed; the failure stays until a new connection succeeds.
    Failed(Error),
}

impl CapabilityStatus {
    /// The capability set, if resolved.
    pub fn ready(&self) -> Option<&Arc<CapabilitySet>> {
        match self {
            Self::Ready(set) => Some(set),
            _ => None,
        }
    }

    /// Placeholder text for clients when the set is not available.
    pub fn unavailable_reason(&self) -> Option<String> {
        match self {
            Self::Ready(_) => None,
            Self::NotStarted | Self::Pending => Some("not yet available".to_string()),
            Self::Failed(e) => Some(format!("unavailable: {}", e)),
        }
    }
}

/// A started computation and the switch that cancels it.
struct Computation {
    pending: PendingDiscovery,
    abort: AbortHandle,
}

#[derive(Default)]
struct Slot {
    /// The current session's computation, if one was started.
    current: Option<Computation>,
    /// Cancelled computations that may not have unwound yet.
    retired: Vec<PendingDiscovery>,
}

/// Write-once, read-many cell holding the discovery computation.
#[derive(Default)]
pub struct CapabilityCache {
    slot: Mutex<Slot>,
    /// Number of computations started over the cache's lifetime.
    started: AtomicU64,
}

impl CapabilityCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current computation, starting it with `start` if there is none.
    ///
    /// `start` runs under the latch and must only build the future; the work
    /// happens when the future is polled. The computation is also driven by a
    /// background task so it completes even if every caller stops waiting.
    /// A new computation first waits for every cancelled one to finish, so at
    /// most one is ever running.
    pub fn get_or_start<F, Fut>(&self, start: F) -> PendingDiscovery
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DiscoveryOutcome> + Send + 'static,
    {
        let mut slot = self.slot.lock();

        if let Some(current) = slot.current.as_ref() {
            return current.pending.clone();
        }

        slot.retired.retain(|p| p.peek().is_none());
        let retired = slot.retired.clone();
        let work = start();

        let (abort, registration) = AbortHandle::new_pair();
        let computation = Abortable::new(
            async move {
                join_all(retired).await;
                work.await
            },
            registration,
        );

        let pending = computation
            .map(|outcome| outcome.unwrap_or_else(|Aborted| Err(Error::SessionEnded)))
            .boxed()
            .shared();

        slot.current = Some(Computation {
            pending: pending.clone(),
            abort,
        });

        let generation = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Starting capability discovery #{}", generation);

        tokio::spawn(pending.clone().map(|_| ()));

        pending
    }

    /// Snapshot of the cache without waiting.
    pub fn status(&self) -> CapabilityStatus {
        match self.slot.lock().current.as_ref() {
            None => CapabilityStatus::NotStarted,
            Some(current) => match current.pending.peek() {
                None => CapabilityStatus::Pending,
                Some(Ok(set)) => CapabilityStatus::Ready(set.clone()),
                Some(Err(e)) => CapabilityStatus::Failed(e.clone()),
            },
        }
    }

    /// The capability set if discovery already succeeded.
    pub fn resolved(&self) -> Option<Arc<CapabilitySet>> {
        self.status().ready().cloned()
    }

    /// Forget the current computation. Returns whether one was held.
    ///
    /// A computation still running is cancelled; callers awaiting it receive
    /// [`Error::SessionEnded`].
    pub fn invalidate(&self) -> bool {
        let mut slot = self.slot.lock();
        let Some(current) = slot.current.take() else {
            return false;
        };

        if current.pending.peek().is_none() {
            current.abort.abort();
            slot.retired.push(current.pending);
        }

        true
    }

    /// Forget the current computation only if it finished with an error.
    pub fn clear_failure(&self) -> bool {
        let mut slot = self.slot.lock();
        let failed = matches!(
            slot.current.as_ref().and_then(|c| c.pending.peek()),
            Some(Err(_))
        );
        if failed {
            slot.current = None;
        }
        failed
    }

    /// Number of discovery computations started so far.
    pub fn discoveries_started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CapabilityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityCache")
            .field("status", &self.status())
            .field("started", &self.discoveries_started())
            .finish()
    }
}
