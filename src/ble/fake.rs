//! Scripted link layer for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::ble::link::LinkLayer;
use crate::ble::uuids::{from_short, DEVICE_NAME_UUID, GENERIC_ACCESS_SERVICE_UUID};
use crate::capabilities::{
    CapabilitySet, CharacteristicInfo, CharacteristicProperty, ServiceInfo, ServiceKind,
};
use crate::error::{Error, Result};

/// Vendor service of the blind.
pub const BLIND_SERVICE_UUID: Uuid = from_short(0xfff0);
/// Motor position characteristic, fifth in discovery order.
pub const MOTOR_UUID: Uuid = from_short(0xfff4);

/// Capability set shaped like a real blind: the motor is characteristic #4.
pub fn blind_capabilities() -> CapabilitySet {
    use CharacteristicProperty::*;

    let vendor = |short: u16, properties: Vec<CharacteristicProperty>| {
        CharacteristicInfo::new(from_short(short), BLIND_SERVICE_UUID, properties)
    };

    CapabilitySet::new(
        vec![
            ServiceInfo::new(GENERIC_ACCESS_SERVICE_UUID, ServiceKind::Primary),
            ServiceInfo::new(BLIND_SERVICE_UUID, ServiceKind::Primary),
        ],
        vec![
            CharacteristicInfo::new(DEVICE_NAME_UUID, GENERIC_ACCESS_SERVICE_UUID, vec![Read]),
            vendor(0xfff1, vec![Read, Notify]),
            vendor(0xfff2, vec![Read]),
            vendor(0xfff3, vec![Write]),
            vendor(0xfff4, vec![Read, Write]),
        ],
    )
}

/// Link layer whose outcomes and timing are set by the test.
#[derive(Default)]
pub struct FakeLink {
    pub connect_calls: AtomicUsize,
    pub discover_calls: AtomicUsize,
    pub read_calls: AtomicUsize,
    pub write_calls: AtomicUsize,
    connect_results: Mutex<VecDeque<Result<()>>>,
    discover_results: Mutex<VecDeque<Result<CapabilitySet>>>,
    read_results: Mutex<VecDeque<Result<Vec<u8>>>>,
    write_results: Mutex<VecDeque<Result<()>>>,
    connect_delay: Mutex<Duration>,
    discover_delay: Mutex<Duration>,
    io_delay: Mutex<Duration>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    pub written: Mutex<Vec<(Uuid, Vec<u8>, bool)>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_connect(&self, result: Result<()>) -> &Self {
        self.connect_results.lock().push_back(result);
        self
    }

    pub fn push_discover(&self, result: Result<CapabilitySet>) -> &Self {
        self.discover_results.lock().push_back(result);
        self
    }

    pub fn push_read(&self, result: Result<Vec<u8>>) -> &Self {
        self.read_results.lock().push_back(result);
        self
    }

    pub fn push_write(&self, result: Result<()>) -> &Self {
        self.write_results.lock().push_back(result);
        self
    }

    pub fn set_connect_delay(&self, delay: Duration) -> &Self {
        *self.connect_delay.lock() = delay;
        self
    }

    pub fn set_discover_delay(&self, delay: Duration) -> &Self {
        *self.discover_delay.lock() = delay;
        self
    }

    pub fn set_io_delay(&self, delay: Duration) -> &Self {
        *self.io_delay.lock() = delay;
        self
    }

    pub fn set_value(&self, uuid: Uuid, value: Vec<u8>) -> &Self {
        self.values.lock().insert(uuid, value);
        self
    }

    pub fn calls(&self) -> (usize, usize, usize, usize) {
        (
            self.connect_calls.load(Ordering::SeqCst),
            self.discover_calls.load(Ordering::SeqCst),
            self.read_calls.load(Ordering::SeqCst),
            self.write_calls.load(Ordering::SeqCst),
        )
    }

    async fn pause(delay: &Mutex<Duration>) {
        let delay = *delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

/// Counts an operation as in flight until dropped, including on cancellation.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LinkLayer for FakeLink {
    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.connect_delay).await;
        self.connect_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn discover(&self) -> Result<CapabilitySet> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        let turn = self.enter();
        Self::pause(&self.discover_delay).await;
        drop(turn);
        self.discover_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(blind_capabilities()))
    }

    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let turn = self.enter();
        Self::pause(&self.io_delay).await;
        drop(turn);
        if let Some(result) = self.read_results.lock().pop_front() {
            return result;
        }
        self.values
            .lock()
            .get(&characteristic.uuid)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no value for {}", characteristic.uuid)))
    }

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let turn = self.enter();
        Self::pause(&self.io_delay).await;
        drop(turn);
        let result = self.write_results.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.written
                .lock()
                .push((characteristic.uuid, value.to_vec(), with_response));
            self.values.lock().insert(characteristic.uuid, value.to_vec());
        }
        result
    }
}
