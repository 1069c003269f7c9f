//! In-memory BLE stack for testing.
//!
//! [`MockStack`] implements [`BleStack`] without any radio. Tests play the
//! part of the peripheral: they inject advertisements, power changes,
//! notifications and dropped connections, and inspect every call the link
//! made.
//!
//! # Features
//!
//! - **Call log**: every stack operation is recorded as a [`StackCall`]
//! - **Failure injection**: fail scans, connects, discovery or writes
//! - **Latency simulation**: delay connects to exercise superseded attempts

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Characteristic, WriteType};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

use crate::ble::stack::{
    BleStack, EventStream, NotificationEvent, NotificationStream, PeripheralHandle, StackEvent,
};
use crate::ble::uuids::{
    INBOUND_CHARACTERISTIC_UUID, OUTBOUND_CHARACTERISTIC_UUID, UART_SERVICE_UUID,
};
use crate::error::{Error, Result};

/// One recorded stack operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCall {
    /// `start_scan`.
    StartScan,
    /// `stop_scan`.
    StopScan,
    /// `connect` to the peripheral id.
    Connect(String),
    /// `disconnect` from the peripheral id.
    Disconnect(String),
    /// `discover_services` on the peripheral id.
    DiscoverServices(String),
    /// `discover_characteristics` on the peripheral id and service.
    DiscoverCharacteristics(String, Uuid),
    /// `subscribe` to a characteristic.
    Subscribe(String, Uuid),
    /// `write` of one packet.
    Write {
        /// Peripheral id.
        id: String,
        /// Packet contents.
        data: Vec<u8>,
        /// Write mode used.
        write_type: WriteType,
    },
}

#[derive(Debug)]
struct MockState {
    calls: Vec<StackCall>,
    powered_on: bool,
    scanning: bool,
    services: Vec<Uuid>,
    characteristics: Vec<Characteristic>,
    connected: HashSet<String>,
    fail_scan: bool,
    fail_connect: bool,
    fail_discovery: bool,
    fail_disconnect: bool,
    /// Write calls (1-based) that fail.
    failing_writes: HashSet<usize>,
    write_count: usize,
    connect_latency: Duration,
}

/// A scriptable [`BleStack`] for tests and demos.
pub struct MockStack {
    state: Mutex<MockState>,
    event_tx: mpsc::UnboundedSender<StackEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<StackEvent>>>,
    notification_tx: Mutex<Option<mpsc::UnboundedSender<NotificationEvent>>>,
}

impl std::fmt::Debug for MockStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockStack")
            .field("powered_on", &state.powered_on)
            .field("scanning", &state.scanning)
            .field("connected", &state.connected)
            .finish()
    }
}

impl Default for MockStack {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStack {
    /// Create a powered stack whose peripherals expose a complete UART
    /// service with a write-without-response outbound characteristic.
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded();

        Self {
            state: Mutex::new(MockState {
                calls: Vec::new(),
                powered_on: true,
                scanning: false,
                services: vec![UART_SERVICE_UUID],
                characteristics: vec![
                    Self::characteristic(INBOUND_CHARACTERISTIC_UUID, CharPropFlags::NOTIFY),
                    Self::characteristic(
                        OUTBOUND_CHARACTERISTIC_UUID,
                        CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
                    ),
                ],
                connected: HashSet::new(),
                fail_scan: false,
                fail_connect: false,
                fail_discovery: false,
                fail_disconnect: false,
                failing_writes: HashSet::new(),
                write_count: 0,
                connect_latency: Duration::ZERO,
            }),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            notification_tx: Mutex::new(None),
        }
    }

    /// Build a characteristic under the UART service.
    pub fn characteristic(uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid: UART_SERVICE_UUID,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    /// Handle the mock uses for a peripheral advertising `name`.
    pub fn peripheral(name: &str) -> PeripheralHandle {
        PeripheralHandle::new(format!("MOCK-{}", name), Some(name.to_string()))
    }

    // === Scripting ===

    /// Set the service UUIDs peripherals report.
    pub fn set_services(&self, services: Vec<Uuid>) {
        self.state.lock().services = services;
    }

    /// Set the characteristics of the UART service.
    pub fn set_characteristics(&self, characteristics: Vec<Characteristic>) {
        self.state.lock().characteristics = characteristics;
    }

    /// Make `start_scan` fail.
    pub fn set_fail_scan(&self, fail: bool) {
        self.state.lock().fail_scan = fail;
    }

    /// Make `connect` fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Make service discovery fail.
    pub fn set_fail_discovery(&self, fail: bool) {
        self.state.lock().fail_discovery = fail;
    }

    /// Make `disconnect` report an error (the peripheral is still dropped).
    pub fn set_fail_disconnect(&self, fail: bool) {
        self.state.lock().fail_disconnect = fail;
    }

    /// Fail the `n`th write call (1-based, counted across the stack's lifetime).
    pub fn fail_write(&self, n: usize) {
        self.state.lock().failing_writes.insert(n);
    }

    /// Delay every `connect` by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.state.lock().connect_latency = latency;
    }

    // === Radio side ===

    /// Broadcast an advertisement for a peripheral named `name`.
    pub fn advertise(&self, name: &str) {
        self.emit(StackEvent::Advertisement(Self::peripheral(name)));
    }

    /// Toggle radio power.
    pub fn set_powered(&self, powered_on: bool) {
        {
            let mut state = self.state.lock();
            state.powered_on = powered_on;
            if !powered_on {
                state.scanning = false;
            }
        }
        self.emit(StackEvent::PowerChanged(powered_on));
    }

    /// End the scan as if the adapter gave up.
    pub fn end_scan(&self) {
        self.state.lock().scanning = false;
        self.emit(StackEvent::ScanStopped);
    }

    /// Drop a connection from the peripheral side.
    pub fn drop_connection(&self, name: &str) {
        let id = Self::peripheral(name).id().to_string();
        self.state.lock().connected.remove(&id);
        self.emit(StackEvent::Disconnected { id });
    }

    /// Send a notification on the inbound characteristic.
    pub fn notify(&self, data: &[u8]) {
        self.notify_on(INBOUND_CHARACTERISTIC_UUID, data);
    }

    /// Send a notification on an arbitrary characteristic.
    pub fn notify_on(&self, characteristic_uuid: Uuid, data: &[u8]) {
        if let Some(tx) = self.notification_tx.lock().as_ref() {
            let _ = tx.unbounded_send(NotificationEvent {
                characteristic_uuid,
                data: Bytes::copy_from_slice(data),
            });
        }
    }

    /// Emit a driver warning.
    pub fn warn(&self, message: &str) {
        self.emit(StackEvent::Warning(message.to_string()));
    }

    fn emit(&self, event: StackEvent) {
        trace!("Mock stack event: {:?}", event);
        let _ = self.event_tx.unbounded_send(event);
    }

    // === Inspection ===

    /// All calls made so far.
    pub fn calls(&self) -> Vec<StackCall> {
        self.state.lock().calls.clone()
    }

    /// Payloads of every write call, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                StackCall::Write { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of `connect` calls made.
    pub fn connect_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, StackCall::Connect(_)))
            .count()
    }

    /// Number of peripherals currently connected.
    pub fn connected_count(&self) -> usize {
        self.state.lock().connected.len()
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    fn record(&self, call: StackCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl BleStack for MockStack {
    async fn events(&self) -> Result<EventStream> {
        let rx = self
            .event_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("event stream already taken".to_string()))?;
        Ok(rx.boxed())
    }

    async fn is_powered_on(&self) -> bool {
        self.state.lock().powered_on
    }

    async fn start_scan(&self) -> Result<()> {
        self.record(StackCall::StartScan);
        let mut state = self.state.lock();
        if state.fail_scan || !state.powered_on {
            return Err(Error::ScanFailed {
                reason: "mock scan failure".to_string(),
            });
        }
        state.scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(StackCall::StopScan);
        self.state.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<()> {
        self.record(StackCall::Connect(peripheral.id().to_string()));

        let latency = self.state.lock().connect_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(Error::ConnectionFailed {
                reason: "mock connect failure".to_string(),
            });
        }
        state.connected.insert(peripheral.id().to_string());
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<()> {
        self.record(StackCall::Disconnect(peripheral.id().to_string()));
        let was_connected = {
            let mut state = self.state.lock();
            let was_connected = state.connected.remove(peripheral.id());
            if state.fail_disconnect {
                return Err(Error::DisconnectFailed {
                    reason: "mock disconnect failure".to_string(),
                });
            }
            was_connected
        };

        // The adapter reports every dropped link, requested or not.
        if was_connected {
            self.emit(StackEvent::Disconnected {
                id: peripheral.id().to_string(),
            });
        }
        Ok(())
    }

    async fn discover_services(&self, peripheral: &PeripheralHandle) -> Result<Vec<Uuid>> {
        self.record(StackCall::DiscoverServices(peripheral.id().to_string()));
        let state = self.state.lock();
        if state.fail_discovery {
            return Err(Error::DiscoveryFailed {
                reason: "mock discovery failure".to_string(),
            });
        }
        Ok(state.services.clone())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<Vec<Characteristic>> {
        self.record(StackCall::DiscoverCharacteristics(
            peripheral.id().to_string(),
            service,
        ));
        Ok(self.state.lock().characteristics.clone())
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &Characteristic,
    ) -> Result<()> {
        self.record(StackCall::Subscribe(
            peripheral.id().to_string(),
            characteristic.uuid,
        ));
        Ok(())
    }

    async fn notifications(&self, _peripheral: &PeripheralHandle) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded();
        *self.notification_tx.lock() = Some(tx);
        Ok(rx.boxed())
    }

    async fn write(
        &self,
        peripheral: &PeripheralHandle,
        _characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(StackCall::Write {
            id: peripheral.id().to_string(),
            data: data.to_vec(),
            write_type,
        });
        state.write_count += 1;

        if state.failing_writes.contains(&state.write_count) {
            return Err(Error::WriteFailed {
                reason: format!("mock failure on write {}", state.write_count),
            });
        }
        if !state.connected.contains(peripheral.id()) {
            return Err(Error::WriteFailed {
                reason: "peripheral not connected".to_string(),
            });
        }
        Ok(())
    }
}
