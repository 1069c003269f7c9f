//! The BLE stack port.
//!
//! [`BleStack`] is the narrow surface the link needs from a radio driver:
//! scanning, connecting, GATT discovery, writes and notifications. The
//! production implementation lives in [`crate::ble::btleplug_stack`]; tests
//! drive the link through [`crate::ble::mock::MockStack`].

use async_trait::async_trait;
use btleplug::api::{Characteristic, WriteType};
use bytes::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use uuid::Uuid;

use crate::error::Result;

/// Reference to an advertising or connected remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle {
    id: String,
    name: Option<String>,
}

impl PeripheralHandle {
    /// Create a handle from a stack identifier and the advertised local name.
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Stack-specific identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Advertised local name, if the peripheral sent one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl std::fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Adapter-level event reported by the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// Radio power toggled.
    PowerChanged(bool),
    /// The adapter stopped scanning on its own.
    ScanStopped,
    /// An advertisement was seen.
    Advertisement(PeripheralHandle),
    /// A peripheral dropped its connection.
    Disconnected {
        /// Identifier of the peripheral.
        id: String,
    },
    /// Non-fatal diagnostic from the driver.
    Warning(String),
}

/// Notification received from a characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// UUID of the characteristic that sent the notification.
    pub characteristic_uuid: Uuid,
    /// The notification data.
    pub data: Bytes,
}

/// Stream of adapter events.
pub type EventStream = Pin<Box<dyn Stream<Item = StackEvent> + Send>>;

/// Stream of notifications from one peripheral.
pub type NotificationStream = Pin<Box<dyn Stream<Item = NotificationEvent> + Send>>;

/// Operations the link performs against a BLE radio.
///
/// Every method may suspend; completion order between different calls is
/// not guaranteed, which is why the link tags results with an attempt id.
#[async_trait]
pub trait BleStack: Send + Sync + 'static {
    /// Open the adapter event stream. Called once per link.
    async fn events(&self) -> Result<EventStream>;

    /// Whether the radio is currently powered.
    async fn is_powered_on(&self) -> bool;

    /// Start an unfiltered scan.
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a peripheral.
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<()>;

    /// Disconnect from a peripheral.
    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<()>;

    /// Discover primary services, returning their UUIDs.
    async fn discover_services(&self, peripheral: &PeripheralHandle) -> Result<Vec<Uuid>>;

    /// List the characteristics of a discovered service.
    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<Vec<Characteristic>>;

    /// Enable notifications on a characteristic.
    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &Characteristic,
    ) -> Result<()>;

    /// Open the notification stream for a peripheral.
    async fn notifications(&self, peripheral: &PeripheralHandle) -> Result<NotificationStream>;

    /// Write a single packet.
    async fn write(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;
}
