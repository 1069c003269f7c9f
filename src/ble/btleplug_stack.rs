//! `btleplug` implementation of [`BleStack`].
//!
//! Wraps the first available adapter. Peripherals seen in advertisements are
//! cached by identifier so the link can refer to them with a
//! [`PeripheralHandle`].

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::stack::{
    BleStack, EventStream, NotificationEvent, NotificationStream, PeripheralHandle, StackEvent,
};
use crate::error::{Error, Result};

/// BLE stack backed by a `btleplug` adapter.
pub struct BtleplugStack {
    /// The BLE adapter in use.
    adapter: Adapter,
    /// Peripherals seen so far, by identifier.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
}

impl BtleplugStack {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn lookup(&self, handle: &PeripheralHandle) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(handle.id())
            .cloned()
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: handle.id().to_string(),
            })
    }

    /// Translate an adapter event.
    async fn translate(
        event: CentralEvent,
        adapter: &Adapter,
        peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
    ) -> Option<StackEvent> {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                Self::advertisement(adapter, id, peripherals).await
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                Some(StackEvent::Disconnected { id: id.to_string() })
            }
            CentralEvent::StateUpdate(state) => match state {
                CentralState::PoweredOn => Some(StackEvent::PowerChanged(true)),
                CentralState::PoweredOff => Some(StackEvent::PowerChanged(false)),
                other => Some(StackEvent::Warning(format!(
                    "Adapter in unexpected state: {:?}",
                    other
                ))),
            },
            _ => None,
        }
    }

    /// Resolve a peripheral id into a handle carrying its advertised name.
    async fn advertisement(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
    ) -> Option<StackEvent> {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let local_name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            _ => None,
        };

        let identifier = id.to_string();
        trace!("Advertisement from {} ({:?})", identifier, local_name);
        peripherals.write().insert(identifier.clone(), peripheral);

        Some(StackEvent::Advertisement(PeripheralHandle::new(
            identifier, local_name,
        )))
    }
}

#[async_trait]
impl BleStack for BtleplugStack {
    async fn events(&self) -> Result<EventStream> {
        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            async move { BtleplugStack::translate(event, &adapter, &peripherals).await }
        });

        Ok(stream.boxed())
    }

    async fn is_powered_on(&self) -> bool {
        match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOff) => false,
            Ok(state) => {
                debug!("Adapter state: {:?}", state);
                true
            }
            Err(e) => {
                warn!("Failed to read adapter state: {}", e);
                true
            }
        }
    }

    async fn start_scan(&self) -> Result<()> {
        info!("Starting BLE scan");
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Error::ScanFailed {
                reason: e.to_string(),
            })
    }

    async fn stop_scan(&self) -> Result<()> {
        info!("Stopping BLE scan");
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.lookup(handle)?;

        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
            return Ok(());
        }

        peripheral
            .connect()
            .await
            .map_err(|e| Error::ConnectionFailed {
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.lookup(handle)?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| Error::DisconnectFailed {
                reason: e.to_string(),
            })
    }

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<Vec<Uuid>> {
        let peripheral = self.lookup(handle)?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::DiscoveryFailed {
                reason: e.to_string(),
            })?;

        Ok(peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn discover_characteristics(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
    ) -> Result<Vec<Characteristic>> {
        // btleplug discovers characteristics together with services.
        let peripheral = self.lookup(handle)?;
        peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.into_iter().collect())
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: service.to_string(),
            })
    }

    async fn subscribe(
        &self,
        handle: &PeripheralHandle,
        characteristic: &Characteristic,
    ) -> Result<()> {
        let peripheral = self.lookup(handle)?;
        debug!(
            "Subscribing to {}, properties: {:?}",
            characteristic.uuid, characteristic.properties
        );
        peripheral
            .subscribe(characteristic)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn notifications(&self, handle: &PeripheralHandle) -> Result<NotificationStream> {
        let peripheral = self.lookup(handle)?;
        let notifications = peripheral.notifications().await.map_err(Error::Bluetooth)?;

        Ok(notifications
            .map(|notification| NotificationEvent {
                characteristic_uuid: notification.uuid,
                data: Bytes::from(notification.value),
            })
            .boxed())
    }

    async fn write(
        &self,
        handle: &PeripheralHandle,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let peripheral = self.lookup(handle)?;
        peripheral
            .write(characteristic, data, write_type)
            .await
            .map_err(|e| Error::WriteFailed {
                reason: e.to_string(),
            })?;

        trace!("Wrote {} bytes to characteristic {}", data.len(), characteristic.uuid);

        Ok(())
    }
}
