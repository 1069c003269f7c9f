//! BLE Service and Characteristic UUIDs.
//!
//! Contains the Nordic UART Service (NUS) identifiers and the link's
//! packet size limit.

use uuid::Uuid;

// UART Service (Nordic NUS - Nordic UART Service)
/// Nordic UART Service UUID.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// UART RX characteristic UUID (device-to-host notifications on the micro:bit profile).
pub const UART_RX_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
/// UART TX characteristic UUID (host-to-device writes on the micro:bit profile).
pub const UART_TX_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristic carrying data from the peripheral to the host.
pub const INBOUND_CHARACTERISTIC_UUID: Uuid = UART_RX_UUID;
/// Characteristic the host writes outbound data to.
pub const OUTBOUND_CHARACTERISTIC_UUID: Uuid = UART_TX_UUID;

/// Largest payload a single write may carry.
pub const MAX_CHUNK_SIZE: usize = 20;

/// Check if a service UUID is the UART service.
pub fn is_uart_service(uuid: &Uuid) -> bool {
    *uuid == UART_SERVICE_UUID
}
