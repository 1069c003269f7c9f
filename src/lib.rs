// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-uart-bridge
//!
//! A cross-platform Rust library that connects to a single Bluetooth Low
//! Energy peripheral exposing the Nordic UART service and relays bytes
//! between it and a host application.
//!
//! ## Features
//!
//! - **Name-based discovery**: Scan and connect to the peripheral whose
//!   advertised name matches the configured one
//! - **Attempt tracking**: A new connect request supersedes the previous one;
//!   late results of abandoned attempts are ignored
//! - **Chunked writes**: Outbound payloads are split into 20-byte packets and
//!   written in order
//! - **Status reporting**: A colour/shape/text indicator describing the link
//! - **Testable core**: The connection logic is a pure state machine driven
//!   through the [`BleStack`] trait, with an in-memory [`MockStack`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_uart_bridge::{BtleplugStack, LinkConfig, LinkEvent, Result, UartLink};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let stack = Arc::new(BtleplugStack::new().await?);
//!     let link = UartLink::new(stack, LinkConfig::new("BBC micro:bit [zogav]")).await?;
//!     let mut events = link.subscribe();
//!
//!     link.connect()?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             LinkEvent::Status(status) if status.text == "Device ready" => {
//!                 link.send("hello\n")?;
//!             }
//!             LinkEvent::Data(data) => println!("Received {:?}", data),
//!             _ => {}
//!         }
//!     }
//!
//!     link.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and status types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod link;
pub mod protocol;
pub mod state_machine;
pub mod status;

// Re-exports for convenience
pub use config::LinkConfig;
pub use error::{Error, ErrorKind, Result};
pub use link::{CallbackHandle, LinkEvent, UartLink};

// Re-export commonly used types from submodules
pub use ble::{BleStack, BtleplugStack, MockStack, PeripheralHandle, StackEvent};
pub use protocol::{chunk_payload, Directive, MAX_CHUNK_SIZE};
pub use state_machine::{Action, AttemptId, ConnectionState, ConnectionStateMachine, Input};
pub use status::{LinkStatus, StatusFill, StatusShape};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<UartLink>();
        let _ = std::any::TypeId::of::<LinkConfig>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<ConnectionStateMachine>();
        let _ = std::any::TypeId::of::<LinkStatus>();
        let _ = std::any::TypeId::of::<MockStack>();
    }

    #[test]
    fn test_chunk_size() {
        assert_eq!(MAX_CHUNK_SIZE, 20);
    }
}
