//! BLE communication module.
//!
//! This module defines the [`BleStack`] port the link drives, its `btleplug`
//! implementation, an in-memory stack for tests, and the UART service
//! identifiers and characteristic resolution.

pub mod btleplug_stack;
pub mod characteristics;
pub mod mock;
pub mod stack;
pub mod uuids;

pub use btleplug_stack::BtleplugStack;
pub use characteristics::{resolve_characteristics, Resolution, ResolvedCharacteristics};
pub use mock::{MockStack, StackCall};
pub use stack::{
    BleStack, EventStream, NotificationEvent, NotificationStream, PeripheralHandle, StackEvent,
};
pub use uuids::*;
