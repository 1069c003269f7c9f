//! Host-facing link status.
//!
//! The status is derived entirely from a [`LinkSnapshot`]; reporting the same
//! snapshot twice yields the same [`LinkStatus`].

use crate::state_machine::ConnectionState;

/// Power-on, idle link.
pub const TEXT_POWERED_ON: &str = "BLE powered on";
/// Radio is off.
pub const TEXT_POWERED_OFF: &str = "BLE powered off";
/// Scan in progress.
pub const TEXT_SCANNING: &str = "Scanning...";
/// Scan ended without a match.
pub const TEXT_SCAN_FINISHED: &str = "Scanning finished";
/// Target advertised, connecting.
pub const TEXT_DEVICE_FOUND: &str = "Device found";
/// Connected, discovering GATT layout.
pub const TEXT_DEVICE_CONNECTED: &str = "Device connected";
/// Both characteristics resolved.
pub const TEXT_DEVICE_READY: &str = "Device ready";

/// Status severity, rendered by hosts as an indicator color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StatusFill {
    /// Radio unavailable.
    Red,
    /// Radio available, no device yet.
    Blue,
    /// Device involved.
    Green,
}

/// Status indicator shape: ring while something is pending, dot when settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StatusShape {
    /// Transitional.
    Ring,
    /// Settled.
    Dot,
}

impl std::fmt::Display for StatusFill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Red => write!(f, "red"),
            Self::Blue => write!(f, "blue"),
            Self::Green => write!(f, "green"),
        }
    }
}

impl std::fmt::Display for StatusShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ring => write!(f, "ring"),
            Self::Dot => write!(f, "dot"),
        }
    }
}

/// Status shown to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkStatus {
    /// Severity.
    pub fill: StatusFill,
    /// Indicator shape.
    pub shape: StatusShape,
    /// Human-readable text.
    pub text: String,
}

impl LinkStatus {
    fn new(fill: StatusFill, shape: StatusShape, text: &str) -> Self {
        Self {
            fill,
            shape,
            text: text.to_string(),
        }
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        LinkSnapshot::default().status()
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} {}] {}", self.fill, self.shape, self.text)
    }
}

/// Inputs the status is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkSnapshot {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Radio power.
    pub powered_on: bool,
    /// A scan is running.
    pub scanning: bool,
    /// A matching peripheral is held but not yet ready.
    pub device_found: bool,
}

impl LinkSnapshot {
    /// Map the snapshot to a status.
    pub fn status(&self) -> LinkStatus {
        use StatusFill::*;
        use StatusShape::*;

        if !self.powered_on {
            return LinkStatus::new(Red, Ring, TEXT_POWERED_OFF);
        }

        match self.state {
            ConnectionState::Ready => LinkStatus::new(Green, Dot, TEXT_DEVICE_READY),
            ConnectionState::DiscoveringServices | ConnectionState::DiscoveringCharacteristics => {
                LinkStatus::new(Green, Ring, TEXT_DEVICE_CONNECTED)
            }
            ConnectionState::Connecting if self.device_found => {
                LinkStatus::new(Green, Ring, TEXT_DEVICE_FOUND)
            }
            _ if self.scanning => LinkStatus::new(Blue, Ring, TEXT_SCANNING),
            ConnectionState::Scanning | ConnectionState::Connecting => {
                LinkStatus::new(Blue, Dot, TEXT_SCAN_FINISHED)
            }
            ConnectionState::Idle => LinkStatus::new(Blue, Ring, TEXT_POWERED_ON),
        }
    }
}
