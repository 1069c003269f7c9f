//! Error types for the ble-uart-bridge crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The link configuration is unusable.
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Description of what is wrong with the configuration.
        reason: String,
    },

    /// Scanning could not be started.
    #[error("Scan failed: {reason}")]
    ScanFailed {
        /// Description of why the scan failed.
        reason: String,
    },

    /// Failed to establish a connection to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Service discovery failed before the UART service could be located.
    #[error("Discovery failed: {reason}")]
    DiscoveryFailed {
        /// Description of why discovery failed.
        reason: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// A write to the outbound characteristic failed.
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// Description of why the write failed.
        reason: String,
    },

    /// The stack reported an error while disconnecting.
    #[error("Disconnect failed: {reason}")]
    DisconnectFailed {
        /// Description of why the disconnect failed.
        reason: String,
    },

    /// The link task has shut down.
    #[error("Link closed")]
    LinkClosed,

    /// The referenced peripheral is unknown to the stack.
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was looked up.
        identifier: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`], reported to the host alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// Bad or missing configuration.
    Configuration,
    /// Scan could not start.
    Scan,
    /// Connecting to the peripheral failed.
    Connect,
    /// Service or characteristic discovery failed.
    Discovery,
    /// A write failed.
    Write,
    /// Disconnecting reported an error.
    Disconnect,
    /// Anything else.
    Other,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::ScanFailed { .. } => ErrorKind::Scan,
            Self::ConnectionFailed { .. } | Self::PeripheralNotFound { .. } => ErrorKind::Connect,
            Self::DiscoveryFailed { .. }
            | Self::ServiceNotFound { .. }
            | Self::CharacteristicNotFound { .. } => ErrorKind::Discovery,
            Self::WriteFailed { .. } => ErrorKind::Write,
            Self::DisconnectFailed { .. } => ErrorKind::Disconnect,
            Self::Bluetooth(_)
            | Self::BluetoothUnavailable
            | Self::LinkClosed
            | Self::Internal(_) => ErrorKind::Other,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let err = Error::ConnectionFailed {
            reason: "timeout".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Connect);

        let err = Error::CharacteristicNotFound {
            uuid: "6e400003".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Discovery);
        assert_eq!(Error::LinkClosed.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_error_display() {
        let err = Error::WriteFailed {
            reason: "gatt busy".to_string(),
        };
        assert_eq!(err.to_string(), "Write failed: gatt busy");
    }
}
