//! Link configuration.

use crate::error::{Error, Result};

/// Default capacity of the link event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration supplied when a link is created.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkConfig {
    /// Advertised local name of the peripheral to connect to.
    pub device_name: String,
    /// Capacity of the broadcast channel carrying [`crate::LinkEvent`]s.
    #[cfg_attr(feature = "serde", serde(default = "default_event_capacity"))]
    pub event_capacity: usize,
}

#[cfg(feature = "serde")]
fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl LinkConfig {
    /// Create a configuration targeting `device_name`.
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Check that the configuration can be used to connect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the device name is blank or the
    /// event capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.device_name.trim().is_empty() {
            return Err(Error::Configuration {
                reason: "Please specify a device name".to_string(),
            });
        }

        if self.event_capacity == 0 {
            return Err(Error::Configuration {
                reason: "event_capacity must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = LinkConfig::new("BBC micro:bit [zogav]");
        assert!(config.validate().is_ok());
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn test_empty_name_rejected() {
        for name in ["", "   "] {
            let err = LinkConfig::new(name).validate().unwrap_err();
            assert!(matches!(err, Error::Configuration { .. }));
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = LinkConfig::new("myDevice").with_event_capacity(0);
        assert!(config.validate().is_err());
    }
}
