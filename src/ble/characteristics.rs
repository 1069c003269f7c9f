//! GATT characteristic role resolution.
//!
//! Classifies the characteristics found under the UART service into the
//! inbound (notify) and outbound (write) roles and picks the write mode.

use btleplug::api::{CharPropFlags, Characteristic, WriteType};
use tracing::debug;

use crate::ble::uuids::{INBOUND_CHARACTERISTIC_UUID, OUTBOUND_CHARACTERISTIC_UUID};

/// Outcome of classifying a discovered characteristic set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Characteristic delivering device-to-host notifications.
    pub inbound: Option<Characteristic>,
    /// Characteristic accepting host-to-device writes.
    pub outbound: Option<Characteristic>,
}

impl Resolution {
    /// Check if both roles were found.
    pub fn is_complete(&self) -> bool {
        self.inbound.is_some() && self.outbound.is_some()
    }

    /// Pair the two roles, or `None` if either is missing.
    pub fn into_resolved(self) -> Option<ResolvedCharacteristics> {
        match (self.inbound, self.outbound) {
            (Some(inbound), Some(outbound)) => {
                let write_type = write_type_for(&outbound);
                Some(ResolvedCharacteristics {
                    inbound,
                    outbound,
                    write_type,
                })
            }
            _ => None,
        }
    }
}

/// Both UART characteristics plus the write mode chosen for this connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCharacteristics {
    /// Notify characteristic.
    pub inbound: Characteristic,
    /// Write characteristic.
    pub outbound: Characteristic,
    /// Write mode used for every outbound packet.
    pub write_type: WriteType,
}

/// Choose the write mode advertised by an outbound characteristic.
///
/// Write-without-response is used whenever the characteristic offers it.
pub fn write_type_for(characteristic: &Characteristic) -> WriteType {
    if characteristic
        .properties
        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
    {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}

/// Classify characteristics by UUID. Order does not matter and unrelated
/// characteristics are ignored.
pub fn resolve_characteristics<'a, I>(characteristics: I) -> Resolution
where
    I: IntoIterator<Item = &'a Characteristic>,
{
    let mut resolution = Resolution::default();

    for characteristic in characteristics {
        debug!(
            "Found characteristic: {} with properties {:?}",
            characteristic.uuid, characteristic.properties
        );

        if characteristic.uuid == INBOUND_CHARACTERISTIC_UUID {
            resolution.inbound = Some(characteristic.clone());
        } else if characteristic.uuid == OUTBOUND_CHARACTERISTIC_UUID {
            resolution.outbound = Some(characteristic.clone());
        }
    }

    resolution
}
