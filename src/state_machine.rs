//! Connection lifecycle state machine.
//!
//! [`ConnectionStateMachine::handle`] is a pure transition function: it takes
//! one [`Input`] (a host directive or a stack completion/event), updates the
//! machine and returns the [`Action`]s the caller must perform. It never
//! touches the radio itself, so every transition is testable without hardware.
//!
//! Every asynchronous operation the machine requests carries the
//! [`AttemptId`] that was current when it was issued. Completions for any
//! other attempt are stale and ignored, so a callback from a superseded
//! connection can never resurrect its handles.

use btleplug::api::{Characteristic, WriteType};
use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{resolve_characteristics, ResolvedCharacteristics};
use crate::ble::stack::PeripheralHandle;
use crate::ble::uuids::{
    is_uart_service, INBOUND_CHARACTERISTIC_UUID, MAX_CHUNK_SIZE, OUTBOUND_CHARACTERISTIC_UUID,
    UART_SERVICE_UUID,
};
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::protocol::{chunk_payload, Directive};
use crate::status::{LinkSnapshot, LinkStatus};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Looking for the configured device.
    Scanning,
    /// Connecting to the matched peripheral.
    Connecting,
    /// Connected, looking for the UART service.
    DiscoveringServices,
    /// Service found, looking for the UART characteristics.
    DiscoveringCharacteristics,
    /// Both characteristics resolved; data flows.
    Ready,
}

impl ConnectionState {
    /// Check if data can be exchanged.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::DiscoveringCharacteristics => write!(f, "DiscoveringCharacteristics"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Identity of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AttemptId(u64);

impl AttemptId {
    /// Raw counter value.
    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something the machine reacts to.
#[derive(Debug)]
pub enum Input {
    /// Request from the host.
    Directive(Directive),
    /// Radio power toggled.
    PowerChanged {
        /// New power state.
        powered_on: bool,
    },
    /// A [`Action::StartScan`] finished.
    ScanStarted {
        /// Attempt that requested the scan.
        attempt: AttemptId,
        /// Outcome.
        result: Result<()>,
    },
    /// The stack stopped scanning on its own.
    ScanStopped,
    /// An advertisement was seen.
    Advertisement(PeripheralHandle),
    /// A [`Action::Connect`] finished.
    Connected {
        /// Attempt that requested the connection.
        attempt: AttemptId,
        /// Peripheral that was connected to.
        peripheral: PeripheralHandle,
        /// Outcome.
        result: Result<()>,
    },
    /// A [`Action::DiscoverServices`] finished.
    ServicesDiscovered {
        /// Attempt that requested discovery.
        attempt: AttemptId,
        /// Service UUIDs found.
        result: Result<Vec<Uuid>>,
    },
    /// A [`Action::DiscoverCharacteristics`] finished.
    CharacteristicsDiscovered {
        /// Attempt that requested discovery.
        attempt: AttemptId,
        /// Characteristics found under the UART service.
        result: Result<Vec<Characteristic>>,
    },
    /// A [`Action::Subscribe`] finished.
    Subscribed {
        /// Attempt that requested the subscription.
        attempt: AttemptId,
        /// Outcome.
        result: Result<()>,
    },
    /// Data arrived on the inbound characteristic.
    Notification {
        /// Attempt whose subscription delivered it.
        attempt: AttemptId,
        /// Raw payload.
        data: Bytes,
    },
    /// A [`Action::Write`] reported an outcome.
    WriteCompleted {
        /// Attempt that issued the write.
        attempt: AttemptId,
        /// Outcome.
        result: Result<()>,
    },
    /// A peripheral dropped its connection.
    Disconnected {
        /// Identifier of the peripheral.
        peripheral_id: String,
    },
    /// A requested [`Action::Disconnect`] finished.
    DisconnectCompleted {
        /// Peripheral that was disconnected.
        peripheral: PeripheralHandle,
        /// Outcome.
        result: Result<()>,
    },
    /// Diagnostic from the stack.
    Warning(String),
    /// Release everything; the link is going away.
    Shutdown,
}

/// Work the caller must perform on behalf of the machine.
#[derive(Debug)]
pub enum Action {
    /// Start an unfiltered scan, then feed back [`Input::ScanStarted`].
    StartScan {
        /// Attempt to tag the result with.
        attempt: AttemptId,
    },
    /// Stop scanning.
    StopScan,
    /// Connect, then feed back [`Input::Connected`].
    Connect {
        /// Attempt to tag the result with.
        attempt: AttemptId,
        /// Peripheral to connect to.
        peripheral: PeripheralHandle,
    },
    /// Discover services, then feed back [`Input::ServicesDiscovered`].
    DiscoverServices {
        /// Attempt to tag the result with.
        attempt: AttemptId,
        /// Connected peripheral.
        peripheral: PeripheralHandle,
    },
    /// Discover characteristics, then feed back [`Input::CharacteristicsDiscovered`].
    DiscoverCharacteristics {
        /// Attempt to tag the result with.
        attempt: AttemptId,
        /// Connected peripheral.
        peripheral: PeripheralHandle,
        /// Service to look in.
        service: Uuid,
    },
    /// Enable notifications and forward them as [`Input::Notification`].
    Subscribe {
        /// Attempt to tag notifications with.
        attempt: AttemptId,
        /// Connected peripheral.
        peripheral: PeripheralHandle,
        /// Inbound characteristic.
        characteristic: Characteristic,
    },
    /// Write the chunks in order.
    Write {
        /// Attempt to tag failures with.
        attempt: AttemptId,
        /// Connected peripheral.
        peripheral: PeripheralHandle,
        /// Outbound characteristic.
        characteristic: Characteristic,
        /// Segments, each at most [`MAX_CHUNK_SIZE`] bytes.
        chunks: Vec<Bytes>,
        /// Write mode.
        write_type: WriteType,
    },
    /// Disconnect, then feed back [`Input::DisconnectCompleted`].
    Disconnect {
        /// Peripheral to drop.
        peripheral: PeripheralHandle,
    },
    /// Drop notification listeners and abandon in-flight operations.
    Release,
    /// Deliver inbound data to the host.
    Forward(Bytes),
    /// Publish a new status.
    Status(LinkStatus),
    /// Report an error to the host.
    Report(Error),
    /// Relay a warning to the host.
    Warn(String),
}

/// The connection lifecycle state machine.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    /// Advertised name to accept.
    target_name: String,
    /// Configuration error, if any. A misconfigured machine never connects.
    config_error: Option<String>,
    /// Current state.
    state: ConnectionState,
    /// Current attempt.
    attempt: AttemptId,
    /// Radio power.
    powered_on: bool,
    /// A scan has been requested and not stopped.
    scanning: bool,
    /// A scan is wanted but the radio is off.
    scan_pending: bool,
    /// Matched peripheral.
    peripheral: Option<PeripheralHandle>,
    /// Resolved characteristics; present exactly when Ready.
    characteristics: Option<ResolvedCharacteristics>,
    /// Peripherals we asked to disconnect whose disconnect event is still due.
    pending_disconnects: Vec<String>,
    /// Last status handed out.
    last_status: Option<LinkStatus>,
}

impl ConnectionStateMachine {
    /// Create a machine for `config`. The radio is assumed off until told otherwise.
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            target_name: config.device_name.clone(),
            config_error: config.validate().err().map(|e| e.to_string()),
            state: ConnectionState::Idle,
            attempt: AttemptId::default(),
            powered_on: false,
            scanning: false,
            scan_pending: false,
            peripheral: None,
            characteristics: None,
            pending_disconnects: Vec::new(),
            last_status: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current attempt.
    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    /// Matched peripheral, if any.
    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.peripheral.as_ref()
    }

    /// Resolved characteristics, present only when Ready.
    pub fn characteristics(&self) -> Option<&ResolvedCharacteristics> {
        self.characteristics.as_ref()
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Inputs to the status reporter.
    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            state: self.state,
            powered_on: self.powered_on,
            scanning: self.scanning,
            device_found: self.peripheral.is_some() && !self.state.is_ready(),
        }
    }

    /// Actions to perform once when the link starts: the configuration error
    /// (if any) and the initial status.
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();

        if let Some(reason) = &self.config_error {
            actions.push(Action::Report(Error::Configuration {
                reason: reason.clone(),
            }));
        }

        self.push_status(&mut actions);
        actions
    }

    /// Apply one input and return the resulting actions.
    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let mut actions = Vec::new();
        let before = self.state;

        match input {
            Input::Directive(Directive::Connect) => self.on_connect(&mut actions),
            Input::Directive(Directive::Disconnect) => self.on_disconnect(&mut actions),
            Input::Directive(Directive::Send(data)) => self.on_send(data, &mut actions),
            Input::PowerChanged { powered_on } => self.on_power(powered_on, &mut actions),
            Input::ScanStarted { attempt, result } => {
                self.on_scan_started(attempt, result, &mut actions)
            }
            Input::ScanStopped => {
                if self.scanning {
                    info!("Scan stopped by the adapter");
                    self.scanning = false;
                }
            }
            Input::Advertisement(peripheral) => self.on_advertisement(peripheral, &mut actions),
            Input::Connected {
                attempt,
                peripheral,
                result,
            } => self.on_connected(attempt, peripheral, result, &mut actions),
            Input::ServicesDiscovered { attempt, result } => {
                self.on_services(attempt, result, &mut actions)
            }
            Input::CharacteristicsDiscovered { attempt, result } => {
                self.on_characteristics(attempt, result, &mut actions)
            }
            Input::Subscribed { attempt, result } => {
                self.on_subscribed(attempt, result, &mut actions)
            }
            Input::Notification { attempt, data } => {
                if attempt == self.attempt && self.state.is_ready() {
                    trace!("Received {} bytes: {:02X?}", data.len(), &data[..]);
                    actions.push(Action::Forward(data));
                } else {
                    trace!("Dropping notification from attempt {}", attempt);
                }
            }
            Input::WriteCompleted { attempt, result } => match result {
                Ok(()) => trace!("Write completed for attempt {}", attempt),
                Err(e) if attempt == self.attempt => {
                    actions.push(Action::Report(as_write_error(e)));
                }
                Err(e) => debug!("Ignoring write failure from attempt {}: {}", attempt, e),
            },
            Input::Disconnected { peripheral_id } => {
                self.on_disconnected(&peripheral_id, &mut actions)
            }
            Input::DisconnectCompleted { peripheral, result } => match result {
                Ok(()) => debug!("Disconnected from {}", peripheral),
                Err(e) => actions.push(Action::Report(Error::DisconnectFailed {
                    reason: format!("{}: {}", peripheral, e),
                })),
            },
            Input::Warning(message) => actions.push(Action::Warn(message)),
            Input::Shutdown => {
                info!("Shutting down link");
                self.teardown(&mut actions);
                self.attempt = self.attempt.next();
                self.state = ConnectionState::Idle;
            }
        }

        if before != self.state {
            debug!("Connection state changed: {} -> {}", before, self.state);
        }

        self.push_status(&mut actions);
        actions
    }

    fn on_connect(&mut self, actions: &mut Vec<Action>) {
        if let Some(reason) = &self.config_error {
            warn!("Ignoring Connect: {}", reason);
            return;
        }

        self.teardown(actions);
        self.attempt = self.attempt.next();
        self.state = ConnectionState::Scanning;

        if self.powered_on {
            info!(
                "Scanning for \"{}\" (attempt {})",
                self.target_name, self.attempt
            );
            self.scanning = true;
            actions.push(Action::StartScan {
                attempt: self.attempt,
            });
        } else {
            info!("Radio is powered off, scan deferred");
            self.scan_pending = true;
        }
    }

    fn on_disconnect(&mut self, actions: &mut Vec<Action>) {
        if self.state == ConnectionState::Idle && self.peripheral.is_none() && !self.scanning {
            debug!("Disconnect while idle, nothing to do");
            return;
        }

        info!("Disconnecting");
        self.teardown(actions);
        self.attempt = self.attempt.next();
        self.state = ConnectionState::Idle;
    }

    fn on_send(&mut self, data: Bytes, actions: &mut Vec<Action>) {
        let (peripheral, characteristics) = match (&self.peripheral, &self.characteristics) {
            (Some(p), Some(c)) if self.state.is_ready() => (p, c),
            _ => {
                debug!(
                    "Dropping {} byte payload, link is {}",
                    data.len(),
                    self.state
                );
                return;
            }
        };

        let chunks = chunk_payload(&data, MAX_CHUNK_SIZE);
        if chunks.is_empty() {
            return;
        }

        debug!("Writing {} bytes in {} chunks", data.len(), chunks.len());
        actions.push(Action::Write {
            attempt: self.attempt,
            peripheral: peripheral.clone(),
            characteristic: characteristics.outbound.clone(),
            chunks,
            write_type: characteristics.write_type,
        });
    }

    fn on_power(&mut self, powered_on: bool, actions: &mut Vec<Action>) {
        if self.powered_on == powered_on {
            return;
        }

        info!(
            "Radio powered {}",
            if powered_on { "on" } else { "off" }
        );
        self.powered_on = powered_on;

        if powered_on {
            if self.scan_pending && self.state == ConnectionState::Scanning {
                self.scan_pending = false;
                self.scanning = true;
                actions.push(Action::StartScan {
                    attempt: self.attempt,
                });
            }
        } else if self.scanning {
            self.scanning = false;
            self.scan_pending = self.state == ConnectionState::Scanning;
        }
    }

    fn on_scan_started(&mut self, attempt: AttemptId, result: Result<()>, actions: &mut Vec<Action>) {
        if attempt != self.attempt {
            trace!("Ignoring scan result from attempt {}", attempt);
            return;
        }

        match result {
            Ok(()) => info!("Started scanning"),
            Err(e) => {
                self.scanning = false;
                if self.state == ConnectionState::Scanning {
                    self.state = ConnectionState::Idle;
                }
                actions.push(Action::Report(match e {
                    e @ Error::ScanFailed { .. } => e,
                    e => Error::ScanFailed {
                        reason: e.to_string(),
                    },
                }));
            }
        }
    }

    fn on_advertisement(&mut self, peripheral: PeripheralHandle, actions: &mut Vec<Action>) {
        if self.state != ConnectionState::Scanning {
            return;
        }

        if peripheral.name() != Some(self.target_name.as_str()) {
            trace!("Ignoring {}", peripheral);
            return;
        }

        info!("Found {}", peripheral);
        if self.scanning {
            self.scanning = false;
            actions.push(Action::StopScan);
        }
        self.scan_pending = false;

        self.peripheral = Some(peripheral.clone());
        self.state = ConnectionState::Connecting;
        actions.push(Action::Connect {
            attempt: self.attempt,
            peripheral,
        });
    }

    fn on_connected(
        &mut self,
        attempt: AttemptId,
        peripheral: PeripheralHandle,
        result: Result<()>,
        actions: &mut Vec<Action>,
    ) {
        if attempt != self.attempt || self.state != ConnectionState::Connecting {
            // A superseded connect that still succeeded would leak a link.
            if result.is_ok() && self.peripheral.as_ref() != Some(&peripheral) {
                debug!("Dropping stale connection to {}", peripheral);
                self.pending_disconnects.push(peripheral.id().to_string());
                actions.push(Action::Disconnect { peripheral });
            }
            return;
        }

        match result {
            Ok(()) => {
                info!("Connected to {}", peripheral);
                // Disconnect events owed to an earlier link have been delivered by now.
                self.pending_disconnects.retain(|id| id != peripheral.id());
                self.state = ConnectionState::DiscoveringServices;
                actions.push(Action::DiscoverServices {
                    attempt: self.attempt,
                    peripheral,
                });
            }
            Err(e) => {
                self.peripheral = None;
                self.state = ConnectionState::Idle;
                actions.push(Action::Report(match e {
                    e @ Error::ConnectionFailed { .. } => e,
                    e => Error::ConnectionFailed {
                        reason: e.to_string(),
                    },
                }));
            }
        }
    }

    fn on_services(&mut self, attempt: AttemptId, result: Result<Vec<Uuid>>, actions: &mut Vec<Action>) {
        if attempt != self.attempt || self.state != ConnectionState::DiscoveringServices {
            trace!("Ignoring service discovery from attempt {}", attempt);
            return;
        }

        let peripheral = match &self.peripheral {
            Some(p) => p.clone(),
            None => return,
        };

        match result {
            Ok(services) => {
                debug!("Discovered {} services", services.len());
                if services.iter().any(is_uart_service) {
                    info!("Found a UART service");
                    self.state = ConnectionState::DiscoveringCharacteristics;
                    actions.push(Action::DiscoverCharacteristics {
                        attempt: self.attempt,
                        peripheral,
                        service: UART_SERVICE_UUID,
                    });
                } else {
                    actions.push(Action::Report(Error::ServiceNotFound {
                        uuid: UART_SERVICE_UUID.to_string(),
                    }));
                }
            }
            Err(e) => actions.push(Action::Report(as_discovery_error(e))),
        }
    }

    fn on_characteristics(
        &mut self,
        attempt: AttemptId,
        result: Result<Vec<Characteristic>>,
        actions: &mut Vec<Action>,
    ) {
        if attempt != self.attempt || self.state != ConnectionState::DiscoveringCharacteristics {
            trace!("Ignoring characteristic discovery from attempt {}", attempt);
            return;
        }

        let peripheral = match &self.peripheral {
            Some(p) => p.clone(),
            None => return,
        };

        let characteristics = match result {
            Ok(c) => c,
            Err(e) => {
                actions.push(Action::Report(as_discovery_error(e)));
                return;
            }
        };

        let resolution = resolve_characteristics(&characteristics);
        let missing = if resolution.inbound.is_none() {
            Some(INBOUND_CHARACTERISTIC_UUID)
        } else if resolution.outbound.is_none() {
            Some(OUTBOUND_CHARACTERISTIC_UUID)
        } else {
            None
        };

        match resolution.into_resolved() {
            Some(resolved) => {
                info!(
                    "Device ready ({:?} on {})",
                    resolved.write_type, resolved.outbound.uuid
                );
                actions.push(Action::Subscribe {
                    attempt: self.attempt,
                    peripheral,
                    characteristic: resolved.inbound.clone(),
                });
                self.characteristics = Some(resolved);
                self.state = ConnectionState::Ready;
            }
            None => {
                if let Some(uuid) = missing {
                    actions.push(Action::Report(Error::CharacteristicNotFound {
                        uuid: uuid.to_string(),
                    }));
                }
            }
        }
    }

    fn on_subscribed(&mut self, attempt: AttemptId, result: Result<()>, actions: &mut Vec<Action>) {
        if attempt != self.attempt || !self.state.is_ready() {
            return;
        }

        match result {
            Ok(()) => debug!("Notifications armed"),
            Err(e) => {
                self.characteristics = None;
                self.state = ConnectionState::DiscoveringCharacteristics;
                actions.push(Action::Release);
                actions.push(Action::Report(Error::DiscoveryFailed {
                    reason: format!("Failed to enable notifications: {}", e),
                }));
            }
        }
    }

    fn on_disconnected(&mut self, peripheral_id: &str, actions: &mut Vec<Action>) {
        if let Some(pos) = self
            .pending_disconnects
            .iter()
            .position(|id| id == peripheral_id)
        {
            debug!("Requested disconnect of {} completed", peripheral_id);
            self.pending_disconnects.remove(pos);
            return;
        }

        let matches = self
            .peripheral
            .as_ref()
            .map(|p| p.id() == peripheral_id)
            .unwrap_or(false);

        if self.state == ConnectionState::Idle || !matches {
            trace!("Ignoring disconnect of {}", peripheral_id);
            return;
        }

        info!("Peripheral {} disconnected", peripheral_id);
        self.peripheral = None;
        self.characteristics = None;
        self.scanning = false;
        self.scan_pending = false;
        self.attempt = self.attempt.next();
        self.state = ConnectionState::Idle;
        actions.push(Action::Release);
    }

    /// Stop the scan, drop the peripheral and clear handles.
    fn teardown(&mut self, actions: &mut Vec<Action>) {
        if self.scanning {
            self.scanning = false;
            actions.push(Action::StopScan);
        }
        self.scan_pending = false;
        self.characteristics = None;

        if let Some(peripheral) = self.peripheral.take() {
            self.pending_disconnects.push(peripheral.id().to_string());
            actions.push(Action::Release);
            actions.push(Action::Disconnect { peripheral });
        } else if self.state != ConnectionState::Idle {
            actions.push(Action::Release);
        }
    }

    fn push_status(&mut self, actions: &mut Vec<Action>) {
        let status = self.snapshot().status();
        if self.last_status.as_ref() != Some(&status) {
            self.last_status = Some(status.clone());
            actions.push(Action::Status(status));
        }
    }
}

fn as_discovery_error(error: Error) -> Error {
    match error {
        e @ (Error::DiscoveryFailed { .. }
        | Error::ServiceNotFound { .. }
        | Error::CharacteristicNotFound { .. }) => e,
        e => Error::DiscoveryFailed {
            reason: e.to_string(),
        },
    }
}

fn as_write_error(error: Error) -> Error {
    match error {
        e @ Error::WriteFailed { .. } => e,
        e => Error::WriteFailed {
            reason: e.to_string(),
        },
    }
}
