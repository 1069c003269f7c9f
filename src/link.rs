//! The UART link.
//!
//! [`UartLink`] owns one [`ConnectionStateMachine`] inside a single actor
//! task. Host directives, adapter events and completions of stack
//! operations all arrive on one channel and are applied one at a time, so
//! transitions never overlap. Long operations (connect, discovery) run in
//! spawned tasks and report back with the attempt they belong to; writes go
//! through one writer task so payloads never interleave.

use btleplug::api::{Characteristic, WriteType};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::stack::{BleStack, EventStream, PeripheralHandle, StackEvent};
use crate::config::LinkConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::Directive;
use crate::state_machine::{Action, AttemptId, ConnectionState, ConnectionStateMachine, Input};
use crate::status::LinkStatus;

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Something the link tells the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Payload received from the peripheral, unmodified.
    Data(Bytes),
    /// The status changed.
    Status(LinkStatus),
    /// An attempt or write failed.
    Error {
        /// Classification.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },
    /// Non-fatal diagnostic from the adapter.
    Warning(String),
}

impl From<StackEvent> for Input {
    fn from(event: StackEvent) -> Self {
        match event {
            StackEvent::PowerChanged(powered_on) => Input::PowerChanged { powered_on },
            StackEvent::ScanStopped => Input::ScanStopped,
            StackEvent::Advertisement(peripheral) => Input::Advertisement(peripheral),
            StackEvent::Disconnected { id } => Input::Disconnected { peripheral_id: id },
            StackEvent::Warning(message) => Input::Warning(message),
        }
    }
}

/// A connection to one peripheral exposing the UART service.
pub struct UartLink {
    /// Channel into the actor.
    input_tx: mpsc::UnboundedSender<Input>,
    /// Last state published by the actor.
    state: Arc<RwLock<ConnectionState>>,
    /// Last status published by the actor.
    status: Arc<RwLock<LinkStatus>>,
    /// Host-facing events.
    event_tx: broadcast::Sender<LinkEvent>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Actor task handle.
    actor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl UartLink {
    /// Start a link on `stack`.
    ///
    /// The link starts `Idle`; call [`connect`](Self::connect) to begin
    /// scanning. An invalid configuration is reported once and leaves the link
    /// unable to connect.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack's event stream cannot be opened.
    pub async fn new<S>(stack: Arc<S>, config: LinkConfig) -> Result<Self>
    where
        S: BleStack + ?Sized,
    {
        let events = stack.events().await?;
        let powered_on = stack.is_powered_on().await;

        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let state = Arc::new(RwLock::new(ConnectionState::Idle));
        let status = Arc::new(RwLock::new(LinkStatus::default()));
        let current_attempt = Arc::new(AtomicU64::new(0));

        let pump = tokio::spawn(pump_events(events, input_tx.clone()));
        let writer = tokio::spawn(run_writer(
            stack.clone(),
            writer_rx,
            input_tx.clone(),
            current_attempt.clone(),
        ));

        let actor = LinkActor {
            stack,
            machine: ConnectionStateMachine::new(&config),
            input_tx: input_tx.clone(),
            input_rx,
            backlog: VecDeque::new(),
            writer_tx,
            current_attempt,
            event_tx: event_tx.clone(),
            state: state.clone(),
            status: status.clone(),
            in_flight: None,
            listener: None,
            pump,
            writer,
        };

        info!("Starting UART link for \"{}\"", config.device_name);
        let handle = tokio::spawn(actor.run(powered_on));

        Ok(Self {
            input_tx,
            state,
            status,
            event_tx,
            callback_counter: AtomicU64::new(0),
            actor_handle: Mutex::new(Some(handle)),
        })
    }

    /// Scan for the configured device and connect, replacing any current attempt.
    pub fn connect(&self) -> Result<()> {
        self.directive(Directive::Connect)
    }

    /// Stop scanning and drop the connection.
    pub fn disconnect(&self) -> Result<()> {
        self.directive(Directive::Disconnect)
    }

    /// Write a payload to the peripheral. Dropped if the link is not ready.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.directive(Directive::Send(data.into()))
    }

    /// Hand the link a raw host message payload.
    pub fn submit(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.directive(Directive::from_payload(payload))
    }

    /// Queue a directive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LinkClosed`] after shutdown.
    pub fn directive(&self, directive: Directive) -> Result<()> {
        trace!("Directive: {}", directive);
        self.input_tx
            .send(Input::Directive(directive))
            .map_err(|_| Error::LinkClosed)
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if data can be exchanged.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Get the current status.
    pub fn status(&self) -> LinkStatus {
        self.status.read().clone()
    }

    /// Subscribe to link events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback for inbound data.
    pub fn on_data<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let LinkEvent::Data(data) = event {
                callback(data);
            }
        })
    }

    /// Register a callback for status changes.
    pub fn on_status<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(LinkStatus) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let LinkEvent::Status(status) = event {
                callback(status);
            }
        })
    }

    fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(LinkEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Callback {} lagged, skipped {} events", callback_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Stop scanning, disconnect and stop all background tasks.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.input_tx.send(Input::Shutdown);

        let handle = self.actor_handle.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Internal(format!("link task failed: {}", e)))?;
        }

        Ok(())
    }
}

impl Drop for UartLink {
    fn drop(&mut self) {
        let _ = self.input_tx.send(Input::Shutdown);
    }
}

/// One payload queued for the writer task.
struct WriteJob {
    attempt: AttemptId,
    peripheral: PeripheralHandle,
    characteristic: Characteristic,
    chunks: Vec<Bytes>,
    write_type: WriteType,
}

/// The single owner of the state machine.
struct LinkActor<S: BleStack + ?Sized> {
    stack: Arc<S>,
    machine: ConnectionStateMachine,
    input_tx: mpsc::UnboundedSender<Input>,
    input_rx: mpsc::UnboundedReceiver<Input>,
    /// Completions of operations run inline, applied before new input.
    backlog: VecDeque<Input>,
    writer_tx: mpsc::UnboundedSender<WriteJob>,
    current_attempt: Arc<AtomicU64>,
    event_tx: broadcast::Sender<LinkEvent>,
    state: Arc<RwLock<ConnectionState>>,
    status: Arc<RwLock<LinkStatus>>,
    /// Spawned connect or discovery operation.
    in_flight: Option<JoinHandle<()>>,
    /// Notification forwarder for the current connection.
    listener: Option<JoinHandle<()>>,
    pump: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl<S: BleStack + ?Sized> LinkActor<S> {
    async fn run(mut self, powered_on: bool) {
        let actions = self.machine.start();
        self.apply(actions).await;
        self.backlog.push_back(Input::PowerChanged { powered_on });

        loop {
            let input = match self.backlog.pop_front() {
                Some(input) => input,
                None => match self.input_rx.recv().await {
                    Some(input) => input,
                    None => break,
                },
            };

            let shutdown = matches!(input, Input::Shutdown);
            let actions = self.machine.handle(input);
            self.apply(actions).await;

            if shutdown {
                // Surface disconnect errors raised during teardown.
                while let Some(input) = self.backlog.pop_front() {
                    let actions = self.machine.handle(input);
                    self.apply(actions).await;
                }
                break;
            }
        }

        self.release();
        self.pump.abort();
        self.writer.abort();
        debug!("Link task ended");
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        *self.state.write() = self.machine.state();
        self.current_attempt
            .store(self.machine.attempt().get(), Ordering::SeqCst);

        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::StartScan { attempt } => {
                let result = self.stack.start_scan().await;
                self.backlog.push_back(Input::ScanStarted { attempt, result });
            }
            Action::StopScan => {
                if let Err(e) = self.stack.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            Action::Connect {
                attempt,
                peripheral,
            } => {
                let stack = self.stack.clone();
                let tx = self.input_tx.clone();
                self.spawn_op(async move {
                    let result = stack.connect(&peripheral).await;
                    let _ = tx.send(Input::Connected {
                        attempt,
                        peripheral,
                        result,
                    });
                });
            }
            Action::DiscoverServices {
                attempt,
                peripheral,
            } => {
                let stack = self.stack.clone();
                let tx = self.input_tx.clone();
                self.spawn_op(async move {
                    let result = stack.discover_services(&peripheral).await;
                    let _ = tx.send(Input::ServicesDiscovered { attempt, result });
                });
            }
            Action::DiscoverCharacteristics {
                attempt,
                peripheral,
                service,
            } => {
                let stack = self.stack.clone();
                let tx = self.input_tx.clone();
                self.spawn_op(async move {
                    let result = stack.discover_characteristics(&peripheral, service).await;
                    let _ = tx.send(Input::CharacteristicsDiscovered { attempt, result });
                });
            }
            Action::Subscribe {
                attempt,
                peripheral,
                characteristic,
            } => {
                let result = self.listen(attempt, &peripheral, &characteristic).await;
                self.backlog.push_back(Input::Subscribed { attempt, result });
            }
            Action::Write {
                attempt,
                peripheral,
                characteristic,
                chunks,
                write_type,
            } => {
                let job = WriteJob {
                    attempt,
                    peripheral,
                    characteristic,
                    chunks,
                    write_type,
                };
                if self.writer_tx.send(job).is_err() {
                    warn!("Writer task is gone, dropping payload");
                }
            }
            Action::Disconnect { peripheral } => {
                info!("Disconnecting from {}", peripheral);
                let result = self.stack.disconnect(&peripheral).await;
                self.backlog
                    .push_back(Input::DisconnectCompleted { peripheral, result });
            }
            Action::Release => self.release(),
            Action::Forward(data) => {
                debug!("Received: {:02X?}", &data[..]);
                let _ = self.event_tx.send(LinkEvent::Data(data));
            }
            Action::Status(status) => {
                info!("Status: {}", status);
                *self.status.write() = status.clone();
                let _ = self.event_tx.send(LinkEvent::Status(status));
            }
            Action::Report(e) => {
                error!("{}", e);
                let _ = self.event_tx.send(LinkEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
            Action::Warn(message) => {
                warn!("{}", message);
                let _ = self.event_tx.send(LinkEvent::Warning(message));
            }
        }
    }

    /// Open the notification stream, enable notifications and forward inbound
    /// packets tagged with `attempt`.
    async fn listen(
        &mut self,
        attempt: AttemptId,
        peripheral: &PeripheralHandle,
        characteristic: &Characteristic,
    ) -> Result<()> {
        let mut notifications = self.stack.notifications(peripheral).await?;
        self.stack.subscribe(peripheral, characteristic).await?;

        let tx = self.input_tx.clone();
        let inbound = characteristic.uuid;

        let handle = tokio::spawn(async move {
            debug!("Notification listener started for attempt {}", attempt);
            while let Some(notification) = notifications.next().await {
                if notification.characteristic_uuid != inbound {
                    continue;
                }
                if tx
                    .send(Input::Notification {
                        attempt,
                        data: notification.data,
                    })
                    .is_err()
                {
                    break;
                }
            }
            debug!("Notification listener stopped for attempt {}", attempt);
        });

        if let Some(old) = self.listener.replace(handle) {
            old.abort();
        }

        Ok(())
    }

    fn spawn_op<F>(&mut self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.in_flight.replace(tokio::spawn(op)) {
            if !previous.is_finished() {
                debug!("Replacing an unfinished operation");
                previous.abort();
            }
        }
    }

    /// Drop listeners and abandon in-flight operations.
    fn release(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(op) = self.in_flight.take() {
            op.abort();
        }
    }
}

/// Forward adapter events into the actor.
async fn pump_events(mut events: EventStream, input_tx: mpsc::UnboundedSender<Input>) {
    while let Some(event) = events.next().await {
        if input_tx.send(event.into()).is_err() {
            break;
        }
    }
    debug!("Adapter event stream ended");
}

/// Write queued payloads chunk by chunk, in order.
///
/// Every chunk is awaited before the next is issued. A failed chunk is
/// reported and the rest of the payload is still sent; a payload whose
/// attempt has been superseded is abandoned.
async fn run_writer<S>(
    stack: Arc<S>,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    input_tx: mpsc::UnboundedSender<Input>,
    current_attempt: Arc<AtomicU64>,
) where
    S: BleStack + ?Sized,
{
    while let Some(job) = jobs.recv().await {
        let total = job.chunks.len();
        let mut clean = true;

        for (index, chunk) in job.chunks.iter().enumerate() {
            if current_attempt.load(Ordering::SeqCst) != job.attempt.get() {
                debug!("Abandoning write for superseded attempt {}", job.attempt);
                clean = false;
                break;
            }

            debug!("Writing chunk {}/{}: {:02X?}", index + 1, total, &chunk[..]);
            if let Err(e) = stack
                .write(&job.peripheral, &job.characteristic, chunk, job.write_type)
                .await
            {
                clean = false;
                let _ = input_tx.send(Input::WriteCompleted {
                    attempt: job.attempt,
                    result: Err(e),
                });
            }
        }

        if clean {
            let _ = input_tx.send(Input::WriteCompleted {
                attempt: job.attempt,
                result: Ok(()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{MockStack, StackCall};
    use crate::ble::uuids::{INBOUND_CHARACTERISTIC_UUID, OUTBOUND_CHARACTERISTIC_UUID};
    use btleplug::api::CharPropFlags;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_stack_event_conversion() {
        let input: Input = StackEvent::Disconnected {
            id: "AA".to_string(),
        }
        .into();
        assert!(matches!(input, Input::Disconnected { peripheral_id } if peripheral_id == "AA"));

        let input: Input = StackEvent::PowerChanged(false).into();
        assert!(matches!(input, Input::PowerChanged { powered_on: false }));
    }

    #[tokio::test]
    async fn test_on_data_callback() {
        let stack = Arc::new(MockStack::new());
        let link = UartLink::new(stack.clone(), LinkConfig::new("myDevice"))
            .await
            .unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let _handle = link.on_data(move |data| {
            counter.fetch_add(data.len(), Ordering::SeqCst);
        });

        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        stack.advertise("myDevice");
        wait_until(|| {
            stack
                .calls()
                .iter()
                .any(|c| matches!(c, StackCall::Subscribe(..)))
        })
        .await;

        stack.notify(b"abc");
        wait_until(|| received.load(Ordering::SeqCst) == 3).await;

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_callback_handle_unregister() {
        let stack = Arc::new(MockStack::new());
        let link = UartLink::new(stack, LinkConfig::new("myDevice"))
            .await
            .unwrap();

        let handle = link.on_status(|_| {});
        let id = handle.id();
        handle.unregister();
        assert_eq!(link.on_status(|_| {}).id(), id + 1);
    }

    #[tokio::test]
    async fn test_directive_after_shutdown() {
        let stack = Arc::new(MockStack::new());
        let link = UartLink::new(stack, LinkConfig::new("myDevice"))
            .await
            .unwrap();

        link.shutdown().await.unwrap();
        assert!(matches!(link.connect(), Err(Error::LinkClosed)));
    }

    async fn ready_link(stack: &Arc<MockStack>) -> UartLink {
        let link = UartLink::new(stack.clone(), LinkConfig::new("myDevice"))
            .await
            .unwrap();
        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        stack.advertise("myDevice");
        wait_until(|| subscribed(stack)).await;
        wait_until(|| link.is_ready()).await;
        link
    }

    fn subscribed(stack: &MockStack) -> bool {
        stack
            .calls()
            .iter()
            .any(|c| matches!(c, StackCall::Subscribe(..)))
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<LinkEvent>, pred: F) -> LinkEvent
    where
        F: Fn(&LinkEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received in time")
    }

    #[tokio::test]
    async fn test_connects_to_named_device_only() {
        let stack = Arc::new(MockStack::new());
        let link = UartLink::new(stack.clone(), LinkConfig::new("myDevice"))
            .await
            .unwrap();

        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        assert_eq!(link.state(), ConnectionState::Scanning);

        stack.advertise("otherDevice");
        stack.advertise("myDevice");
        wait_until(|| link.is_ready()).await;

        assert_eq!(stack.connect_calls(), 1);
        assert!(stack
            .calls()
            .contains(&StackCall::Connect("MOCK-myDevice".to_string())));
        assert!(!stack.is_scanning());
        wait_until(|| link.status().text == "Device ready").await;

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_payload_is_chunked_in_order() {
        let stack = Arc::new(MockStack::new());
        let link = ready_link(&stack).await;

        let payload: Vec<u8> = (0..45).collect();
        link.send(payload.clone()).unwrap();
        wait_until(|| stack.writes().len() == 3).await;

        let writes = stack.writes();
        assert_eq!(
            writes.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![20, 20, 5]
        );
        assert_eq!(writes.concat(), payload);
        assert!(stack.calls().iter().all(|c| match c {
            StackCall::Write { write_type, .. } => *write_type == WriteType::WithoutResponse,
            _ => true,
        }));

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_payload() {
        let stack = Arc::new(MockStack::new());
        let link = ready_link(&stack).await;
        let mut events = link.subscribe();

        stack.fail_write(2);
        link.send(vec![0xABu8; 45]).unwrap();

        let event = next_matching(&mut events, |e| matches!(e, LinkEvent::Error { .. })).await;
        assert!(matches!(
            event,
            LinkEvent::Error {
                kind: ErrorKind::Write,
                ..
            }
        ));
        wait_until(|| stack.writes().len() == 3).await;
        assert!(link.is_ready());

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_before_ready_is_dropped() {
        let stack = Arc::new(MockStack::new());
        let link = UartLink::new(stack.clone(), LinkConfig::new("myDevice"))
            .await
            .unwrap();

        link.send("early").unwrap();
        link.shutdown().await.unwrap();
        assert!(stack.writes().is_empty());
    }

    #[tokio::test]
    async fn test_submit_parses_directives() {
        let stack = Arc::new(MockStack::new());
        let link = UartLink::new(stack.clone(), LinkConfig::new("myDevice"))
            .await
            .unwrap();

        link.submit("Connect").unwrap();
        wait_until(|| stack.is_scanning()).await;

        link.submit("Disconnect").unwrap();
        wait_until(|| link.state() == ConnectionState::Idle).await;
        assert!(!stack.is_scanning());

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_while_scanning() {
        let stack = Arc::new(MockStack::new());
        let link = UartLink::new(stack.clone(), LinkConfig::new("myDevice"))
            .await
            .unwrap();

        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        link.disconnect().unwrap();
        wait_until(|| link.state() == ConnectionState::Idle).await;

        stack.advertise("myDevice");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stack.connect_calls(), 0);
        assert_eq!(link.state(), ConnectionState::Idle);

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications_are_forwarded() {
        let stack = Arc::new(MockStack::new());
        let link = ready_link(&stack).await;
        let mut events = link.subscribe();

        stack.notify(&[0x01, 0x02]);

        let event = next_matching(&mut events, |e| matches!(e, LinkEvent::Data(_))).await;
        assert_eq!(event, LinkEvent::Data(Bytes::from_static(&[0x01, 0x02])));

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_supersedes_pending_attempt() {
        let stack = Arc::new(MockStack::new());
        stack.set_connect_latency(Duration::from_millis(200));
        let link = UartLink::new(stack.clone(), LinkConfig::new("myDevice"))
            .await
            .unwrap();

        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        stack.advertise("myDevice");
        wait_until(|| stack.connect_calls() == 1).await;
        assert_eq!(link.state(), ConnectionState::Connecting);

        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        stack.advertise("myDevice");
        wait_until(|| link.is_ready()).await;

        assert_eq!(stack.connect_calls(), 2);
        assert_eq!(stack.connected_count(), 1);

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_peripheral_drop_returns_to_idle() {
        let stack = Arc::new(MockStack::new());
        let link = ready_link(&stack).await;

        stack.drop_connection("myDevice");
        wait_until(|| link.status().text == "BLE powered on").await;
        assert_eq!(link.state(), ConnectionState::Idle);

        link.send("lost").unwrap();
        link.shutdown().await.unwrap();
        assert!(stack.writes().is_empty());
    }

    #[tokio::test]
    async fn test_scan_deferred_until_powered() {
        let stack = Arc::new(MockStack::new());
        stack.set_powered(false);
        let link = UartLink::new(stack.clone(), LinkConfig::new("myDevice"))
            .await
            .unwrap();

        link.connect().unwrap();
        wait_until(|| link.state() == ConnectionState::Scanning).await;
        assert!(!stack.calls().contains(&StackCall::StartScan));

        stack.set_powered(true);
        wait_until(|| stack.is_scanning()).await;

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_never_connects() {
        let stack = Arc::new(MockStack::new());
        let link = UartLink::new(stack.clone(), LinkConfig::new(""))
            .await
            .unwrap();

        link.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(link.state(), ConnectionState::Idle);
        assert!(stack.calls().is_empty());

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let stack = Arc::new(MockStack::new());
        let link = ready_link(&stack).await;

        link.shutdown().await.unwrap();

        assert!(stack
            .calls()
            .contains(&StackCall::Disconnect("MOCK-myDevice".to_string())));
        assert_eq!(stack.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_adapter_warning_is_surfaced() {
        let stack = Arc::new(MockStack::new());
        let link = UartLink::new(stack.clone(), LinkConfig::new("myDevice"))
            .await
            .unwrap();
        let mut events = link.subscribe();

        stack.warn("adapter resetting");

        let event = next_matching(&mut events, |e| matches!(e, LinkEvent::Warning(_))).await;
        assert_eq!(event, LinkEvent::Warning("adapter resetting".to_string()));

        link.shutdown().await.unwrap();
    }

    async fn error_kind(rx: &mut broadcast::Receiver<LinkEvent>) -> ErrorKind {
        match next_matching(rx, |e| matches!(e, LinkEvent::Error { .. })).await {
            LinkEvent::Error { kind, .. } => kind,
            _ => unreachable!(),
        }
    }

    async fn started_link(stack: &Arc<MockStack>) -> (UartLink, broadcast::Receiver<LinkEvent>) {
        let link = UartLink::new(stack.clone(), LinkConfig::new("myDevice"))
            .await
            .unwrap();
        let events = link.subscribe();
        (link, events)
    }

    #[tokio::test]
    async fn test_scan_failure_reported() {
        let stack = Arc::new(MockStack::new());
        stack.set_fail_scan(true);
        let (link, mut events) = started_link(&stack).await;

        link.connect().unwrap();
        assert_eq!(error_kind(&mut events).await, ErrorKind::Scan);
        wait_until(|| link.state() == ConnectionState::Idle).await;
        assert!(!stack.is_scanning());

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_reported() {
        let stack = Arc::new(MockStack::new());
        stack.set_fail_connect(true);
        let (link, mut events) = started_link(&stack).await;

        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        stack.advertise("myDevice");

        assert_eq!(error_kind(&mut events).await, ErrorKind::Connect);
        wait_until(|| link.state() == ConnectionState::Idle).await;
        assert_eq!(stack.connected_count(), 0);

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_failure_leaves_link_unready() {
        let stack = Arc::new(MockStack::new());
        stack.set_fail_discovery(true);
        let (link, mut events) = started_link(&stack).await;

        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        stack.advertise("myDevice");

        assert_eq!(error_kind(&mut events).await, ErrorKind::Discovery);
        assert_eq!(link.state(), ConnectionState::DiscoveringServices);
        assert_eq!(stack.connected_count(), 1);

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_service_reported() {
        let stack = Arc::new(MockStack::new());
        stack.set_services(vec![]);
        let (link, mut events) = started_link(&stack).await;

        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        stack.advertise("myDevice");

        let event = next_matching(&mut events, |e| matches!(e, LinkEvent::Error { .. })).await;
        assert!(matches!(
            event,
            LinkEvent::Error { kind: ErrorKind::Discovery, ref message } if message.contains("6e400001")
        ));
        assert_eq!(link.state(), ConnectionState::DiscoveringServices);

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_characteristic_reported() {
        let stack = Arc::new(MockStack::new());
        stack.set_characteristics(vec![MockStack::characteristic(
            INBOUND_CHARACTERISTIC_UUID,
            CharPropFlags::NOTIFY,
        )]);
        let (link, mut events) = started_link(&stack).await;

        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        stack.advertise("myDevice");

        assert_eq!(error_kind(&mut events).await, ErrorKind::Discovery);
        assert_eq!(link.state(), ConnectionState::DiscoveringCharacteristics);
        assert!(!subscribed(&stack));

        link.send("never").unwrap();
        link.shutdown().await.unwrap();
        assert!(stack.writes().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_failure_reported() {
        let stack = Arc::new(MockStack::new());
        let link = ready_link(&stack).await;
        let mut events = link.subscribe();
        stack.set_fail_disconnect(true);

        link.disconnect().unwrap();

        assert_eq!(error_kind(&mut events).await, ErrorKind::Disconnect);
        assert_eq!(link.state(), ConnectionState::Idle);

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_ended_by_adapter() {
        let stack = Arc::new(MockStack::new());
        let (link, _events) = started_link(&stack).await;

        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        stack.end_scan();

        wait_until(|| link.status().text == "Scanning finished").await;
        assert_eq!(link.state(), ConnectionState::Scanning);

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_only_inbound_notifications_forwarded() {
        let stack = Arc::new(MockStack::new());
        let link = ready_link(&stack).await;
        let mut events = link.subscribe();

        stack.notify_on(OUTBOUND_CHARACTERISTIC_UUID, b"echo");
        stack.notify(b"real");

        let event = next_matching(&mut events, |e| matches!(e, LinkEvent::Data(_))).await;
        assert_eq!(event, LinkEvent::Data(Bytes::from_static(b"real")));

        link.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_keeps_tracking_real_drops() {
        let stack = Arc::new(MockStack::new());
        let link = ready_link(&stack).await;

        // The adapter reports the link the reconnect tears down.
        link.connect().unwrap();
        wait_until(|| stack.is_scanning()).await;
        stack.advertise("myDevice");
        wait_until(|| link.is_ready() && stack.connect_calls() == 2).await;
        assert_eq!(stack.connected_count(), 1);

        stack.drop_connection("myDevice");
        wait_until(|| link.state() == ConnectionState::Idle).await;

        link.shutdown().await.unwrap();
    }
}
