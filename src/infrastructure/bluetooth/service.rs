//! Bluetooth Service Module
//!
//! [`RobotLink`] is the session object for one robot: it owns the scan
//! list, the selected device, the connection state machine, the framing
//! and command/response state, and the servo calibration table. Cloning a
//! `RobotLink` yields another handle to the same session.
//!
//! Inbound notification chunks are queued by the transport callback and
//! drained by the poller task, which is the only place frames are
//! assembled and attributed to commands.

use crate::domain::calibration::{
    adjust_range, is_calibratable, parse_calibration_report, MotorAngleTable,
};
use crate::domain::models::{
    AppEvent, CommandToken, ConnectionState, DeviceHandle, DiscoveredDevice, Frame,
    MessageSeverity, StatusMessage,
};
use crate::domain::settings::LinkSettings;
use crate::error::{LinkError, Result};
use crate::infrastructure::bluetooth::{
    command_stack::CommandStack,
    connection::{BleConnection, ChannelPair, ConnectionConfig},
    framing::FrameAssembler,
    poller::Poller,
    protocol::DeviceCommand,
    scanner::BleScanner,
    transport::{DataCallback, ScanFilter, Transport},
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked with every frame attributed to a command.
pub type MessageCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

// A raw chunk, the time it arrived and the send epoch it arrived in.
type Inbound = (Instant, u64, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct Exchange {
    assembler: FrameAssembler,
    stack: CommandStack,
    // Resolved by the next attributed frame while a request() is waiting
    waiter: Option<oneshot::Sender<Frame>>,
}

impl Exchange {
    fn waiter_busy(&self) -> bool {
        self.waiter.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// State shared with the poller task.
#[derive(Clone)]
struct Dispatcher {
    exchange: Arc<Mutex<Exchange>>,
    motors: Arc<Mutex<MotorAngleTable>>,
    on_message: Arc<Mutex<Option<MessageCallback>>>,
    // Bumped under the exchange lock by every discarding send; chunks from
    // an older epoch are stale
    send_epoch: Arc<AtomicU64>,
}

impl Dispatcher {
    fn tick(&self, inbound: &mut mpsc::UnboundedReceiver<Inbound>, now: Instant) {
        let (frame, command) = {
            let mut exchange = lock(&self.exchange);
            let current = self.send_epoch.load(Ordering::SeqCst);
            while let Ok((at, epoch, bytes)) = inbound.try_recv() {
                if epoch < current {
                    debug!("Discarding {} stale bytes", bytes.len());
                    continue;
                }
                exchange.assembler.on_chunk_received(&bytes, at);
            }

            let Some(frame) = exchange.assembler.check_idle(now) else {
                return;
            };
            let Some(token) = exchange.stack.attach_response(&frame) else {
                return;
            };
            let command = token.command.clone();
            if let Some(waiter) = exchange.waiter.take() {
                let _ = waiter.send(frame.clone());
            }
            (frame, command)
        };

        info!("Response to {:?}: {:?}", command, frame.as_str());

        if DeviceCommand::is_calibration_query(&command) {
            if let Some(table) = parse_calibration_report(frame.as_str()) {
                debug!("Calibration offsets updated: {:?}", table);
                *lock(&self.motors) = table;
            }
        }

        let callback = lock(&self.on_message).clone();
        if let Some(callback) = callback {
            callback(&frame);
        }
    }
}

/// One command on its way to the robot.
struct Outgoing<'a> {
    text: &'a str,
    // Installed atomically with the push; only one may be outstanding
    waiter: Option<oneshot::Sender<Frame>>,
    // Forget earlier commands before pushing this one
    new_context: bool,
}

impl<'a> Outgoing<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            waiter: None,
            new_context: false,
        }
    }
}

struct LinkState {
    state: ConnectionState,
    device: Option<DiscoveredDevice>,
    channels: Option<ChannelPair>,
    // State to return to when a scan stops
    pre_scan: Option<ConnectionState>,
    // Bumped by every connect and disconnect; stale connect attempts
    // must not touch the state
    generation: u64,
}

struct Inner {
    transport: Arc<dyn Transport>,
    settings: LinkSettings,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    scanner: tokio::sync::Mutex<BleScanner>,
    link: Mutex<LinkState>,
    poller: Mutex<Poller>,
    dispatcher: Dispatcher,
}

/// Session with one robot over a BLE serial bridge.
#[derive(Clone)]
pub struct RobotLink {
    inner: Arc<Inner>,
}

impl RobotLink {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: LinkSettings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let dispatcher = Dispatcher {
            exchange: Arc::new(Mutex::new(Exchange {
                assembler: FrameAssembler::new(settings.idle_timeout()),
                stack: CommandStack::new(settings.command_history),
                waiter: None,
            })),
            motors: Arc::new(Mutex::new(MotorAngleTable::default())),
            on_message: Arc::new(Mutex::new(None)),
            send_epoch: Arc::new(AtomicU64::new(0)),
        };

        Self {
            inner: Arc::new(Inner {
                transport,
                scanner: tokio::sync::Mutex::new(BleScanner::new(event_sender.clone())),
                settings,
                event_sender,
                link: Mutex::new(LinkState {
                    state: ConnectionState::Idle,
                    device: None,
                    channels: None,
                    pre_scan: None,
                    generation: 0,
                }),
                poller: Mutex::new(Poller::new()),
                dispatcher,
            }),
        }
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.link).state
    }

    pub fn selected_device(&self) -> Option<DiscoveredDevice> {
        lock(&self.inner.link).device.clone()
    }

    pub fn channels(&self) -> Option<ChannelPair> {
        lock(&self.inner.link).channels.clone()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.inner.poller).is_running()
    }

    /// Register the callback that receives every attributed frame.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        *lock(&self.inner.dispatcher.on_message) = Some(Arc::new(callback));
    }

    // Scanning and selection

    pub async fn start_scan(&self) -> Result<()> {
        let current = self.state();
        if current.is_connecting() {
            return Err(LinkError::AlreadyConnecting);
        }

        let mut scanner = self.inner.scanner.lock().await;
        scanner
            .start(self.inner.transport.as_ref(), ScanFilter::default())
            .await?;
        // A live link stays usable while scanning
        if current != ConnectionState::Ready {
            if current != ConnectionState::Scanning {
                lock(&self.inner.link).pre_scan = Some(current);
            }
            self.set_state(ConnectionState::Scanning);
        }
        Ok(())
    }

    /// Stop scanning and return the names of the devices found. The state
    /// returns to what it was before the scan.
    pub async fn stop_scan(&self) -> Result<Vec<String>> {
        let names = {
            let mut scanner = self.inner.scanner.lock().await;
            scanner.stop(self.inner.transport.as_ref()).await?
        };
        let restored = {
            let mut link = lock(&self.inner.link);
            let previous = link.pre_scan.take();
            (link.state == ConnectionState::Scanning)
                .then(|| previous.unwrap_or(ConnectionState::Idle))
        };
        if let Some(state) = restored {
            self.set_state(state);
        }
        Ok(names)
    }

    pub async fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.scanner.lock().await.devices().to_vec()
    }

    pub async fn select_device(&self, index: usize) -> Result<DiscoveredDevice> {
        let device = self
            .inner
            .scanner
            .lock()
            .await
            .find_by_index(index)
            .cloned()
            .ok_or_else(|| LinkError::DeviceNotFound(format!("#{}", index)))?;
        self.select(device).await
    }

    pub async fn select_device_by_name(&self, name: &str) -> Result<DiscoveredDevice> {
        let device = self
            .inner
            .scanner
            .lock()
            .await
            .find_by_name(name)
            .cloned()
            .ok_or_else(|| LinkError::DeviceNotFound(name.to_string()))?;
        self.select(device).await
    }

    /// Select the robot's serial bridge by its configured name.
    pub async fn select_preferred(&self) -> Result<DiscoveredDevice> {
        let name = self.inner.settings.preferred_device_name.clone();
        self.select_device_by_name(&name).await
    }

    async fn select(&self, device: DiscoveredDevice) -> Result<DiscoveredDevice> {
        let (state, previous) = {
            let link = lock(&self.inner.link);
            (link.state, link.device.clone())
        };
        if state.is_connecting() {
            return Err(LinkError::AlreadyConnecting);
        }

        if let Some(previous) = previous {
            if previous.handle == device.handle {
                if state == ConnectionState::Ready {
                    return Ok(device);
                }
            } else if self.inner.transport.is_linked(&previous.handle).await {
                info!(
                    "Dropping link to {} before switching to {}",
                    previous.handle, device.handle
                );
                self.teardown();
                if let Err(e) = self.inner.transport.disconnect(&previous.handle).await {
                    warn!("Disconnecting {} failed: {}", previous.handle, e);
                }
            }
        }

        {
            let mut link = lock(&self.inner.link);
            link.device = Some(device.clone());
            link.channels = None;
        }
        info!(
            "Selected device {} ({})",
            device.name.as_deref().unwrap_or("unnamed"),
            device.handle
        );
        self.set_state(ConnectionState::DeviceSelected);
        Ok(device)
    }

    // Connection lifecycle

    /// Connect to the selected device and wait until it is ready for
    /// commands or the attempt has failed.
    pub async fn establish(&self) -> Result<()> {
        let (device, generation) = {
            let mut link = lock(&self.inner.link);
            let device = link.device.clone().ok_or(LinkError::NoDeviceSelected)?;
            if link.state.is_connecting() {
                return Err(LinkError::AlreadyConnecting);
            }
            if link.state == ConnectionState::Ready {
                return Ok(());
            }
            link.generation += 1;
            link.channels = None;
            link.state = ConnectionState::Connecting;
            (device, link.generation)
        };
        self.emit_state(ConnectionState::Connecting);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let epoch = self.inner.dispatcher.send_epoch.clone();
        let on_data: DataCallback = Arc::new(move |bytes: Vec<u8>| {
            let _ = inbound_tx.send((clock(), epoch.load(Ordering::SeqCst), bytes));
        });
        let report = |state: ConnectionState| {
            self.transition_if_current(generation, state);
        };

        let connection = BleConnection::new(
            self.inner.transport.as_ref(),
            self.inner.event_sender.clone(),
            ConnectionConfig::from(&self.inner.settings),
        );
        let result = connection.connect(&device.handle, on_data, &report).await;

        let pair = match result {
            Ok(pair) => pair,
            Err(e) => {
                if !self.transition_if_current(generation, ConnectionState::Failed) {
                    return Err(LinkError::ConnectCancelled);
                }
                warn!("Connecting to {} failed: {}", device.handle, e);
                return Err(e);
            }
        };

        let current = {
            let mut link = lock(&self.inner.link);
            let current = link.generation == generation;
            if current {
                link.channels = Some(pair);
            }
            current
        };
        if !current {
            let _ = self.inner.transport.disconnect(&device.handle).await;
            return Err(LinkError::ConnectCancelled);
        }

        self.start_polling(inbound_rx);
        self.inner.transport.clear_receive_buffer(&device.handle).await;

        if !self.transition_if_current(generation, ConnectionState::Ready) {
            self.teardown();
            return Err(LinkError::ConnectCancelled);
        }

        let name = device.name.as_deref().unwrap_or("device");
        info!("Link to {} ready", name);
        self.send_log(
            &format!("Connected to {}, listening for messages...", name),
            MessageSeverity::Success,
        );
        Ok(())
    }

    /// Run [`RobotLink::establish`] in the background and report the
    /// outcome through exactly one of the callbacks.
    pub fn connect<S, F>(&self, on_success: S, on_failure: F) -> JoinHandle<()>
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce(LinkError) + Send + 'static,
    {
        let link = self.clone();
        tokio::spawn(async move {
            match link.establish().await {
                Ok(()) => on_success(),
                Err(e) => on_failure(e),
            }
        })
    }

    /// Stop listening and drop the link. Safe in any state; a connect
    /// attempt in progress is abandoned.
    pub async fn disconnect(&self) -> Result<()> {
        let device = {
            let mut link = lock(&self.inner.link);
            link.generation += 1;
            link.channels = None;
            link.device.clone()
        };
        self.teardown();

        let Some(device) = device else {
            return Ok(());
        };
        info!("Disconnecting from {}", device.handle);
        let result = self.inner.transport.disconnect(&device.handle).await;
        self.set_state(ConnectionState::Disconnected);
        self.send_log("Disconnected from device", MessageSeverity::Info);
        result.map_err(Into::into)
    }

    /// [`RobotLink::disconnect`], then `on_success` once the link is down.
    pub async fn disconnect_with<F: FnOnce()>(&self, on_success: F) -> Result<()> {
        self.disconnect().await?;
        on_success();
        Ok(())
    }

    fn start_polling(&self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        let dispatcher = self.inner.dispatcher.clone();
        let mut poller = lock(&self.inner.poller);
        poller.stop();
        poller.start(self.inner.settings.poll_interval(), move || {
            dispatcher.tick(&mut inbound, clock());
        });
    }

    // Stop the poller and abandon whatever was in flight.
    fn teardown(&self) {
        lock(&self.inner.poller).stop();
        let mut exchange = lock(&self.inner.dispatcher.exchange);
        exchange.waiter = None;
        exchange.assembler.clear();
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut link = lock(&self.inner.link);
            std::mem::replace(&mut link.state, state) != state
        };
        if changed {
            self.emit_state(state);
        }
    }

    fn transition_if_current(&self, generation: u64, state: ConnectionState) -> bool {
        let changed = {
            let mut link = lock(&self.inner.link);
            if link.generation != generation {
                return false;
            }
            std::mem::replace(&mut link.state, state) != state
        };
        if changed {
            self.emit_state(state);
        }
        true
    }

    fn emit_state(&self, state: ConnectionState) {
        debug!("Link state -> {}", state);
        let _ = self
            .inner
            .event_sender
            .send(AppEvent::ConnectionStatus(state));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.inner.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }

    // Commands

    fn ready_endpoints(&self) -> Result<(DeviceHandle, ChannelPair)> {
        let link = lock(&self.inner.link);
        match (link.state, &link.device, &link.channels) {
            (ConnectionState::Ready, Some(device), Some(channels)) => {
                Ok((device.handle.clone(), channels.clone()))
            }
            (state, ..) => Err(LinkError::NotReady(state)),
        }
    }

    /// Send a command without waiting for its response. The response, once
    /// framed, is attached to this command.
    pub async fn send_command(&self, text: &str) -> Result<()> {
        let endpoints = self.ready_endpoints()?;
        self.write_command(endpoints, Outgoing::new(text)).await
    }

    pub async fn send_device_command(&self, command: &DeviceCommand) -> Result<()> {
        self.send_command(&command.text()).await
    }

    /// Send a command and wait for the frame that answers it. Other sends
    /// are refused until this one is answered or times out.
    pub async fn request(&self, text: &str) -> Result<String> {
        let endpoints = self.ready_endpoints()?;
        let (tx, rx) = oneshot::channel();
        let outgoing = Outgoing {
            waiter: Some(tx),
            ..Outgoing::new(text)
        };
        self.write_command(endpoints, outgoing).await?;

        match tokio::time::timeout(self.inner.settings.response_timeout(), rx).await {
            Ok(Ok(frame)) => Ok(frame.into_string()),
            Ok(Err(_)) => Err(LinkError::ResponseAbandoned),
            Err(_) => {
                let mut exchange = lock(&self.inner.dispatcher.exchange);
                if !exchange.waiter_busy() {
                    exchange.waiter = None;
                }
                warn!("No response to {:?}", text);
                Err(LinkError::ResponseTimeout)
            }
        }
    }

    async fn write_command(
        &self,
        endpoints: (DeviceHandle, ChannelPair),
        outgoing: Outgoing<'_>,
    ) -> Result<()> {
        let (device, channels) = endpoints;
        let text = outgoing.text;
        let awaits_reply = outgoing.waiter.is_some();
        {
            let mut exchange = lock(&self.inner.dispatcher.exchange);
            if exchange.waiter_busy() {
                return Err(LinkError::CommandInFlight);
            }
            if outgoing.new_context {
                exchange.stack.clear();
            }
            exchange.waiter = outgoing.waiter;
            if self.inner.settings.discard_partial_on_send {
                exchange.assembler.clear();
                self.inner.dispatcher.send_epoch.fetch_add(1, Ordering::SeqCst);
            }
            exchange.stack.push_command(text);
        }

        info!("Sending command {:?}", text);
        if text.len() > self.inner.settings.packet_size {
            warn!(
                "Command is {} bytes, longer than one {}-byte packet",
                text.len(),
                self.inner.settings.packet_size
            );
        }
        let written = self
            .inner
            .transport
            .write(&device, &channels.write, text.as_bytes())
            .await;
        if let Err(e) = written {
            warn!("Writing {:?} failed: {}", text, e);
            let mut exchange = lock(&self.inner.dispatcher.exchange);
            if exchange.stack.top().is_some_and(|t| t.command == text && !t.is_answered()) {
                exchange.stack.pop();
            }
            if awaits_reply {
                exchange.waiter = None;
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Response attached to the most recent command, empty if none.
    pub fn peek_top_response(&self) -> String {
        lock(&self.inner.dispatcher.exchange)
            .stack
            .peek_top_response()
            .to_string()
    }

    /// Remembered commands, oldest first.
    pub fn history(&self) -> Vec<CommandToken> {
        lock(&self.inner.dispatcher.exchange)
            .stack
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        lock(&self.inner.dispatcher.exchange).stack.clear();
    }

    // Calibration

    pub fn get_motor_angle(&self, index: usize) -> Result<i32> {
        lock(&self.inner.dispatcher.motors)
            .get(index)
            .ok_or(LinkError::InvalidServo(index))
    }

    pub fn set_motor_angle(&self, index: usize, angle: i32) -> Result<()> {
        lock(&self.inner.dispatcher.motors)
            .set(index, angle)
            .ok_or(LinkError::InvalidServo(index))
    }

    pub fn motor_angles(&self) -> MotorAngleTable {
        *lock(&self.inner.dispatcher.motors)
    }

    pub fn load_motor_angles(&self, table: MotorAngleTable) {
        *lock(&self.inner.dispatcher.motors) = table;
    }

    /// Enter calibration: forget earlier commands and ask the robot for its
    /// offsets. The reply refreshes the angle table.
    pub async fn begin_calibration(&self) -> Result<()> {
        let endpoints = self.ready_endpoints()?;
        let text = DeviceCommand::Calibrate.text();
        let outgoing = Outgoing {
            new_context: true,
            ..Outgoing::new(&text)
        };
        self.write_command(endpoints, outgoing).await
    }

    /// Move one servo's offset by `delta` degrees. Returns the new offset.
    pub async fn nudge_servo(&self, servo: usize, delta: i32) -> Result<i32> {
        if !is_calibratable(servo) {
            return Err(LinkError::InvalidServo(servo));
        }
        if !adjust_range().contains(&delta) {
            return Err(LinkError::InvalidAdjustment(delta));
        }

        let angle = self
            .get_motor_angle(servo)?
            .checked_add(delta)
            .ok_or(LinkError::InvalidAdjustment(delta))?;
        self.send_device_command(&DeviceCommand::SetOffset { servo, angle })
            .await?;
        self.set_motor_angle(servo, angle)?;
        Ok(angle)
    }

    pub async fn reset_servo(&self, servo: usize) -> Result<()> {
        if !is_calibratable(servo) {
            return Err(LinkError::InvalidServo(servo));
        }
        self.send_device_command(&DeviceCommand::SetOffset { servo, angle: 0 })
            .await?;
        self.set_motor_angle(servo, 0)
    }

    /// Ask the robot to persist its current offsets.
    pub async fn save_calibration(&self) -> Result<()> {
        self.send_device_command(&DeviceCommand::Save).await
    }
}
