//! In-process stand-in for the robot and its BLE serial bridge.
//!
//! Behaves like the firmware console: replies are written back as a burst
//! of 20-byte notifications terminated by `\r\n`, with tab-separated
//! fields. Link-up latency, the characteristic list and subscribe failures
//! are configurable so every connection path can be exercised without a
//! radio.

use crate::domain::calibration::MOTOR_COUNT;
use crate::domain::models::{DeviceHandle, DiscoveredDevice};
use crate::infrastructure::bluetooth::protocol::{packetize, DEFAULT_DEVICE_NAME, MAX_PACKET_SIZE};
use crate::infrastructure::bluetooth::transport::{
    ChannelHandle, DataCallback, ScanFilter, Transport, TransportError,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Default)]
struct SimState {
    peripherals: Vec<DiscoveredDevice>,
    scan_sender: Option<mpsc::UnboundedSender<DiscoveredDevice>>,
    connecting: HashSet<DeviceHandle>,
    linked: HashSet<DeviceHandle>,
    // None: the link never comes up
    link_after_polls: Option<u32>,
    polls: u32,
    channels: Vec<ChannelHandle>,
    fail_subscribe: bool,
    // Commands are accepted but never answered
    silent: bool,
    fail_write: bool,
    subscriber: Option<DataCallback>,
    offsets: [i32; MOTOR_COUNT],
    written: Vec<Vec<u8>>,
    commands: Vec<String>,
    connect_calls: u32,
    disconnect_calls: u32,
    clear_calls: u32,
}

/// Simulated transport. Cloning shares the same simulated robot.
#[derive(Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTransport {
    /// A robot that links on the first poll and exposes the usual two
    /// serial characteristics without declared capabilities.
    pub fn new() -> Self {
        let state = SimState {
            link_after_polls: Some(0),
            channels: vec![ChannelHandle::new("ffe1"), ChannelHandle::new("ffe2")],
            ..SimState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A simulator already advertising one robot under the default name.
    pub fn with_robot() -> Self {
        let transport = Self::new();
        transport.add_peripheral(DiscoveredDevice {
            handle: DeviceHandle("sim-robot".to_string()),
            name: Some(DEFAULT_DEVICE_NAME.to_string()),
        });
        transport
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_peripheral(&self, device: DiscoveredDevice) {
        self.state().peripherals.push(device);
    }

    pub fn remove_peripherals(&self) {
        self.state().peripherals.clear();
    }

    /// Number of failed `is_linked` polls before the link reports up, or
    /// `None` for a link that never comes up.
    pub fn set_link_after_polls(&self, polls: Option<u32>) {
        self.state().link_after_polls = polls;
    }

    pub fn set_channels(&self, channels: Vec<ChannelHandle>) {
        self.state().channels = channels;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state().fail_subscribe = fail;
    }

    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Make every write fail as if the radio dropped the packet.
    pub fn set_fail_write(&self, fail: bool) {
        self.state().fail_write = fail;
    }

    pub fn set_offsets(&self, offsets: [i32; MOTOR_COUNT]) {
        self.state().offsets = offsets;
    }

    pub fn offsets(&self) -> [i32; MOTOR_COUNT] {
        self.state().offsets
    }

    /// Push raw bytes to the subscriber as if the robot had sent them.
    pub fn inject(&self, bytes: &[u8]) {
        let subscriber = self.state().subscriber.clone();
        if let Some(on_data) = subscriber {
            on_data(bytes.to_vec());
        }
    }

    /// Complete commands received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Radio packets written, in order.
    pub fn written_packets(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn polls(&self) -> u32 {
        self.state().polls
    }

    pub fn connect_calls(&self) -> u32 {
        self.state().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.state().disconnect_calls
    }

    pub fn clear_calls(&self) -> u32 {
        self.state().clear_calls
    }

    pub fn is_subscribed(&self) -> bool {
        self.state().subscriber.is_some()
    }

    // What the firmware console prints for a command.
    fn reply_to(state: &mut SimState, command: &str) -> String {
        let command = command.trim();
        match command {
            "c" => {
                let fields: Vec<String> = state.offsets.iter().map(|a| a.to_string()).collect();
                format!("c{}\t\r\n", fields.join("\t"))
            }
            "s" | "d" | "g" => format!("{}\r\n", command),
            _ => {
                if let Some((servo, angle)) = parse_set_offset(command) {
                    state.offsets[servo] = angle;
                    format!("c{}\t{}\t\r\n", servo, angle)
                } else {
                    format!("{}\r\n", command)
                }
            }
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_set_offset(command: &str) -> Option<(usize, i32)> {
    let rest = command.strip_prefix('c')?;
    let (servo, angle) = rest.split_once(' ')?;
    let servo: usize = servo.parse().ok()?;
    let angle: i32 = angle.trim().parse().ok()?;
    (servo < MOTOR_COUNT).then_some((servo, angle))
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn scan(
        &self,
        filter: ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        trace!("Simulated scan, filter {:?}", filter);
        for device in &state.peripherals {
            let _ = tx.send(device.clone());
        }
        state.scan_sender = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state().scan_sender = None;
        Ok(())
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.peripherals.iter().any(|p| &p.handle == device) {
            return Err(TransportError::UnknownDevice(device.clone()));
        }
        state.connect_calls += 1;
        state.polls = 0;
        state.connecting.insert(device.clone());
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        let mut state = self.state();
        state.disconnect_calls += 1;
        state.connecting.remove(device);
        state.linked.remove(device);
        state.subscriber = None;
        Ok(())
    }

    async fn is_linked(&self, device: &DeviceHandle) -> bool {
        let mut state = self.state();
        if state.linked.contains(device) {
            return true;
        }
        if !state.connecting.contains(device) {
            return false;
        }
        let up = state.link_after_polls.is_some_and(|n| state.polls >= n);
        state.polls += 1;
        if up {
            state.connecting.remove(device);
            state.linked.insert(device.clone());
        }
        up
    }

    async fn list_channels(
        &self,
        device: &DeviceHandle,
    ) -> Result<Vec<ChannelHandle>, TransportError> {
        let state = self.state();
        if !state.linked.contains(device) {
            return Err(TransportError::NotConnected(device.clone()));
        }
        Ok(state.channels.clone())
    }

    async fn subscribe(
        &self,
        device: &DeviceHandle,
        channel: &ChannelHandle,
        on_data: DataCallback,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.linked.contains(device) {
            return Err(TransportError::NotConnected(device.clone()));
        }
        if state.fail_subscribe {
            return Err(TransportError::Io("notification setup rejected".to_string()));
        }
        if !state.channels.contains(channel) {
            return Err(TransportError::UnknownChannel(channel.id.clone()));
        }
        state.subscriber = Some(on_data);
        Ok(())
    }

    async fn write(
        &self,
        device: &DeviceHandle,
        channel: &ChannelHandle,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let (reply, subscriber) = {
            let mut state = self.state();
            if !state.linked.contains(device) {
                return Err(TransportError::NotConnected(device.clone()));
            }
            if !state.channels.contains(channel) {
                return Err(TransportError::UnknownChannel(channel.id.clone()));
            }
            if state.fail_write {
                return Err(TransportError::Io("write rejected".to_string()));
            }
            for packet in packetize(bytes, MAX_PACKET_SIZE) {
                state.written.push(packet.to_vec());
            }

            let command = String::from_utf8_lossy(bytes).into_owned();
            debug!("Simulated robot received {:?}", command);
            let reply = Self::reply_to(&mut state, &command);
            state.commands.push(command);
            let subscriber = if state.silent { None } else { state.subscriber.clone() };
            (reply, subscriber)
        };

        if let Some(on_data) = subscriber {
            for packet in packetize(reply.as_bytes(), MAX_PACKET_SIZE) {
                on_data(packet.to_vec());
            }
        }
        Ok(())
    }

    async fn clear_receive_buffer(&self, _device: &DeviceHandle) {
        self.state().clear_calls += 1;
    }
}
