//! Transport collaborator
//!
//! The BLE adapter itself lives outside this crate. Anything that can scan,
//! connect, enumerate characteristics, deliver notifications and write
//! bytes can drive a [`crate::RobotLink`] by implementing [`Transport`].

use crate::domain::models::{DeviceHandle, DiscoveredDevice};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a transport implementation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("device {0} is not connected")]
    NotConnected(DeviceHandle),
    #[error("unknown device {0}")]
    UnknownDevice(DeviceHandle),
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    #[error("transport I/O failure: {0}")]
    Io(String),
}

/// Callback invoked with every raw notification chunk.
pub type DataCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Optional filter applied while scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services
    pub service_uuids: Vec<String>,
}

/// Declared capabilities of a characteristic, when the platform exposes them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelProperties {
    pub notify: bool,
    pub write: bool,
}

impl ChannelProperties {
    pub fn is_declared(&self) -> bool {
        self.notify || self.write
    }
}

/// A characteristic on the connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    pub id: String,
    pub properties: ChannelProperties,
}

impl ChannelHandle {
    /// A channel whose capabilities the transport did not report.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: ChannelProperties::default(),
        }
    }

    pub fn with_properties(id: impl Into<String>, properties: ChannelProperties) -> Self {
        Self {
            id: id.into(),
            properties,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin discovery. Peripherals arrive on the returned receiver until
    /// [`Transport::stop_scan`] is called.
    async fn scan(
        &self,
        filter: ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, device: &DeviceHandle) -> Result<(), TransportError>;

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), TransportError>;

    async fn is_linked(&self, device: &DeviceHandle) -> bool;

    /// Characteristics of the linked peripheral in discovery order.
    async fn list_channels(
        &self,
        device: &DeviceHandle,
    ) -> Result<Vec<ChannelHandle>, TransportError>;

    async fn subscribe(
        &self,
        device: &DeviceHandle,
        channel: &ChannelHandle,
        on_data: DataCallback,
    ) -> Result<(), TransportError>;

    /// Write a payload. Splitting into radio-sized packets is the
    /// transport's job.
    async fn write(
        &self,
        device: &DeviceHandle,
        channel: &ChannelHandle,
        bytes: &[u8],
    ) -> Result<(), TransportError>;

    /// Best effort; drop whatever the platform has buffered for the device.
    async fn clear_receive_buffer(&self, device: &DeviceHandle);
}
