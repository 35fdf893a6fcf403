//! BLE Connection Module
//!
//! Brings a selected device from "connect requested" to "subscribed":
//! waits for the link with bounded retries, lets it settle, resolves the
//! read/write characteristics and subscribes to notifications.

use crate::domain::models::{
    AppEvent, ConnectionState, DeviceHandle, MessageSeverity, StatusMessage,
};
use crate::domain::settings::LinkSettings;
use crate::error::LinkError;
use crate::infrastructure::bluetooth::transport::{ChannelHandle, DataCallback, Transport};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum number of link-up polls
    pub max_attempts: u32,
    /// Sleep between link-up polls
    pub retry_delay: Duration,
    /// Wait after link-up before asking for characteristics
    pub settle_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&LinkSettings::default())
    }
}

impl From<&LinkSettings> for ConnectionConfig {
    fn from(settings: &LinkSettings) -> Self {
        Self {
            max_attempts: settings.connect_attempts.max(1),
            retry_delay: settings.connect_retry_delay(),
            settle_delay: settings.settle_delay(),
        }
    }
}

/// The characteristics used for device-to-app and app-to-device bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPair {
    pub read: ChannelHandle,
    pub write: ChannelHandle,
}

/// Pick the read and write channels.
///
/// When the transport declares capabilities, the first notify-capable
/// channel reads and the first other write-capable channel writes. When it
/// declares none, index 0 reads and index 1 writes.
pub fn resolve_channels(channels: &[ChannelHandle]) -> Result<ChannelPair, LinkError> {
    if channels.iter().any(|c| c.properties.is_declared()) {
        let read = channels
            .iter()
            .position(|c| c.properties.notify)
            .ok_or(LinkError::MissingChannels { found: 0 })?;
        let write = channels
            .iter()
            .enumerate()
            .position(|(i, c)| i != read && c.properties.write)
            .ok_or(LinkError::MissingChannels { found: 1 })?;
        return Ok(ChannelPair {
            read: channels[read].clone(),
            write: channels[write].clone(),
        });
    }

    match channels {
        [read, write, ..] => Ok(ChannelPair {
            read: read.clone(),
            write: write.clone(),
        }),
        _ => Err(LinkError::MissingChannels {
            found: channels.len(),
        }),
    }
}

/// Poll `is_linked` up to `attempts` times with `delay` between polls.
/// Returns the attempt on which the link was seen.
pub async fn wait_for_link(
    transport: &dyn Transport,
    device: &DeviceHandle,
    attempts: u32,
    delay: Duration,
) -> Result<u32, LinkError> {
    for attempt in 1..=attempts {
        if transport.is_linked(device).await {
            debug!("Link to {} up on attempt {}", device, attempt);
            return Ok(attempt);
        }
        debug!("Link to {} not up yet ({}/{})", device, attempt, attempts);
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(LinkError::ConnectTimeout { attempts })
}

/// BLE Connection handler
pub struct BleConnection<'a> {
    transport: &'a dyn Transport,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    config: ConnectionConfig,
}

impl<'a> BleConnection<'a> {
    /// Create a new connection handler
    pub fn new(
        transport: &'a dyn Transport,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            transport,
            event_sender,
            config,
        }
    }

    /// Connect to `device` and subscribe `on_data` to its read channel.
    ///
    /// `on_state` is told about every intermediate state. On a link-up
    /// timeout the device is disconnected again; on a channel failure the
    /// link is left up.
    pub async fn connect(
        &self,
        device: &DeviceHandle,
        on_data: DataCallback,
        on_state: &(dyn Fn(ConnectionState) + Send + Sync),
    ) -> Result<ChannelPair, LinkError> {
        info!("Connecting to Bluetooth device: {}", device);
        self.send_log("Connecting to device...", MessageSeverity::Info);
        on_state(ConnectionState::Connecting);

        // Step 1: Ask the transport to connect
        self.transport.connect(device).await?;

        // Step 2: Wait for the link with bounded retries
        if let Err(e) = wait_for_link(
            self.transport,
            device,
            self.config.max_attempts,
            self.config.retry_delay,
        )
        .await
        {
            error!("Device {} never came up: {}", device, e);
            if let Err(e) = self.transport.disconnect(device).await {
                warn!("Disconnect after failed connect also failed: {}", e);
            }
            self.send_log(
                "Could not connect to the device, please try again",
                MessageSeverity::Error,
            );
            return Err(e);
        }
        on_state(ConnectionState::LinkUp);

        // Step 3: Let the link settle before discovery
        tokio::time::sleep(self.config.settle_delay).await;
        on_state(ConnectionState::DiscoveringChannels);

        // Step 4: Resolve the serial channels
        let channels = self.transport.list_channels(device).await?;
        info!("Found {} characteristics", channels.len());
        let pair = resolve_channels(&channels).map_err(|e| {
            self.send_log(
                "No usable serial channel found, please try again",
                MessageSeverity::Error,
            );
            e
        })?;
        debug!("Read channel {}, write channel {}", pair.read.id, pair.write.id);

        // Step 5: Subscribe to notifications on the read channel
        self.transport
            .subscribe(device, &pair.read, on_data)
            .await
            .map_err(|e| {
                error!("Subscribe on {} failed: {}", pair.read.id, e);
                LinkError::SubscribeFailed(e)
            })?;

        info!("Notifications enabled on {}", pair.read.id);
        Ok(pair)
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::ChannelProperties;

    fn notify() -> ChannelProperties {
        ChannelProperties {
            notify: true,
            write: false,
        }
    }

    fn write() -> ChannelProperties {
        ChannelProperties {
            notify: false,
            write: true,
        }
    }

    #[test]
    fn test_positional_convention() {
        let channels = vec![
            ChannelHandle::new("ffe1"),
            ChannelHandle::new("ffe2"),
            ChannelHandle::new("ffe3"),
        ];
        let pair = resolve_channels(&channels).unwrap();
        assert_eq!(pair.read.id, "ffe1");
        assert_eq!(pair.write.id, "ffe2");
    }

    #[test]
    fn test_too_few_channels() {
        assert_eq!(
            resolve_channels(&[ChannelHandle::new("ffe1")]),
            Err(LinkError::MissingChannels { found: 1 })
        );
        assert_eq!(
            resolve_channels(&[]),
            Err(LinkError::MissingChannels { found: 0 })
        );
    }

    #[test]
    fn test_declared_capabilities_win() {
        let channels = vec![
            ChannelHandle::with_properties("tx", write()),
            ChannelHandle::with_properties("rx", notify()),
        ];
        let pair = resolve_channels(&channels).unwrap();
        assert_eq!(pair.read.id, "rx");
        assert_eq!(pair.write.id, "tx");
    }

    #[test]
    fn test_single_bidirectional_channel_is_not_enough() {
        let both = ChannelProperties {
            notify: true,
            write: true,
        };
        let channels = vec![ChannelHandle::with_properties("ffe1", both)];
        assert_eq!(
            resolve_channels(&channels),
            Err(LinkError::MissingChannels { found: 1 })
        );
    }
}
