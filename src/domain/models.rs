use std::fmt;

/// One complete, cleaned message assembled from the notification stream.
///
/// Frames never contain `\r`, `\n`, `\t` or `,,`. They are immutable once
/// produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame(String);

impl Frame {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Frame {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A command sent to the robot and the response attributed to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandToken {
    pub command: String,
    pub response: String,
}

impl CommandToken {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            response: String::new(),
        }
    }

    pub fn is_answered(&self) -> bool {
        !self.response.is_empty()
    }
}

/// Lifecycle of a single link to the robot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    DeviceSelected,
    Connecting,
    LinkUp,
    DiscoveringChannels,
    Ready,
    Failed,
    Disconnected,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    /// States in which a connect attempt is running.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::LinkUp | Self::DiscoveringChannels
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::DeviceSelected => "device selected",
            Self::Connecting => "connecting",
            Self::LinkUp => "link up",
            Self::DiscoveringChannels => "discovering channels",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Opaque, transport-assigned identifier of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub String);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub handle: DeviceHandle,
    /// Advertised local name, if any
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus(ConnectionState),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
