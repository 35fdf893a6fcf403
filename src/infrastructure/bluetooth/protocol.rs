//! Robot serial protocol
//!
//! The robot's BLE module bridges to a plain serial console. Commands are
//! short ASCII tokens; replies are free-form text that the framing layer
//! cleans into comma-separated frames.

use std::fmt;

/// Largest payload the robot's BLE serial bridge accepts per write.
pub const MAX_PACKET_SIZE: usize = 20;

/// Advertised name of the robot's BLE serial bridge module.
pub const DEFAULT_DEVICE_NAME: &str = "JDY-23A-BLE";

/// Commands understood by the robot firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Relax into the rest posture
    Rest,
    /// Toggle gyro balancing
    Gyro,
    /// Enter calibration posture and report servo offsets
    Calibrate,
    /// Set one servo's calibration offset
    SetOffset { servo: usize, angle: i32 },
    /// Persist the current offsets on the robot
    Save,
    /// Anything else, sent verbatim
    Raw(String),
}

impl DeviceCommand {
    /// Wire text for this command.
    pub fn text(&self) -> String {
        match self {
            Self::Rest => "d".to_string(),
            Self::Gyro => "g".to_string(),
            Self::Calibrate => "c".to_string(),
            Self::SetOffset { servo, angle } => format!("c{} {}", servo, angle),
            Self::Save => "s".to_string(),
            Self::Raw(text) => text.clone(),
        }
    }

    /// Whether a reply to `command` is a calibration report.
    pub fn is_calibration_query(command: &str) -> bool {
        command == "c"
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

impl From<&str> for DeviceCommand {
    fn from(text: &str) -> Self {
        match text {
            "d" => Self::Rest,
            "g" => Self::Gyro,
            "c" => Self::Calibrate,
            "s" => Self::Save,
            other => Self::Raw(other.to_string()),
        }
    }
}

/// Split a payload into slices of at most `packet_size` bytes.
pub fn packetize(bytes: &[u8], packet_size: usize) -> impl Iterator<Item = &[u8]> {
    bytes.chunks(packet_size.max(1))
}
