//! BLE serial link to a Petoi quadruped robot.
//!
//! [`RobotLink`] discovers the robot's serial bridge, connects with bounded
//! retries, turns the notification stream into frames by idle timeout and
//! attaches each frame to the command that produced it. The platform radio
//! sits behind the [`Transport`] trait.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::calibration::MotorAngleTable;
pub use domain::models::{
    AppEvent, CommandToken, ConnectionState, DeviceHandle, DiscoveredDevice, Frame,
};
pub use domain::settings::{LinkSettings, Settings, SettingsService};
pub use error::LinkError;
pub use infrastructure::bluetooth::protocol::DeviceCommand;
pub use infrastructure::bluetooth::{RobotLink, SimulatedTransport, Transport, TransportError};
