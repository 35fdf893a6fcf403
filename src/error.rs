//! Errors surfaced to the application layer.
//!
//! Framing problems (undecodable chunks, unsolicited frames) are handled
//! inside the link and never show up here.

use crate::domain::models::ConnectionState;
use crate::infrastructure::bluetooth::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    // Device selection
    #[error("no device selected")]
    NoDeviceSelected,

    #[error("device {0:?} was not found in the last scan")]
    DeviceNotFound(String),

    // Connection lifecycle
    #[error("link is {0}, not ready")]
    NotReady(ConnectionState),

    #[error("a connect attempt is already running")]
    AlreadyConnecting,

    #[error("connect attempt was abandoned by a disconnect")]
    ConnectCancelled,

    #[error("device did not come up after {attempts} attempts")]
    ConnectTimeout { attempts: u32 },

    #[error("device exposes {found} usable channels, need a read and a write channel")]
    MissingChannels { found: usize },

    #[error("could not subscribe to the read channel: {0}")]
    SubscribeFailed(TransportError),

    // Command exchange
    #[error("another request is still waiting for its response")]
    CommandInFlight,

    #[error("no response within the response timeout")]
    ResponseTimeout,

    #[error("the link went down before a response arrived")]
    ResponseAbandoned,

    // Calibration
    #[error("servo {0} cannot be calibrated")]
    InvalidServo(usize),

    #[error("adjustment {0} is outside -9..=9")]
    InvalidAdjustment(i32),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T, E = LinkError> = std::result::Result<T, E>;
