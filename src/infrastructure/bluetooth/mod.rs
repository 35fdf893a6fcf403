//! Bluetooth Module
//!
//! Provides the BLE serial link to a Petoi robot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       RobotLink                          │
//! │  (Session object - public API for the application)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!      ┌────────────┬───┴────────┬──────────────┐
//!      │            │            │              │
//!      ▼            ▼            ▼              ▼
//! ┌─────────┐ ┌────────────┐ ┌────────┐ ┌──────────────┐
//! │ Scanner │ │ Connection │ │ Poller │ │ CommandStack │
//! │         │ │            │ │        │ │ + Framing    │
//! │ - scan  │ │ - retries  │ │ - tick │ │ - frames     │
//! │ - select│ │ - channels │ │        │ │ - correlation│
//! └────┬────┘ └─────┬──────┘ └────────┘ └──────────────┘
//!      │            │
//!      ▼            ▼
//! ┌─────────────────────────┐
//! │   dyn Transport         │
//! │ (radio or simulator)    │
//! └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - The platform BLE seam and its error type
//! - [`protocol`] - Robot commands and packet sizing
//! - [`framing`] - Idle-timeout frame assembly
//! - [`command_stack`] - Bounded command history and response correlation
//! - [`poller`] - Periodic tick driving frame assembly
//! - [`scanner`] - BLE device discovery
//! - [`connection`] - Link-up retries, channel resolution and subscription
//! - [`service`] - Main session coordinator
//! - [`simulator`] - In-process robot for demos and tests

pub mod command_stack;
pub mod connection;
pub mod framing;
pub mod poller;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulator;
pub mod transport;

// Re-export main service for convenience
pub use service::{MessageCallback, RobotLink};
pub use simulator::SimulatedTransport;
pub use transport::{
    ChannelHandle, ChannelProperties, DataCallback, ScanFilter, Transport, TransportError,
};
