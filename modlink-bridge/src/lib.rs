//! Resilient polling bridge for Modbus holding registers.
//!
//! The bridge keeps one TCP session to a register endpoint, reads the
//! configured register ranges on a fixed cadence and pushes every refreshed
//! snapshot to WebSocket observers.
//!
//! # Components
//!
//! - [`store::RegisterStore`] - current register snapshot
//! - [`link::DeviceLink`] - the single session, every call time-bounded
//! - [`supervisor::ReconnectSupervisor`] - bounded-retry reconnection
//! - [`poller::PollLoop`] - periodic range reads
//! - [`publisher::Publisher`] - snapshot fan-out
//! - [`server`] - observer WebSocket and operator HTTP endpoints
//!
//! [`bridge::Bridge`] wires them together and shuts them down in order.

pub mod bridge;
pub mod config;
pub mod error;
pub mod link;
pub mod modbus;
pub mod poller;
pub mod publisher;
pub mod server;
pub mod status;
pub mod store;
pub mod supervisor;

pub use bridge::Bridge;
pub use config::{BridgeConfig, RegisterRange};
pub use link::{Connector, Endpoint, RegisterSession};
pub use modbus::ModbusTcpConnector;
