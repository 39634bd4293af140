//! Bluetooth Module
//!
//! GATT client for the IMU capture peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SessionRegistry                       │
//! │   (one DeviceSession per selected device address)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ SessionHandle (commands, state)
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceSession                        │
//! │   (task: serializes commands and transport events)       │
//! └──────┬──────────────────┬──────────────────┬────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌────────────┐   ┌────────────────┐   ┌──────────────┐
//! │ Connection │   │     Router     │   │   Command    │
//! │            │   │                │   │              │
//! │ - link     │   │ - data → frame │   │ - start/stop │
//! │ - GATT     │   │   reassembler  │   │ - capture    │
//! │   discovery│   │ - echo → state │   │   state      │
//! └─────┬──────┘   └────────────────┘   └──────────────┘
//!       │
//!       ▼
//!   Transport (btleplug, or a fake in tests)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, command bytes, characteristic roles
//! - [`transport`] - Link abstraction and its events
//! - [`connection`] - Connection state machine
//! - [`router`] - Notification dispatch
//! - [`command`] - Capture start/stop
//! - [`session`] - Per-device task and handle
//! - [`registry`] - Sessions by address

pub mod command;
pub mod connection;
pub mod observer;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

#[cfg(feature = "btleplug")]
pub mod btleplug_transport;

#[cfg(test)]
pub(crate) mod testing;

pub use registry::{SessionRegistry, TransportFactory};
pub use session::{DeviceSession, SessionConfig, SessionHandle};
