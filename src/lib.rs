//! BLE capture client for an IMU peripheral that streams JSON readings as
//! `<id>#<fragment>` notifications.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    CompleteMessage, ConnectionState, DeviceIdentity, Diagnostic, DisconnectReason,
    SensorReading, SessionEvent,
};
pub use domain::reassembler::{FrameReassembler, ReassemblyLimits};
pub use error::{ConnectionError, FrameError, TransportError};
pub use infrastructure::bluetooth::{
    DeviceSession, SessionConfig, SessionHandle, SessionRegistry, TransportFactory,
};
