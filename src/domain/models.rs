use crate::error::FrameError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use uuid::Uuid;

/// A peripheral handed to us by the discovery feed.
///
/// Two identities are the same device when their addresses match; the name
/// is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: String,
    pub name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Requested,
    LinkFailure,
    DiscoveryFailed,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    ServiceDiscovery,
    Ready,
    Disconnecting,
    Disconnected(DisconnectReason),
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::ServiceDiscovery => write!(f, "service discovery"),
            Self::Ready => write!(f, "ready"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Disconnected(reason) => write!(f, "disconnected ({:?})", reason),
        }
    }
}

/// A fully reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteMessage {
    pub id: String,
    pub payload: String,
}

impl CompleteMessage {
    /// Decode the payload as JSON. The reassembler only checks for a trailing
    /// `}`, so this may fail on payloads that merely looked complete.
    pub fn parse_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One IMU sample as serialized by the sensor firmware.
///
/// `id` is the peripheral's uptime in milliseconds when the sample was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: u64,
    pub accelerometer: Vector3,
    pub gyroscope: Vector3,
}

/// Non-fatal conditions reported to the observer.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A fragment was dropped before reaching the reassembler, or rejected by it.
    Frame(FrameError),
    /// An incomplete message was evicted by the stale-frame sweep.
    FrameExpired { id: String, age: Duration },
    /// A notification arrived on a characteristic with no configured role.
    Unclassified { characteristic: Uuid },
    /// The command characteristic notified an empty value.
    EmptyCaptureEcho,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "{}", err),
            Self::FrameExpired { id, age } => {
                write!(f, "discarded incomplete message {:?} after {:?}", id, age)
            }
            Self::Unclassified { characteristic } => {
                write!(f, "ignored notification on {}", characteristic)
            }
            Self::EmptyCaptureEcho => write!(f, "empty capture echo"),
        }
    }
}

/// Everything the core reports to the outside world.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        address: String,
        state: ConnectionState,
    },
    CaptureChanged {
        address: String,
        capturing: bool,
    },
    Message {
        address: String,
        message: CompleteMessage,
    },
    Diagnostic {
        address: String,
        diagnostic: Diagnostic,
    },
}

impl SessionEvent {
    pub fn address(&self) -> &str {
        match self {
            Self::StateChanged { address, .. }
            | Self::CaptureChanged { address, .. }
            | Self::Message { address, .. }
            | Self::Diagnostic { address, .. } => address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_equality_ignores_name() {
        let a = DeviceIdentity::new("AA:BB", Some("Nano 33 IoT".to_string()));
        let b = DeviceIdentity::new("AA:BB", None);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_parse_sensor_reading() {
        let message = CompleteMessage {
            id: "a1".to_string(),
            payload: r#"{"id":1234,"accelerometer":{"x":0.1,"y":-0.2,"z":0.98},"gyroscope":{"x":1.5,"y":0.0,"z":-3.25}}"#
                .to_string(),
        };
        let reading: SensorReading = message.parse_json().unwrap();
        assert_eq!(reading.id, 1234);
        assert_eq!(reading.gyroscope.z, -3.25);
    }

    #[test]
    fn test_parse_rejects_spurious_completion() {
        let message = CompleteMessage {
            id: "a1".to_string(),
            payload: r#"{"t":{"x":1}"#.to_string(),
        };
        assert!(message.parse_json::<serde_json::Value>().is_err());
    }
}
