//! Sensor Peripheral Protocol
//!
//! Identifiers and wire constants for the IMU capture peripheral.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Capture service exposed by the peripheral
pub const SERVICE_UUID: &str = "12345678-1234-5678-1234-56789abcdef0";

/// Data characteristic - notifies `<id>#<payload>` text fragments
pub const DATA_CHAR_UUID: &str = "12345678-1234-5678-1234-56789abcdef1";

/// Capture characteristic - accepts one command byte and echoes the applied state
pub const COMMAND_CHAR_UUID: &str = "12345678-1234-5678-1234-56789abcdef2";

pub const SERVICE: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef0);
pub const DATA_CHAR: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef1);
pub const COMMAND_CHAR: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef2);

/// Start/stop signals written to the command characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    Stop,
    Start,
}

impl CaptureCommand {
    pub fn for_state(capturing: bool) -> Self {
        if capturing {
            Self::Start
        } else {
            Self::Stop
        }
    }

    /// Get the raw bytes for this command
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Stop => &[0x00],
            Self::Start => &[0x01],
        }
    }
}

/// Decode a capture-state echo. Any non-zero first byte means capturing.
pub fn parse_capture_echo(value: &[u8]) -> Option<bool> {
    value.first().map(|b| *b != 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharacteristicRole {
    DataNotify,
    Command,
    Unclassified,
}

/// Static characteristic → role assignment for one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleMap {
    roles: HashMap<Uuid, CharacteristicRole>,
}

impl RoleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, characteristic: Uuid, role: CharacteristicRole) -> Self {
        self.roles.insert(characteristic, role);
        self
    }

    pub fn role_of(&self, characteristic: &Uuid) -> CharacteristicRole {
        self.roles
            .get(characteristic)
            .copied()
            .unwrap_or(CharacteristicRole::Unclassified)
    }

    pub fn data_characteristics(&self) -> impl Iterator<Item = &Uuid> {
        self.with_role(CharacteristicRole::DataNotify)
    }

    /// The characteristic capture commands are written to.
    pub fn command_characteristic(&self) -> Option<Uuid> {
        self.with_role(CharacteristicRole::Command).next().copied()
    }

    fn with_role(&self, role: CharacteristicRole) -> impl Iterator<Item = &Uuid> {
        self.roles
            .iter()
            .filter(move |(_, r)| **r == role)
            .map(|(uuid, _)| uuid)
    }
}

/// Parse a hyphenated or simple UUID string
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID {:?}: {}", uuid_str, e))
}

/// Role map for the stock firmware: one data and one command characteristic.
pub fn default_roles() -> RoleMap {
    RoleMap::new()
        .with(DATA_CHAR, CharacteristicRole::DataNotify)
        .with(COMMAND_CHAR, CharacteristicRole::Command)
}
