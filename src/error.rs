//! Error types for the capture core.
//!
//! Connection errors either reject an operation up front (`AlreadyActive`,
//! `NotReady`) or describe the reason a session ended. Frame errors are never
//! fatal: the offending fragment is dropped and reported as a diagnostic.

use std::str::Utf8Error;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("session is already active")]
    AlreadyActive,
    #[error("connection is not ready")]
    NotReady,
    #[error("link to the peripheral failed")]
    LinkFailure,
    #[error("service discovery failed")]
    DiscoveryFailed,
    #[error("timed out waiting for the peripheral")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed fragment (no '#' delimiter): {fragment:?}")]
    MalformedFragment { fragment: String },
    #[error("fragment on {characteristic} is not valid UTF-8")]
    DecodeFailure {
        characteristic: Uuid,
        #[source]
        source: Utf8Error,
    },
}

/// Failures reported by a [`Transport`](crate::infrastructure::bluetooth::transport::Transport)
/// implementation for outbound operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Backend(String),
}

#[cfg(feature = "btleplug")]
impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => Self::NotConnected,
            other => Self::Backend(other.to_string()),
        }
    }
}
