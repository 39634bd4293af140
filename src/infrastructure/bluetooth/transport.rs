//! Transport Abstraction
//!
//! The physical link is driven through [`Transport`] for outbound requests.
//! Outcomes come back asynchronously, one at a time and in arrival order, as
//! [`TransportEvent`]s on the channel handed out alongside the transport.

use crate::error::TransportError;
use async_trait::async_trait;
use uuid::Uuid;

/// Properties of a characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub service: Uuid,
    pub notify: bool,
    pub indicate: bool,
    pub write: bool,
}

impl DiscoveredCharacteristic {
    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A server-initiated value update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LinkEstablished,
    LinkFailed { reason: String },
    /// The link dropped without being asked to.
    LinkLost,
    DiscoveryComplete(Vec<DiscoveredCharacteristic>),
    DiscoveryFailed { reason: String },
    Notification(Notification),
    /// The peer confirmed a requested teardown.
    TeardownComplete,
}

/// Outbound primitives of a GATT client link.
///
/// `open`, `discover` and `close` only start the operation; their outcome is
/// delivered as a [`TransportEvent`]. `enable_notifications` and `write`
/// complete in place.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn open(&mut self, address: &str) -> Result<(), TransportError>;

    async fn discover(&mut self) -> Result<(), TransportError>;

    async fn enable_notifications(&mut self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn write(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    /// Drop the underlying link resources. Must not fail or block.
    fn release(&mut self);
}

/// Receiver side of the link: one handler per session.
#[async_trait]
pub trait LinkEventHandler: Send {
    async fn on_link_established(&mut self);

    async fn on_link_failed(&mut self, reason: String);

    async fn on_link_lost(&mut self);

    async fn on_discovery_complete(&mut self, characteristics: Vec<DiscoveredCharacteristic>);

    async fn on_discovery_failed(&mut self, reason: String);

    async fn on_notification(&mut self, notification: Notification);

    async fn on_teardown_complete(&mut self);

    async fn dispatch(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LinkEstablished => self.on_link_established().await,
            TransportEvent::LinkFailed { reason } => self.on_link_failed(reason).await,
            TransportEvent::LinkLost => self.on_link_lost().await,
            TransportEvent::DiscoveryComplete(chars) => self.on_discovery_complete(chars).await,
            TransportEvent::DiscoveryFailed { reason } => self.on_discovery_failed(reason).await,
            TransportEvent::Notification(notification) => {
                self.on_notification(notification).await
            }
            TransportEvent::TeardownComplete => self.on_teardown_complete().await,
        }
    }
}
