//! BLE Connection Module
//!
//! GATT connection state machine: link setup, service discovery,
//! notification subscription and bounded teardown.
//!
//! ```text
//! Idle -> Connecting -> ServiceDiscovery -> Ready -> Disconnecting -> Disconnected(Requested)
//!            |                |                           |
//!            v                v                           v
//!   Disconnected(LinkFailure) Disconnected(DiscoveryFailed)  Disconnected(Timeout)
//! ```
//!
//! An unsolicited link loss ends any non-idle state in
//! `Disconnected(LinkFailure)`. `Disconnected` is terminal.
//!
//! Notifications are enabled one characteristic at a time after discovery.
//! Each attempt is a separate step the owner runs once
//! [`ConnectionManager::subscription_deadline`] passes, so a disconnect or
//! link loss between attempts takes effect before the session reaches `Ready`.

use crate::domain::models::{ConnectionState, DisconnectReason};
use crate::error::{ConnectionError, TransportError};
use crate::infrastructure::bluetooth::observer::EventSink;
use crate::infrastructure::bluetooth::protocol::{self, CharacteristicRole, RoleMap};
use crate::infrastructure::bluetooth::transport::{DiscoveredCharacteristic, Transport};
use anyhow::Result;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service that must be present on the peripheral
    pub service_uuid: Uuid,
    /// Characteristic roles for this deployment
    pub roles: RoleMap,
    /// How long to wait for teardown confirmation before forcing release
    pub disconnect_timeout: Duration,
    /// Attempts per characteristic when enabling notifications
    pub notify_retry_attempts: u32,
    /// Delay between notification attempts
    pub notify_retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE,
            roles: protocol::default_roles(),
            disconnect_timeout: Duration::from_secs(5),
            notify_retry_attempts: 3,
            notify_retry_delay: Duration::from_millis(500),
        }
    }
}

/// A characteristic waiting for notifications to be enabled.
#[derive(Debug, Clone, Copy)]
struct PendingSubscription {
    characteristic: Uuid,
    /// Discovery fails if this one cannot be enabled.
    required: bool,
}

/// Notification enabling in progress during `ServiceDiscovery`.
#[derive(Debug)]
struct Subscription {
    queue: VecDeque<PendingSubscription>,
    failed_attempts: u32,
    next_at: Instant,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    config: ConnectionConfig,
    state: ConnectionState,
    notifying: HashSet<Uuid>,
    subscription: Option<Subscription>,
    teardown_deadline: Option<Instant>,
    released: bool,
    sink: EventSink,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, config: ConnectionConfig, sink: EventSink) -> Self {
        Self {
            transport,
            config,
            state: ConnectionState::Idle,
            notifying: HashSet::new(),
            subscription: None,
            teardown_deadline: None,
            released: false,
            sink,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn is_notifying(&self, characteristic: &Uuid) -> bool {
        self.notifying.contains(characteristic)
    }

    /// When the next notification-enable attempt is due, while one is queued.
    pub fn subscription_deadline(&self) -> Option<Instant> {
        self.subscription.as_ref().map(|s| s.next_at)
    }

    /// When a pending teardown will be forced, if one is pending.
    pub fn teardown_deadline(&self) -> Option<Instant> {
        self.teardown_deadline
    }

    pub async fn connect(&mut self, address: &str) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Idle {
            warn!(
                "Connect to {} rejected: session is {}",
                address, self.state
            );
            return Err(ConnectionError::AlreadyActive);
        }

        info!("Connecting to BLE device: {}", address);
        self.transition(ConnectionState::Connecting);

        if let Err(e) = self.transport.open(address).await {
            error!("Failed to open link to {}: {}", address, e);
            self.finish(DisconnectReason::LinkFailure);
        }
        Ok(())
    }

    /// Request teardown. Succeeds without effect when already disconnected or
    /// disconnecting.
    pub async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Disconnected(_) | ConnectionState::Disconnecting => Ok(()),
            ConnectionState::Idle => {
                self.finish(DisconnectReason::Requested);
                Ok(())
            }
            ConnectionState::Connecting
            | ConnectionState::ServiceDiscovery
            | ConnectionState::Ready => {
                info!("Disconnecting from {}", self.sink.address());
                if self.subscription.take().is_some() {
                    debug!("Abandoning notification setup");
                }
                self.transition(ConnectionState::Disconnecting);
                self.teardown_deadline = Some(Instant::now() + self.config.disconnect_timeout);

                if let Err(e) = self.transport.close().await {
                    warn!("Teardown request failed ({}), releasing link", e);
                    self.finish(DisconnectReason::Requested);
                }
                Ok(())
            }
        }
    }

    /// Write to a characteristic. Only valid while `Ready`.
    pub async fn write(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_ready() {
            return Err(ConnectionError::NotReady);
        }
        self.transport.write(characteristic, value).await?;
        Ok(())
    }

    /// Enable notifications on a characteristic. A characteristic that is
    /// already notifying is left alone.
    pub async fn enable_notifications(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        if self.notifying.contains(&characteristic) {
            debug!("Notifications already enabled on {}", characteristic);
            return Ok(());
        }

        self.transport.enable_notifications(characteristic).await?;
        info!("Notifications enabled on {}", characteristic);
        self.notifying.insert(characteristic);
        Ok(())
    }

    pub async fn on_link_established(&mut self) {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring link-established while {}", self.state);
            return;
        }

        info!("Link established with {}", self.sink.address());
        self.transition(ConnectionState::ServiceDiscovery);

        if let Err(e) = self.transport.discover().await {
            error!("Failed to start service discovery: {}", e);
            self.finish(DisconnectReason::DiscoveryFailed);
        }
    }

    pub fn on_link_failed(&mut self, reason: &str) {
        match self.state {
            ConnectionState::Connecting => {
                warn!("Link to {} failed: {}", self.sink.address(), reason);
                self.finish(DisconnectReason::LinkFailure);
            }
            // Connect was cancelled; the failure completes the teardown
            ConnectionState::Disconnecting => self.finish(DisconnectReason::Requested),
            _ => debug!("Ignoring link failure while {}: {}", self.state, reason),
        }
    }

    pub fn on_link_lost(&mut self) {
        match self.state {
            ConnectionState::Idle | ConnectionState::Disconnected(_) => {
                debug!("Ignoring link loss while {}", self.state)
            }
            ConnectionState::Disconnecting => {
                info!("Link to {} closed", self.sink.address());
                self.finish(DisconnectReason::Requested);
            }
            _ => {
                warn!("Link to {} lost while {}", self.sink.address(), self.state);
                self.finish(DisconnectReason::LinkFailure);
            }
        }
    }

    pub fn on_discovery_complete(&mut self, characteristics: Vec<DiscoveredCharacteristic>) {
        if self.state != ConnectionState::ServiceDiscovery {
            debug!(
                "Discarding {} discovered characteristics while {}",
                characteristics.len(),
                self.state
            );
            return;
        }

        info!("Found {} characteristics", characteristics.len());
        match self.plan_subscriptions(&characteristics) {
            Ok(queue) => {
                self.subscription = Some(Subscription {
                    queue,
                    failed_attempts: 0,
                    next_at: Instant::now(),
                });
            }
            Err(e) => {
                error!("Service discovery failed: {}", e);
                self.finish(DisconnectReason::DiscoveryFailed);
            }
        }
    }

    /// Make one notification-enable attempt. Reaches `Ready` once every
    /// queued characteristic is handled.
    pub async fn on_subscription_step(&mut self) {
        if self.state != ConnectionState::ServiceDiscovery {
            self.subscription = None;
            return;
        }
        let Some(next) = self.subscription.as_ref().and_then(|s| s.queue.front().copied()) else {
            self.subscription = None;
            return;
        };

        let outcome = self.enable_notifications(next.characteristic).await;
        let attempts = self.config.notify_retry_attempts.max(1);
        let retry_delay = self.config.notify_retry_delay;
        let Some(subscription) = self.subscription.as_mut() else {
            return;
        };

        match outcome {
            Ok(()) => {
                subscription.queue.pop_front();
                subscription.failed_attempts = 0;
                subscription.next_at = Instant::now();
            }
            Err(e) => {
                subscription.failed_attempts += 1;
                if subscription.failed_attempts < attempts {
                    warn!(
                        "Notification subscription attempt {}/{} on {} failed: {}",
                        subscription.failed_attempts, attempts, next.characteristic, e
                    );
                    subscription.next_at = Instant::now() + retry_delay;
                    return;
                }
                if next.required {
                    error!(
                        "Failed to enable notifications on {} after {} attempts: {}",
                        next.characteristic, attempts, e
                    );
                    self.finish(DisconnectReason::DiscoveryFailed);
                    return;
                }
                warn!("Capture echo unavailable: {}", e);
                subscription.queue.pop_front();
                subscription.failed_attempts = 0;
                subscription.next_at = Instant::now();
            }
        }

        if subscription.queue.is_empty() {
            self.subscription = None;
            self.transition(ConnectionState::Ready);
        }
    }

    pub fn on_discovery_failed(&mut self, reason: &str) {
        if self.state != ConnectionState::ServiceDiscovery {
            debug!("Ignoring discovery failure while {}: {}", self.state, reason);
            return;
        }
        error!("Service discovery failed: {}", reason);
        self.finish(DisconnectReason::DiscoveryFailed);
    }

    pub fn on_teardown_complete(&mut self) {
        if self.state == ConnectionState::Disconnecting {
            self.finish(DisconnectReason::Requested);
        } else {
            debug!("Ignoring teardown confirmation while {}", self.state);
        }
    }

    pub fn on_teardown_timeout(&mut self) {
        if self.state != ConnectionState::Disconnecting {
            self.teardown_deadline = None;
            return;
        }
        warn!(
            "No teardown confirmation from {} within {:?}, forcing release",
            self.sink.address(),
            self.config.disconnect_timeout
        );
        self.finish(DisconnectReason::Timeout);
    }

    /// Owning context is going away: release everything now.
    pub fn shutdown(&mut self) {
        if !self.state.is_terminal() {
            self.finish(DisconnectReason::Requested);
        }
    }

    /// Check the discovered layout and list what needs notifications.
    fn plan_subscriptions(
        &self,
        characteristics: &[DiscoveredCharacteristic],
    ) -> Result<VecDeque<PendingSubscription>> {
        let service = self.config.service_uuid;
        if !characteristics.iter().any(|c| c.service == service) {
            anyhow::bail!("Capture service {} not found", service);
        }

        let discovered = |uuid: &Uuid| characteristics.iter().find(|c| c.uuid == *uuid);

        let mut queue = VecDeque::new();
        for uuid in self.config.roles.data_characteristics() {
            let Some(characteristic) = discovered(uuid) else {
                continue;
            };
            if !characteristic.can_notify() {
                anyhow::bail!(
                    "Data characteristic {} does not support notifications",
                    characteristic.uuid
                );
            }
            queue.push_back(PendingSubscription {
                characteristic: characteristic.uuid,
                required: true,
            });
        }
        if queue.is_empty() {
            anyhow::bail!("Data characteristic not found");
        }

        let command_uuid = self
            .config
            .roles
            .command_characteristic()
            .ok_or_else(|| anyhow::anyhow!("No command characteristic configured"))?;
        let command = discovered(&command_uuid)
            .ok_or_else(|| anyhow::anyhow!("Command characteristic not found"))?;

        // Capture echoes arrive on the command characteristic when it notifies
        if command.can_notify() {
            queue.push_back(PendingSubscription {
                characteristic: command.uuid,
                required: false,
            });
        } else {
            debug!("Command characteristic {} does not notify", command.uuid);
        }

        Ok(queue)
    }

    fn finish(&mut self, reason: DisconnectReason) {
        self.teardown_deadline = None;
        self.subscription = None;
        if !self.released {
            self.transport.release();
            self.released = true;
            self.notifying.clear();
        }
        self.transition(ConnectionState::Disconnected(reason));
    }

    fn transition(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        info!("{}: {} -> {}", self.sink.address(), self.state, next);
        self.state = next;
        self.sink.state_changed(next);
    }
}
