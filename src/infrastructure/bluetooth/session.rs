//! Device Session
//!
//! One task per peripheral. The task owns the connection, the reassembler and
//! the command channel, and is the only place any of them is mutated: callers
//! talk to it through a [`SessionHandle`], the transport through its event
//! channel, and both are drained by the same `select!` loop.

use crate::domain::models::{ConnectionState, DeviceIdentity, Diagnostic, SessionEvent};
use crate::domain::reassembler::{ExpiredFrame, FrameReassembler, ReassemblyLimits};
use crate::domain::settings::Settings;
use crate::error::ConnectionError;
use crate::infrastructure::bluetooth::command::CommandChannel;
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, ConnectionManager};
use crate::infrastructure::bluetooth::observer::EventSink;
use crate::infrastructure::bluetooth::protocol::{self, CharacteristicRole, RoleMap};
use crate::infrastructure::bluetooth::router::{NotificationRouter, Routed};
use crate::infrastructure::bluetooth::transport::{
    DiscoveredCharacteristic, LinkEventHandler, Notification, Transport, TransportEvent,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Runtime configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub reassembly: ReassemblyLimits,
    /// How often stale pending frames are swept. Zero disables the sweep.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            reassembly: ReassemblyLimits::default(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let service_uuid = protocol::parse_uuid(&settings.ble_service_uuid)?;
        let data = protocol::parse_uuid(&settings.ble_data_char_uuid)?;
        let command = protocol::parse_uuid(&settings.ble_command_char_uuid)?;
        if data == command {
            anyhow::bail!("Data and command characteristics must differ ({})", data);
        }

        Ok(Self {
            connection: ConnectionConfig {
                service_uuid,
                roles: RoleMap::new()
                    .with(data, CharacteristicRole::DataNotify)
                    .with(command, CharacteristicRole::Command),
                disconnect_timeout: Duration::from_millis(settings.disconnect_timeout_ms),
                notify_retry_attempts: settings.notify_retry_attempts,
                notify_retry_delay: Duration::from_millis(settings.notify_retry_delay_ms),
            },
            reassembly: ReassemblyLimits {
                ttl: Duration::from_millis(settings.pending_frame_ttl_ms),
                max_pending: settings.max_pending_frames,
            },
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
        })
    }
}

type Reply = oneshot::Sender<Result<(), ConnectionError>>;

/// Requests handed into the session task.
#[derive(Debug)]
pub enum SessionCommand {
    Connect { reply: Reply },
    Disconnect { reply: Reply },
    SetCapture { capture: bool, reply: Reply },
}

pub struct DeviceSession<T: Transport> {
    device: DeviceIdentity,
    connection: ConnectionManager<T>,
    router: NotificationRouter,
    reassembler: FrameReassembler,
    command: CommandChannel,
    sink: EventSink,
    state: watch::Sender<ConnectionState>,
    sweep_interval: Duration,
}

impl<T: Transport> DeviceSession<T> {
    /// Start a session task for `device` and return its handle.
    ///
    /// `transport_events` must carry the events produced by `transport`.
    /// Every session event is sent to `observer`.
    pub fn spawn(
        device: DeviceIdentity,
        transport: T,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        config: SessionConfig,
        observer: mpsc::UnboundedSender<SessionEvent>,
    ) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let sink = EventSink::new(device.address.clone(), observer);
        let command_char = config
            .connection
            .roles
            .command_characteristic()
            .unwrap_or(protocol::COMMAND_CHAR);
        let router = NotificationRouter::new(config.connection.roles.clone());

        let session = Self {
            device: device.clone(),
            connection: ConnectionManager::new(transport, config.connection, sink.clone()),
            router,
            reassembler: FrameReassembler::new(config.reassembly),
            command: CommandChannel::new(command_char),
            sink,
            state: state_tx,
            sweep_interval: config.sweep_interval,
        };

        let task = tokio::spawn(session.run(command_rx, transport_events));

        SessionHandle {
            device,
            commands: command_tx,
            state: state_rx,
            task,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let sweep_enabled = !self.sweep_interval.is_zero();
        let mut sweep = tokio::time::interval(self.sweep_interval.max(Duration::from_millis(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        debug!("Session for {} started", self.device.address);

        while !self.state().is_terminal() {
            let deadline = self.connection.teardown_deadline();
            let subscription = self.connection.subscription_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All handles for {} dropped", self.device.address);
                        self.connection.shutdown();
                    }
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        warn!("Transport event stream for {} closed", self.device.address);
                        events_open = false;
                        self.on_link_lost().await;
                        if self.state() == ConnectionState::Idle {
                            self.connection.shutdown();
                        }
                    }
                },
                _ = wait_until(subscription) => self.connection.on_subscription_step().await,
                _ = wait_until(deadline) => self.connection.on_teardown_timeout(),
                _ = sweep.tick(), if sweep_enabled => self.sweep_stale_frames(),
            }
            self.publish_state();
        }

        info!(
            "Session for {} closed ({}, {} incomplete messages dropped)",
            self.device.address,
            self.state(),
            self.reassembler.pending_count()
        );
        self.reassembler.clear();
        self.publish_state();
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        let (result, reply) = match command {
            SessionCommand::Connect { reply } => {
                let address = self.device.address.clone();
                (self.connection.connect(&address).await, reply)
            }
            SessionCommand::Disconnect { reply } => (self.connection.disconnect().await, reply),
            SessionCommand::SetCapture { capture, reply } => (
                self.command.send(&mut self.connection, capture).await,
                reply,
            ),
        };
        self.publish_state();
        let _ = reply.send(result);
    }

    fn sweep_stale_frames(&mut self) {
        let expired = self.reassembler.sweep_expired(Instant::now().into_std());
        self.report_expired(expired);
    }

    fn report_expired(&self, frames: Vec<ExpiredFrame>) {
        for frame in frames {
            self.sink.diagnostic(Diagnostic::FrameExpired {
                id: frame.id,
                age: frame.age,
            });
        }
    }

    fn publish_state(&self) {
        let state = self.connection.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) if deadline <= Instant::now() => {}
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl<T: Transport> LinkEventHandler for DeviceSession<T> {
    async fn on_link_established(&mut self) {
        self.connection.on_link_established().await;
    }

    async fn on_link_failed(&mut self, reason: String) {
        self.connection.on_link_failed(&reason);
    }

    async fn on_link_lost(&mut self) {
        self.connection.on_link_lost();
    }

    async fn on_discovery_complete(&mut self, characteristics: Vec<DiscoveredCharacteristic>) {
        self.connection.on_discovery_complete(characteristics);
    }

    async fn on_discovery_failed(&mut self, reason: String) {
        self.connection.on_discovery_failed(&reason);
    }

    async fn on_notification(&mut self, notification: Notification) {
        match self.state() {
            ConnectionState::Ready | ConnectionState::Disconnecting => {}
            state => {
                debug!(
                    "Dropping notification on {} while {}",
                    notification.characteristic, state
                );
                return;
            }
        }

        match self
            .router
            .route(&notification, &mut self.reassembler, &mut self.command)
        {
            Some(Routed::Message(message)) => self.sink.message(message),
            Some(Routed::Capture(capturing)) => self.sink.capture_changed(capturing),
            Some(Routed::Diagnostic(diagnostic)) => self.sink.diagnostic(diagnostic),
            None => {}
        }

        let overflowed = self.reassembler.take_overflowed();
        self.report_expired(overflowed);
    }

    async fn on_teardown_complete(&mut self) {
        self.connection.on_teardown_complete();
    }
}

/// Caller-side handle on a running session.
///
/// Dropping the last handle tears the session down.
#[derive(Debug)]
pub struct SessionHandle {
    device: DeviceIdentity,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that sees every published state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// True once the session task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.request(|reply| SessionCommand::Connect { reply })
            .await
            .unwrap_or(Err(ConnectionError::AlreadyActive))
    }

    /// Succeeds without effect on a session that has already ended.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.request(|reply| SessionCommand::Disconnect { reply })
            .await
            .unwrap_or(Ok(()))
    }

    pub async fn start_capture(&self) -> Result<(), ConnectionError> {
        self.set_capture(true).await
    }

    pub async fn stop_capture(&self) -> Result<(), ConnectionError> {
        self.set_capture(false).await
    }

    /// Wait for the session to reach `Disconnected` and return that state.
    pub async fn wait_closed(&self) -> ConnectionState {
        let mut state = self.state.clone();
        let closed = state.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match closed {
            Ok(closed) => closed,
            Err(_) => *state.borrow(),
        }
    }

    async fn set_capture(&self, capture: bool) -> Result<(), ConnectionError> {
        self.request(|reply| SessionCommand::SetCapture { capture, reply })
            .await
            .unwrap_or(Err(ConnectionError::NotReady))
    }

    /// `None` when the session task is gone.
    async fn request(
        &self,
        command: impl FnOnce(Reply) -> SessionCommand,
    ) -> Option<Result<(), ConnectionError>> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).ok()?;
        response.await.ok()
    }
}
