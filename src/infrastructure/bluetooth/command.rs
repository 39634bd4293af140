use crate::error::ConnectionError;
use crate::infrastructure::bluetooth::connection::ConnectionManager;
use crate::infrastructure::bluetooth::protocol::{self, CaptureCommand};
use crate::infrastructure::bluetooth::transport::Transport;
use tracing::{debug, info};
use uuid::Uuid;

/// Start/stop signalling on the command characteristic.
///
/// `capturing` only moves when the peripheral echoes its state back; a
/// successful write is recorded in `last_requested` and nothing else.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    characteristic: Uuid,
    last_requested: Option<bool>,
    capturing: bool,
}

impl CommandChannel {
    pub fn new(characteristic: Uuid) -> Self {
        Self {
            characteristic,
            last_requested: None,
            capturing: false,
        }
    }

    /// Confirmed capture state.
    pub fn capturing(&self) -> bool {
        self.capturing
    }

    pub fn last_requested(&self) -> Option<bool> {
        self.last_requested
    }

    pub async fn send_start<T: Transport>(
        &mut self,
        connection: &mut ConnectionManager<T>,
    ) -> Result<(), ConnectionError> {
        self.send(connection, true).await
    }

    pub async fn send_stop<T: Transport>(
        &mut self,
        connection: &mut ConnectionManager<T>,
    ) -> Result<(), ConnectionError> {
        self.send(connection, false).await
    }

    pub async fn send<T: Transport>(
        &mut self,
        connection: &mut ConnectionManager<T>,
        capture: bool,
    ) -> Result<(), ConnectionError> {
        let command = CaptureCommand::for_state(capture);
        connection
            .write(self.characteristic, command.as_bytes())
            .await?;
        info!("Sent {:?} to {}", command, self.characteristic);
        self.last_requested = Some(capture);
        Ok(())
    }

    /// Apply a capture-state echo. Returns the new state only when it changed.
    pub fn apply_echo(&mut self, value: &[u8]) -> Option<bool> {
        let capturing = protocol::parse_capture_echo(value)?;
        if capturing == self.capturing {
            debug!("Capture echo unchanged ({})", capturing);
            return None;
        }
        info!("Capture {}", if capturing { "started" } else { "stopped" });
        self.capturing = capturing;
        Some(capturing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionState;
    use crate::infrastructure::bluetooth::observer::EventSink;
    use crate::infrastructure::bluetooth::protocol::COMMAND_CHAR;
    use crate::infrastructure::bluetooth::testing::{
        run_subscription, stock_characteristics, test_config, Call, FakeTransport,
    };
    use tokio::sync::mpsc;

    async fn ready_connection() -> (ConnectionManager<FakeTransport>, FakeTransport) {
        let transport = FakeTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut connection =
            ConnectionManager::new(transport.clone(), test_config(), EventSink::new("dev", tx));
        connection.connect("dev").await.unwrap();
        connection.on_link_established().await;
        connection.on_discovery_complete(stock_characteristics());
        run_subscription(&mut connection).await;
        assert_eq!(connection.state(), ConnectionState::Ready);
        (connection, transport)
    }

    #[tokio::test]
    async fn test_start_writes_one() {
        let (mut connection, transport) = ready_connection().await;
        let mut channel = CommandChannel::new(COMMAND_CHAR);

        channel.send_start(&mut connection).await.unwrap();
        channel.send_stop(&mut connection).await.unwrap();

        assert_eq!(transport.count(&Call::Write(COMMAND_CHAR, vec![1])), 1);
        assert_eq!(transport.count(&Call::Write(COMMAND_CHAR, vec![0])), 1);
        assert_eq!(channel.last_requested(), Some(false));
        // Writes alone never confirm anything
        assert!(!channel.capturing());
    }

    #[tokio::test]
    async fn test_not_ready_outside_ready() {
        let transport = FakeTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut connection =
            ConnectionManager::new(transport.clone(), test_config(), EventSink::new("dev", tx));
        let mut channel = CommandChannel::new(COMMAND_CHAR);

        assert_eq!(
            channel.send_start(&mut connection).await,
            Err(ConnectionError::NotReady)
        );
        connection.connect("dev").await.unwrap();
        assert_eq!(
            channel.send_stop(&mut connection).await,
            Err(ConnectionError::NotReady)
        );
        assert_eq!(channel.last_requested(), None);
        assert!(transport
            .calls()
            .iter()
            .all(|c| !matches!(c, Call::Write(..))));
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_transport_error() {
        let (mut connection, transport) = ready_connection().await;
        transport.fail_write();
        let mut channel = CommandChannel::new(COMMAND_CHAR);
        assert!(matches!(
            channel.send_start(&mut connection).await,
            Err(ConnectionError::Transport(_))
        ));
        assert_eq!(channel.last_requested(), None);
    }

    #[test]
    fn test_echo_changes_state_once() {
        let mut channel = CommandChannel::new(COMMAND_CHAR);
        assert_eq!(channel.apply_echo(&[0]), None);
        assert_eq!(channel.apply_echo(&[1]), Some(true));
        assert_eq!(channel.apply_echo(&[2]), None);
        assert!(channel.capturing());
        assert_eq!(channel.apply_echo(&[0]), Some(false));
        assert_eq!(channel.apply_echo(&[]), None);
    }
}
