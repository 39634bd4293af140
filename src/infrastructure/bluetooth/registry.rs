use crate::domain::models::{DeviceIdentity, SessionEvent};
use crate::error::ConnectionError;
use crate::infrastructure::bluetooth::session::{DeviceSession, SessionConfig, SessionHandle};
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Builds a fresh transport, and the channel its events arrive on, for each
/// selected device.
pub trait TransportFactory: Send + Sync {
    type Transport: Transport;

    fn create(
        &self,
        device: &DeviceIdentity,
    ) -> (Self::Transport, mpsc::UnboundedReceiver<TransportEvent>);
}

/// Live sessions keyed by device address.
///
/// Sessions share nothing but the observer channel; the registry only decides
/// which one a request goes to.
pub struct SessionRegistry<F: TransportFactory> {
    factory: F,
    config: SessionConfig,
    observer: mpsc::UnboundedSender<SessionEvent>,
    sessions: HashMap<String, SessionHandle>,
}

impl<F: TransportFactory> SessionRegistry<F> {
    pub fn new(
        factory: F,
        config: SessionConfig,
        observer: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            factory,
            config,
            observer,
            sessions: HashMap::new(),
        }
    }

    /// Start a session for `device` and begin connecting.
    ///
    /// A finished session for the same address is replaced; a live one is
    /// left alone and the call fails with `AlreadyActive`.
    pub async fn select(&mut self, device: DeviceIdentity) -> Result<&SessionHandle, ConnectionError> {
        if let Some(existing) = self.sessions.get(&device.address) {
            if !existing.state().is_terminal() {
                warn!("{} already has a live session", device.address);
                return Err(ConnectionError::AlreadyActive);
            }
        }

        info!("Selected {} ({})", device.display_name(), device.address);
        let (transport, events) = self.factory.create(&device);
        let handle = DeviceSession::spawn(
            device.clone(),
            transport,
            events,
            self.config.clone(),
            self.observer.clone(),
        );
        handle.connect().await?;

        let handle = match self.sessions.entry(device.address) {
            Entry::Occupied(mut slot) => {
                slot.insert(handle);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(handle),
        };
        Ok(handle)
    }

    pub fn get(&self, address: &str) -> Option<&SessionHandle> {
        self.sessions.get(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Request teardown of one session. Unknown addresses are a no-op.
    pub async fn disconnect(&self, address: &str) -> Result<(), ConnectionError> {
        match self.sessions.get(address) {
            Some(handle) => handle.disconnect().await,
            None => Ok(()),
        }
    }

    /// Request teardown of every session and wait for each to close.
    pub async fn disconnect_all(&mut self) {
        for (address, handle) in &self.sessions {
            if let Err(e) = handle.disconnect().await {
                warn!("Failed to disconnect {}: {}", address, e);
            }
        }
        for handle in self.sessions.values() {
            handle.wait_closed().await;
        }
        self.prune_finished();
    }

    /// Forget sessions that reached `Disconnected`. Returns how many were removed.
    pub fn prune_finished(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, handle| !handle.state().is_terminal());
        before - self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ConnectionState, DisconnectReason};
    use crate::infrastructure::bluetooth::testing::{test_config, FakeTransport};
    use std::sync::{Arc, Mutex};

    type Links = HashMap<String, mpsc::UnboundedSender<TransportEvent>>;

    /// Hands out fake transports and keeps their event senders for the test.
    #[derive(Clone, Default)]
    struct FakeFactory {
        links: Arc<Mutex<Links>>,
    }

    impl FakeFactory {
        fn link(&self, address: &str) -> mpsc::UnboundedSender<TransportEvent> {
            self.links.lock().unwrap()[address].clone()
        }
    }

    impl TransportFactory for FakeFactory {
        type Transport = FakeTransport;

        fn create(
            &self,
            device: &DeviceIdentity,
        ) -> (FakeTransport, mpsc::UnboundedReceiver<TransportEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.links
                .lock()
                .unwrap()
                .insert(device.address.clone(), tx);
            (FakeTransport::new(), rx)
        }
    }

    fn registry() -> (
        SessionRegistry<FakeFactory>,
        FakeFactory,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let factory = FakeFactory::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            connection: test_config(),
            ..SessionConfig::default()
        };
        (SessionRegistry::new(factory.clone(), config, tx), factory, rx)
    }

    fn device(address: &str) -> DeviceIdentity {
        DeviceIdentity::new(address, None)
    }

    #[tokio::test]
    async fn test_select_starts_connecting() {
        let (mut registry, _factory, _rx) = registry();
        let handle = registry.select(device("A")).await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Connecting);
        assert_eq!(registry.addresses(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_live_address_is_rejected() {
        let (mut registry, _factory, _rx) = registry();
        registry.select(device("A")).await.unwrap();
        assert!(matches!(
            registry.select(device("A")).await,
            Err(ConnectionError::AlreadyActive)
        ));
        registry.select(device("B")).await.unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_finished_session_can_be_replaced() {
        let (mut registry, factory, _rx) = registry();
        registry.select(device("A")).await.unwrap();
        factory
            .link("A")
            .send(TransportEvent::LinkFailed {
                reason: "refused".to_string(),
            })
            .unwrap();
        registry.get("A").unwrap().wait_closed().await;

        let handle = registry.select(device("A")).await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let (mut registry, factory, _rx) = registry();
        registry.select(device("A")).await.unwrap();
        registry.select(device("B")).await.unwrap();

        factory.link("A").send(TransportEvent::LinkLost).unwrap();
        registry.get("A").unwrap().wait_closed().await;

        assert_eq!(registry.get("B").unwrap().state(), ConnectionState::Connecting);
        assert_eq!(registry.prune_finished(), 1);
        assert_eq!(registry.addresses(), vec!["B".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all() {
        let (mut registry, factory, _rx) = registry();
        registry.select(device("A")).await.unwrap();
        registry.select(device("B")).await.unwrap();

        registry.disconnect("A").await.unwrap();
        factory.link("A").send(TransportEvent::TeardownComplete).unwrap();
        assert_eq!(
            registry.get("A").unwrap().wait_closed().await,
            ConnectionState::Disconnected(DisconnectReason::Requested)
        );

        // B never confirms and is released by the teardown timeout
        let b = registry.get("B").unwrap().subscribe_state();
        registry.disconnect_all().await;
        assert_eq!(
            *b.borrow(),
            ConnectionState::Disconnected(DisconnectReason::Timeout)
        );
        assert!(registry.is_empty());
        assert!(registry.disconnect("A").await.is_ok());
    }
}
