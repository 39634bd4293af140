//! Scripted in-memory transport for unit tests.

use crate::error::TransportError;
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, ConnectionManager};
use crate::infrastructure::bluetooth::protocol::{COMMAND_CHAR, DATA_CHAR, SERVICE};
use crate::infrastructure::bluetooth::transport::{DiscoveredCharacteristic, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(String),
    Discover,
    EnableNotifications(Uuid),
    Write(Uuid, Vec<u8>),
    Close,
    Release,
}

#[derive(Debug, Default)]
struct Script {
    calls: Vec<Call>,
    fail_open: bool,
    fail_discover: bool,
    fail_close: bool,
    fail_write: bool,
    enable_failures: HashMap<Uuid, u32>,
}

/// Clones share the same script, so a test can keep one to inspect calls
/// after moving another into the code under test.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    script: Arc<Mutex<Script>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn fail_open(&self) {
        self.script.lock().unwrap().fail_open = true;
    }

    pub fn fail_discover(&self) {
        self.script.lock().unwrap().fail_discover = true;
    }

    pub fn fail_close(&self) {
        self.script.lock().unwrap().fail_close = true;
    }

    pub fn fail_write(&self) {
        self.script.lock().unwrap().fail_write = true;
    }

    /// Fail the next `times` attempts to enable notifications on `uuid`.
    pub fn fail_enable(&self, uuid: Uuid, times: u32) {
        self.script
            .lock()
            .unwrap()
            .enable_failures
            .insert(uuid, times);
    }

    fn record(&self, call: Call) -> std::sync::MutexGuard<'_, Script> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(call);
        script
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&mut self, address: &str) -> Result<(), TransportError> {
        let script = self.record(Call::Open(address.to_string()));
        if script.fail_open {
            return Err(TransportError::Unavailable("adapter off".to_string()));
        }
        Ok(())
    }

    async fn discover(&mut self) -> Result<(), TransportError> {
        let script = self.record(Call::Discover);
        if script.fail_discover {
            return Err(TransportError::Backend("discovery rejected".to_string()));
        }
        Ok(())
    }

    async fn enable_notifications(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        let mut script = self.record(Call::EnableNotifications(characteristic));
        if let Some(remaining) = script.enable_failures.get_mut(&characteristic) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Backend("CCCD write failed".to_string()));
            }
        }
        Ok(())
    }

    async fn write(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let script = self.record(Call::Write(characteristic, value.to_vec()));
        if script.fail_write {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let script = self.record(Call::Close);
        if script.fail_close {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn release(&mut self) {
        drop(self.record(Call::Release));
    }
}

/// Run queued notification-enable steps, honoring retry delays, the way the
/// session loop does.
pub async fn run_subscription<T: Transport>(connection: &mut ConnectionManager<T>) {
    while let Some(at) = connection.subscription_deadline() {
        tokio::time::sleep_until(at).await;
        connection.on_subscription_step().await;
    }
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        disconnect_timeout: Duration::from_secs(2),
        notify_retry_attempts: 3,
        notify_retry_delay: Duration::from_millis(100),
        ..ConnectionConfig::default()
    }
}

/// What the stock firmware exposes.
pub fn stock_characteristics() -> Vec<DiscoveredCharacteristic> {
    vec![
        DiscoveredCharacteristic {
            uuid: DATA_CHAR,
            service: SERVICE,
            notify: true,
            indicate: false,
            write: false,
        },
        DiscoveredCharacteristic {
            uuid: COMMAND_CHAR,
            service: SERVICE,
            notify: true,
            indicate: false,
            write: true,
        },
    ]
}
