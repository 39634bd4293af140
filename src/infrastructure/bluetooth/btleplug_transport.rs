//! btleplug Transport
//!
//! Drives a real adapter through `btleplug`. Link setup, service discovery and
//! teardown run on spawned tasks and report back through the session's
//! transport event channel. A pump task forwards the peripheral's notification
//! stream and watches the adapter for disconnects.

use crate::domain::models::DeviceIdentity;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::registry::TransportFactory;
use crate::infrastructure::bluetooth::transport::{
    DiscoveredCharacteristic, Notification, Transport, TransportEvent,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, CentralEvent, CharPropFlags, Characteristic, Central, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

type Slot = Arc<Mutex<Option<Peripheral>>>;

/// Get the first adapter the platform reports.
pub async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))
}

/// Scan for peripherals advertising `service` and report what was seen.
pub async fn scan(adapter: &Adapter, service: Uuid, duration: Duration) -> Result<Vec<DeviceIdentity>> {
    info!("Scanning for {:?} (service {})", duration, service);
    adapter
        .start_scan(ScanFilter {
            services: vec![service],
        })
        .await?;
    tokio::time::sleep(duration).await;
    if let Err(e) = adapter.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }

    let mut found = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let name = match peripheral.properties().await {
            Ok(Some(props)) => props.local_name,
            _ => None,
        };
        let device = DeviceIdentity::new(peripheral_address(&peripheral), name);
        debug!("Found {} ({})", device.display_name(), device.address);
        found.push(device);
    }
    info!("Scan finished: {} device(s)", found.len());
    Ok(found)
}

/// The MAC address where the platform exposes one, the opaque id otherwise.
fn peripheral_address(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        address.to_string()
    }
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Option<Peripheral>, TransportError> {
    let peripherals = adapter.peripherals().await?;
    Ok(peripherals.into_iter().find(|p| {
        p.address().to_string().eq_ignore_ascii_case(address) || p.id().to_string() == address
    }))
}

fn describe(characteristic: &Characteristic) -> DiscoveredCharacteristic {
    let props = characteristic.properties;
    DiscoveredCharacteristic {
        uuid: characteristic.uuid,
        service: characteristic.service_uuid,
        notify: props.contains(CharPropFlags::NOTIFY),
        indicate: props.contains(CharPropFlags::INDICATE),
        write: props.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    peripheral: Slot,
    tasks: Vec<JoinHandle<()>>,
}

impl BtleplugTransport {
    pub fn new(
        adapter: Adapter,
        connect_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            adapter,
            connect_timeout,
            events,
            peripheral: Arc::new(Mutex::new(None)),
            tasks: Vec::new(),
        };
        (transport, rx)
    }

    fn connected(&self) -> Result<Peripheral, TransportError> {
        self.peripheral
            .lock()
            .map_err(|_| TransportError::Backend("peripheral slot poisoned".to_string()))?
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn open(&mut self, address: &str) -> Result<(), TransportError> {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let slot = self.peripheral.clone();
        let timeout = self.connect_timeout;
        let address = address.to_string();

        let task = tokio::spawn(async move {
            let peripheral = match find_peripheral(&adapter, &address).await {
                Ok(Some(peripheral)) => peripheral,
                Ok(None) => {
                    let _ = events.send(TransportEvent::LinkFailed {
                        reason: format!("{} is not known to the adapter", address),
                    });
                    return;
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::LinkFailed {
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            let reason = match tokio::time::timeout(timeout, peripheral.connect()).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("connect timed out after {:?}", timeout)),
            };
            if let Some(reason) = reason {
                let _ = events.send(TransportEvent::LinkFailed { reason });
                return;
            }

            store(&slot, peripheral.clone());
            let _ = events.send(TransportEvent::LinkEstablished);
            pump(adapter, peripheral, events).await;
        });
        self.track(task);
        Ok(())
    }

    async fn discover(&mut self) -> Result<(), TransportError> {
        let peripheral = self.connected()?;
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            // BlueZ reports the connection before its GATT cache is populated
            #[cfg(target_os = "linux")]
            tokio::time::sleep(Duration::from_millis(600)).await;

            let event = match tokio::time::timeout(DISCOVERY_TIMEOUT, peripheral.discover_services()).await {
                Ok(Ok(())) => TransportEvent::DiscoveryComplete(
                    peripheral.characteristics().iter().map(describe).collect(),
                ),
                Ok(Err(e)) => TransportEvent::DiscoveryFailed {
                    reason: e.to_string(),
                },
                Err(_) => TransportEvent::DiscoveryFailed {
                    reason: format!("discovery timed out after {:?}", DISCOVERY_TIMEOUT),
                },
            };
            let _ = events.send(event);
        });
        self.track(task);
        Ok(())
    }

    async fn enable_notifications(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        let peripheral = self.connected()?;
        let target = self.characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&target).await?;
        Ok(())
    }

    async fn write(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let peripheral = self.connected()?;
        let target = self.characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&target, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let peripheral = self
            .peripheral
            .lock()
            .map_err(|_| TransportError::Backend("peripheral slot poisoned".to_string()))?
            .take();
        let Some(peripheral) = peripheral else {
            // Still connecting: nothing to tear down but the connect task
            for task in self.tasks.drain(..) {
                task.abort();
            }
            let _ = self.events.send(TransportEvent::TeardownComplete);
            return Ok(());
        };

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            match peripheral.disconnect().await {
                Ok(()) => {
                    let _ = events.send(TransportEvent::TeardownComplete);
                }
                Err(e) => warn!("Disconnect request failed: {}", e),
            }
        });
        self.track(task);
        Ok(())
    }

    fn release(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let leftover = self.peripheral.lock().ok().and_then(|mut slot| slot.take());
        if let Some(peripheral) = leftover {
            debug!("Dropping link to {}", peripheral_address(&peripheral));
            tokio::spawn(async move {
                let _ = peripheral.disconnect().await;
            });
        }
    }
}

fn store(slot: &Slot, peripheral: Peripheral) {
    match slot.lock() {
        Ok(mut slot) => *slot = Some(peripheral),
        Err(_) => warn!("Peripheral slot poisoned, link will not be tracked"),
    }
}

/// Forward notifications until the link goes away.
async fn pump(adapter: Adapter, peripheral: Peripheral, events: mpsc::UnboundedSender<TransportEvent>) {
    let id = peripheral.id();
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Could not open notification stream: {}", e);
            let _ = events.send(TransportEvent::LinkLost);
            return;
        }
    };
    let mut central = match adapter.events().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Disconnect watcher unavailable: {}", e);
            None
        }
    };

    loop {
        let mut watcher_closed = false;
        tokio::select! {
            notification = notifications.next() => match notification {
                Some(notification) => {
                    let _ = events.send(TransportEvent::Notification(Notification {
                        characteristic: notification.uuid,
                        value: notification.value,
                    }));
                }
                None => {
                    debug!("Notification stream ended");
                    break;
                }
            },
            event = next_central_event(&mut central) => match event {
                Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => break,
                Some(_) => {}
                None => watcher_closed = true,
            },
        }
        if watcher_closed {
            central = None;
        }
    }
    let _ = events.send(TransportEvent::LinkLost);
}

async fn next_central_event(
    stream: &mut Option<std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>>,
) -> Option<CentralEvent> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Creates one [`BtleplugTransport`] per selected device on a shared adapter.
#[derive(Clone)]
pub struct BtleplugFactory {
    adapter: Adapter,
    connect_timeout: Duration,
}

impl BtleplugFactory {
    pub fn new(adapter: Adapter, connect_timeout: Duration) -> Self {
        Self {
            adapter,
            connect_timeout,
        }
    }
}

impl TransportFactory for BtleplugFactory {
    type Transport = BtleplugTransport;

    fn create(
        &self,
        _device: &DeviceIdentity,
    ) -> (BtleplugTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        BtleplugTransport::new(self.adapter.clone(), self.connect_timeout)
    }
}
