use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use gatt_capture::domain::settings::SettingsService;
use gatt_capture::infrastructure::bluetooth::btleplug_transport::{self, BtleplugFactory};
use gatt_capture::infrastructure::logging::init_logger;
use gatt_capture::{
    ConnectionState, DeviceIdentity, SensorReading, SessionConfig, SessionEvent, SessionRegistry,
};

/// Capture IMU readings from a BLE sensor and print them as JSON lines
#[derive(Parser)]
#[command(name = "gatt-capture", version, about)]
struct Cli {
    /// Device address (MAC, or platform id on macOS); defaults to the last one used
    #[arg(short, long)]
    address: Option<String>,

    /// Seconds to scan before connecting
    #[arg(long, default_value = "5")]
    scan_secs: u64,

    /// Start capture as soon as the device is ready
    #[arg(long)]
    capture: bool,

    /// Settings file to use instead of the per-user one
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!("Starting gatt-capture (settings: {})", settings.path().display());

    let config = SessionConfig::from_settings(settings.get())?;
    let service = config.connection.service_uuid;
    let connect_timeout = Duration::from_millis(settings.get().connect_timeout_ms);

    let Some(address) = cli
        .address
        .clone()
        .or_else(|| settings.get().last_connected_address.clone())
    else {
        bail!("No device address given and none remembered; pass --address");
    };

    let adapter = btleplug_transport::first_adapter().await?;
    let seen = btleplug_transport::scan(&adapter, service, Duration::from_secs(cli.scan_secs))
        .await
        .context("Scan failed")?;
    let device = match seen
        .into_iter()
        .find(|d| d.address.eq_ignore_ascii_case(&address))
    {
        Some(device) => device,
        None => {
            warn!("{} not seen during scan, trying anyway", address);
            DeviceIdentity::new(address.clone(), None)
        }
    };

    let (observer, mut events) = mpsc::unbounded_channel();
    let mut registry = SessionRegistry::new(
        BtleplugFactory::new(adapter, connect_timeout),
        config,
        observer,
    );
    registry.select(device.clone()).await?;

    if let Err(e) = settings
        .add_known_address(&device.address)
        .and_then(|_| settings.set_last_connected(&device.address))
    {
        warn!("Failed to save device history: {}", e);
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, disconnecting");
                if let Some(session) = registry.get(&device.address) {
                    if session.state() == ConnectionState::Ready && cli.capture {
                        if let Err(e) = session.stop_capture().await {
                            warn!("Failed to stop capture: {}", e);
                        }
                    }
                }
                registry.disconnect_all().await;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::StateChanged { address, state } => {
                        info!("{}: {}", address, state);
                        if state == ConnectionState::Ready && cli.capture {
                            if let Some(session) = registry.get(&address) {
                                if let Err(e) = session.start_capture().await {
                                    warn!("Failed to start capture: {}", e);
                                }
                            }
                        }
                        if state.is_terminal() {
                            break;
                        }
                    }
                    SessionEvent::CaptureChanged { address, capturing } => {
                        info!("{}: capture {}", address, if capturing { "on" } else { "off" });
                    }
                    SessionEvent::Message { message, .. } => {
                        let line = match message.parse_json::<SensorReading>() {
                            Ok(reading) => serde_json::to_string(&reading)?,
                            Err(_) => serde_json::to_string(&message)?,
                        };
                        println!("{}", line);
                    }
                    SessionEvent::Diagnostic { address, diagnostic } => {
                        warn!("{}: {}", address, diagnostic);
                    }
                }
            }
        }
    }

    info!("Done");
    Ok(())
}
