use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "gatt_capture".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_data_uuid")]
    pub ble_data_char_uuid: String,
    #[serde(default = "default_command_uuid")]
    pub ble_command_char_uuid: String,

    // Connection Settings
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default = "default_notify_retry_attempts")]
    pub notify_retry_attempts: u32,
    #[serde(default = "default_notify_retry_delay_ms")]
    pub notify_retry_delay_ms: u64,

    // Reassembly Settings
    #[serde(default = "default_pending_frame_ttl_ms")]
    pub pending_frame_ttl_ms: u64,
    #[serde(default = "default_max_pending_frames")]
    pub max_pending_frames: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    // Device history
    #[serde(default)]
    pub known_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_data_char_uuid: default_data_uuid(),
            ble_command_char_uuid: default_command_uuid(),
            connect_timeout_ms: default_connect_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            notify_retry_attempts: default_notify_retry_attempts(),
            notify_retry_delay_ms: default_notify_retry_delay_ms(),
            pending_frame_ttl_ms: default_pending_frame_ttl_ms(),
            max_pending_frames: default_max_pending_frames(),
            sweep_interval_ms: default_sweep_interval_ms(),
            known_addresses: Vec::new(),
            last_connected_address: None,
        }
    }
}

fn default_service_uuid() -> String {
    "12345678-1234-5678-1234-56789abcdef0".to_string()
}
fn default_data_uuid() -> String {
    "12345678-1234-5678-1234-56789abcdef1".to_string()
}
fn default_command_uuid() -> String {
    "12345678-1234-5678-1234-56789abcdef2".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_disconnect_timeout_ms() -> u64 {
    5_000
}
fn default_notify_retry_attempts() -> u32 {
    3
}
fn default_notify_retry_delay_ms() -> u64 {
    500
}
fn default_pending_frame_ttl_ms() -> u64 {
    10_000
}
fn default_max_pending_frames() -> usize {
    32
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the per-user config directory.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults when it
    /// is missing or unreadable.
    pub fn from_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("GattCapture");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn add_known_address(&mut self, address: &str) -> anyhow::Result<()> {
        if !self.settings.known_addresses.iter().any(|a| a == address) {
            self.settings.known_addresses.push(address.to_string());
            self.save()?;
        }
        Ok(())
    }

    pub fn set_last_connected(&mut self, address: &str) -> anyhow::Result<()> {
        if self.settings.last_connected_address.as_deref() == Some(address) {
            return Ok(());
        }
        self.settings.last_connected_address = Some(address.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"disconnect_timeout_ms": 250}"#).unwrap();
        assert_eq!(settings.disconnect_timeout_ms, 250);
        assert_eq!(settings.ble_data_char_uuid, default_data_uuid());
        assert_eq!(settings.max_pending_frames, 32);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::from_path(dir.path().join("absent.json"));
        assert_eq!(service.get().ble_command_char_uuid, default_command_uuid());
    }

    #[test]
    fn test_known_addresses_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::from_path(&path);
        service.add_known_address("AA:BB:CC:DD:EE:FF").unwrap();
        service.add_known_address("AA:BB:CC:DD:EE:FF").unwrap();
        service.set_last_connected("AA:BB:CC:DD:EE:FF").unwrap();

        let reloaded = SettingsService::from_path(&path);
        assert_eq!(reloaded.get().known_addresses, vec!["AA:BB:CC:DD:EE:FF"]);
        assert_eq!(
            reloaded.get().last_connected_address.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
    }
}
