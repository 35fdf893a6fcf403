use crate::domain::calibration::{MotorAngleTable, MOTOR_COUNT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

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
    "petoi_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Timing and sizing knobs of the BLE link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Poller period driving the idle check
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Silence after which pending bytes become a frame
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Bound of the command/response stack
    #[serde(default = "default_command_history")]
    pub command_history: usize,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    /// Wait between link-up and characteristic discovery
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_device_name")]
    pub preferred_device_name: String,
    #[serde(default = "default_true")]
    pub discard_partial_on_send: bool,
}

impl LinkSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            command_history: default_command_history(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            packet_size: default_packet_size(),
            response_timeout_ms: default_response_timeout_ms(),
            preferred_device_name: default_device_name(),
            discard_partial_on_send: default_true(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}
fn default_idle_timeout_ms() -> u64 {
    1000
}
fn default_command_history() -> usize {
    15
}
fn default_connect_attempts() -> u32 {
    10
}
fn default_connect_retry_delay_ms() -> u64 {
    5000
}
fn default_settle_delay_ms() -> u64 {
    5000
}
fn default_packet_size() -> usize {
    20
}
fn default_response_timeout_ms() -> u64 {
    5000
}
fn default_device_name() -> String {
    "JDY-23A-BLE".to_string()
}
fn default_motor_angles() -> [i32; MOTOR_COUNT] {
    [0; MOTOR_COUNT]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub link: LinkSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Calibration offsets, one per servo
    #[serde(default = "default_motor_angles")]
    pub motor_angles: [i32; MOTOR_COUNT],

    #[serde(default)]
    pub last_device_name: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            link: LinkSettings::default(),
            log_settings: LogSettings::default(),
            motor_angles: default_motor_angles(),
            last_device_name: None,
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults if it is
    /// missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("PetoiLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
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

    pub fn motor_angles(&self) -> MotorAngleTable {
        MotorAngleTable::from(self.settings.motor_angles)
    }

    pub fn update_motor_angles(&mut self, table: &MotorAngleTable) -> anyhow::Result<()> {
        self.settings.motor_angles = table.to_array();
        self.save()
    }

    pub fn remember_device(&mut self, name: &str) -> anyhow::Result<()> {
        if self.settings.last_device_name.as_deref() != Some(name) {
            self.settings.last_device_name = Some(name.to_string());
            self.save()?;
        }
        Ok(())
    }
}
