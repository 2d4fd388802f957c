use crate::infrastructure::link::manager::{FailureFallback, LinkConfig};
use crate::infrastructure::link::transport::TransportKind;
use crate::infrastructure::link::write_queue::{QueueConfig, QueuePolicy};
use anyhow::Context;
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
    #[serde(default = "default_true")]
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
            show_thread_ids: default_true(),
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
    "remote_gyro_sensor".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_local_socket_name")]
    pub local_socket_name: String,
    /// Peer dialled when no address is given on the command line
    #[serde(default)]
    pub peer_address: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub on_failure: FailureFallback,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_write_queue_depth")]
    pub write_queue_depth: usize,
    #[serde(default)]
    pub write_queue_policy: QueuePolicy,
    /// Start the link again once a session has ended
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            listen_address: default_listen_address(),
            local_socket_name: default_local_socket_name(),
            peer_address: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            on_failure: FailureFallback::default(),
            read_buffer_size: default_read_buffer_size(),
            write_queue_depth: default_write_queue_depth(),
            write_queue_policy: QueuePolicy::default(),
            auto_restart: default_true(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

impl LinkSettings {
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            fallback: self.on_failure,
            read_buffer_size: self.read_buffer_size.max(1),
            write_queue: QueueConfig::new(self.write_queue_depth, self.write_queue_policy),
        }
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:5555".to_string()
}
fn default_local_socket_name() -> String {
    "remote_gyro_sensor.sock".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    12_000
}
fn default_read_buffer_size() -> usize {
    1024
}
fn default_write_queue_depth() -> usize {
    1
}
fn default_restart_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSettings {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Yaw rate of the simulated device
    #[serde(default = "default_yaw_rate")]
    pub simulated_yaw_deg_per_sec: f32,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            simulated_yaw_deg_per_sec: default_yaw_rate(),
        }
    }
}

impl SensorSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

fn default_sample_interval_ms() -> u64 {
    200
}
fn default_yaw_rate() -> f32 {
    30.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub link: LinkSettings,
    #[serde(default)]
    pub sensor: SensorSettings,
    #[serde(default)]
    pub known_peers: Vec<String>,
    #[serde(default)]
    pub last_connected_peer: Option<String>,
}

#[derive(Debug)]
pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the per-user config directory, falling back to
    /// defaults when the file is missing or unreadable.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_or_default(settings_path))
    }

    /// Load settings from an explicit path.
    pub fn from_path(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let settings_path = path.into();
        let settings = Self::load_from_file(&settings_path)
            .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
        Ok(Self {
            settings,
            settings_path,
        })
    }

    /// Load settings from `settings_path`, using defaults if it cannot be
    /// read. Saving writes to that path.
    pub fn load_or_default(settings_path: PathBuf) -> Self {
        let settings = if settings_path.exists() {
            Self::load_from_file(&settings_path).unwrap_or_else(|e| {
                tracing::warn!(
                    "Ignoring unreadable settings file {}: {:#}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            })
        } else {
            tracing::debug!("No settings at {}, using defaults", settings_path.display());
            Settings::default()
        };
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("RemoteGyroSensor");
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

    /// Remember a peer we have been connected to.
    pub fn record_peer(&mut self, address: &str) -> anyhow::Result<()> {
        if !self.settings.known_peers.iter().any(|p| p == address) {
            self.settings.known_peers.push(address.to_string());
        }
        self.settings.last_connected_peer = Some(address.to_string());
        self.save()
    }
}
