use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::model::EmergencyType;

/// Application settings. Every section falls back to its defaults when
/// missing from settings.json, so older files keep loading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub alert: AlertSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub motion: MotionSettings,
    #[serde(default)]
    pub location: LocationSettings,
    #[serde(default)]
    pub connectivity: ConnectivitySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    /// Number of one-second ticks before an alert is sent
    pub countdown_ticks: u32,
    pub tick_interval_ms: u64,
    /// How long the "sent" confirmation stays up before resetting to idle
    pub sent_display_seconds: u64,
    /// Emergency type used for motion-triggered alerts
    pub default_type: EmergencyType,
    pub default_message: String,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            countdown_ticks: 5,
            tick_interval_ms: 1000,
            sent_display_seconds: 8,
            default_type: EmergencyType::Personal,
            default_message: "I need help. This is an emergency alert from ShieldHer.".to_string(),
        }
    }
}

impl AlertSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sent_display(&self) -> Duration {
        Duration::from_secs(self.sent_display_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Retries per contact after the first attempt before giving up
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub request_timeout_seconds: u64,
    /// Call-initiation endpoint of the delivery backend
    pub endpoint: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 2000,
            backoff_max_ms: 30_000,
            request_timeout_seconds: 10,
            endpoint: "http://localhost:3000/api/call".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    pub enabled: bool,
    /// Shake speed above which a trigger fires (empirical tuning)
    pub threshold: f64,
    pub debounce_ms: u64,
    pub scale: f64,
    /// sysfs directory of an IIO accelerometer, e.g. /sys/bus/iio/devices/iio:device0
    pub iio_device: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 15.0,
            debounce_ms: 100,
            scale: 1.0,
            iio_device: None,
            poll_interval_ms: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationSettings {
    pub refresh_seconds: u64,
    pub timeout_seconds: u64,
    pub enable_high_accuracy: bool,
    pub maximum_age_seconds: u64,
    /// gpsd host:port; takes precedence over fixed coordinates
    pub gpsd_address: Option<String>,
    pub fixed_latitude: Option<f64>,
    pub fixed_longitude: Option<f64>,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            refresh_seconds: 60,
            timeout_seconds: 15,
            enable_high_accuracy: true,
            maximum_age_seconds: 0,
            gpsd_address: None,
            fixed_latitude: None,
            fixed_longitude: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivitySettings {
    /// host:port probed with a TCP connect; no probe means "assume online"
    pub probe_address: Option<String>,
    pub probe_interval_seconds: u64,
    pub probe_timeout_seconds: u64,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            probe_address: Some("1.1.1.1:443".to_string()),
            probe_interval_seconds: 10,
            probe_timeout_seconds: 3,
        }
    }
}

pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(app_config_dir: PathBuf) -> Self {
        Self {
            config_path: app_config_dir.join("settings.json"),
        }
    }

    pub fn load(&self) -> Settings {
        if self.config_path.exists() {
            match fs::read_to_string(&self.config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(settings) => return settings,
                    Err(e) => log::warn!("Invalid settings file {:?}: {}", self.config_path, e),
                },
                Err(e) => log::warn!("Cannot read settings {:?}: {}", self.config_path, e),
            }
        }
        Settings::default()
    }

    pub fn save(&self, settings: &Settings) -> io::Result<()> {
        // Ensure directory exists
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.config_path, content)
    }
}
