use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

use crate::device::{DeviceTarget, parse_address};
use crate::error::ConfigError;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The `blueutil` command line tool (macOS).
    Blueutil,
    /// btleplug on top of the platform Bluetooth stack.
    Ble,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Backend::Blueutil
        } else {
            Backend::Ble
        }
    }
}

fn default_lock_command() -> String {
    if cfg!(target_os = "macos") {
        "pmset displaysleepnow".to_string()
    } else {
        "loginctl lock-session".to_string()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub device_name: Option<String>,
    pub device_address: Option<String>,
    pub timeout_seconds: u64,
    pub poll_interval_seconds: u64,
    pub lock_command: String,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Minimum spacing between two reconnection attempts.
    pub reconnect_delay_seconds: u64,
    pub log_level: String,
    /// Log lines also go here when set.
    pub log_file: Option<PathBuf>,
    pub backend: Backend,
    pub mqtt: Option<MqttConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            device_name: None,
            device_address: None,
            timeout_seconds: 30,
            poll_interval_seconds: 5,
            lock_command: default_lock_command(),
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_delay_seconds: 2,
            log_level: "info".to_string(),
            log_file: None,
            backend: Backend::default(),
            mqtt: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

impl AppConfig {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::de::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, writing a default file first if there is none.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = AppConfig::default();
            config.save(path)?;
            println!("Created config file: {}", path.display());
            println!("Edit it with your device information or run `proximity-lock setup`.");
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        let write_err = |source: std::io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, contents).map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "timeout_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "poll_interval_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.reconnect_delay_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "reconnect_delay_seconds",
                reason: "must be at least one second".to_string(),
            });
        }
        self.target()?;
        Ok(())
    }

    /// The configured device. Empty strings count as unset.
    pub fn target(&self) -> Result<DeviceTarget, ConfigError> {
        let name = self
            .device_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        let address = match self.device_address.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => {
                Some(parse_address(raw).ok_or_else(|| ConfigError::Invalid {
                    key: "device_address",
                    reason: format!("`{raw}` is not a MAC address"),
                })?)
            }
            _ => None,
        };
        Ok(DeviceTarget { name, address })
    }
}
