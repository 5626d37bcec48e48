//! YAML configuration of a rack installation.
//!
//! ```yaml
//! device:
//!   host: 10.10.10.11
//!   port: 502
//!   rack: 1
//!   connect_timeout: 500ms
//!   io_timeout: 1s
//! poll_interval: 1s
//! monitor: [rpm, torque, psi_in, psi_out, flw0, flw1, flw2]
//! calibration:
//!   - { name: rpm, group: analog, slot: 2, channel: 1, range: 3000 }
//! ```
//!
//! Every field is optional. Without a `calibration` list the built-in rig
//! table is used.

use crate::calibration::{CalibrationEntry, CalibrationTable, RIG_SENSORS};
use crate::client::{ClientOptions, DEFAULT_POLL_INTERVAL};
use crate::protocol::RackAddress;
use crate::transport::DEFAULT_CONNECT_TIMEOUT;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "adam5k.yml";
pub const DEFAULT_PORT: u16 = 502;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub rack: RackAddress,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub io_timeout: Option<Duration>,
}

fn default_host() -> String {
    String::from("10.10.10.11")
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_monitor() -> Vec<String> {
    RIG_SENSORS.iter().map(|name| name.to_string()).collect()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            rack: RackAddress::default(),
            connect_timeout: default_connect_timeout(),
            io_timeout: None,
        }
    }
}

impl DeviceConfig {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Channels averaged by the monitor.
    #[serde(default = "default_monitor")]
    pub monitor: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Vec<CalibrationEntry>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            poll_interval: default_poll_interval(),
            monitor: default_monitor(),
            calibration: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// The configured calibration table, or the rig table when none is given.
    pub fn calibration_table(&self) -> Result<CalibrationTable> {
        match &self.calibration {
            Some(entries) => CalibrationTable::from_entries(entries.iter().cloned()),
            None => Ok(CalibrationTable::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.device.port, 502);
        assert_eq!(config.device.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.calibration_table().unwrap(), CalibrationTable::default());
    }

    #[test]
    fn full_file() {
        let config = Config::from_yaml(
            "
device:
  host: 192.168.1.20
  port: 5020
  rack: 3
  connect_timeout: 250ms
  io_timeout: 2s
poll_interval: 100ms
monitor: [rpm]
calibration:
  - { name: rpm, group: analog, slot: 2, channel: 1, range: 3000 }
",
        )
        .unwrap();
        assert_eq!(config.device.host, "192.168.1.20");
        assert_eq!(config.device.rack, RackAddress::new(3));
        assert_eq!(
            config.device.client_options(),
            ClientOptions {
                connect_timeout: Duration::from_millis(250),
                io_timeout: Some(Duration::from_secs(2)),
            }
        );
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        let table = config.calibration_table().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("rpm").unwrap().to_engineering(4095), 3000.0);
    }

    #[test]
    fn round_trip_through_yaml() {
        let config = Config {
            calibration: Some(CalibrationTable::default().to_entries()),
            ..Config::default()
        };
        let text = serde_yaml::to_string(&config).unwrap();
        assert_eq!(Config::from_yaml(&text).unwrap(), config);
    }

    #[test]
    fn invalid_files_are_reported() {
        assert_matches!(
            Config::from_yaml("poll_interval: often"),
            Err(Error::Config(..))
        );
        assert_matches!(
            Config::load("/nonexistent/adam5k.yml"),
            Err(Error::ConfigFile { .. })
        );
    }
}
