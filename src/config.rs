//! Simulator configuration.
//!
//! Every knob defaults to the behaviour of a stock head unit, so
//! `HeadUnitConfig::default()` is a complete working configuration. A JSON
//! file can override any subset of fields.

use crate::error::ConfigError;
use crate::subsystems::sensor::is_valid_range;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_DIR: &str = "config";
pub const SENSOR_CALIBRATION_FILE: &str = "i2c_calibration.json";
pub const SENSOR_DATA_LOG_FILE: &str = "sensor_data.json";
pub const BLUETOOTH_DEVICES_FILE: &str = "bluetooth_devices.json";
pub const USB_DEVICES_FILE: &str = "usb_devices.json";

pub const DEFAULT_MEDIA_FORMATS: [&str; 14] = [
    "mp3", "wav", "flac", "aac", "ogg", "wma", "m4a", "mp4", "avi", "mkv", "mov", "wmv", "flv",
    "webm",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadUnitConfig {
    /// Directory holding the per-subsystem JSON state files.
    pub config_dir: PathBuf,
    /// Fixed PRNG seed; `None` seeds from OS entropy.
    pub seed: Option<u64>,
    pub sensor: SensorConfig,
    pub bluetooth: BluetoothConfig,
    pub usb: UsbConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub i2c_address: u8,
    pub update_interval_ms: u64,
    pub temperature_range: [f64; 2],
    pub humidity_range: [f64; 2],
    pub pressure_range: [f64; 2],
    pub light_range: [f64; 2],
    pub data_logging: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub discovery_interval_ms: u64,
    /// Chance, per discovery tick, that a new device shows up.
    pub discovery_probability_percent: u8,
    /// Stop discovery automatically after this long; `None` runs until stopped.
    pub discovery_timeout_ms: Option<u64>,
    pub signal_interval_ms: u64,
    pub pairing_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    /// Directory under which simulated devices get their mount points.
    pub watch_root: PathBuf,
    pub watch_directories: Vec<PathBuf>,
    pub rescan_interval_ms: u64,
    pub auto_scan: bool,
    pub supported_formats: Vec<String>,
}

impl Default for HeadUnitConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            seed: None,
            sensor: SensorConfig::default(),
            bluetooth: BluetoothConfig::default(),
            usb: UsbConfig::default(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            i2c_address: 0x48,
            update_interval_ms: 5000,
            temperature_range: [18.0, 25.0],
            humidity_range: [40.0, 60.0],
            pressure_range: [1013.0, 1013.5],
            light_range: [100.0, 1000.0],
            data_logging: false,
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 2000,
            discovery_probability_percent: 10,
            discovery_timeout_ms: None,
            signal_interval_ms: 3000,
            pairing_timeout_ms: 10_000,
            connection_timeout_ms: 15_000,
            auto_reconnect: true,
        }
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            watch_root: PathBuf::from("mnt/usb"),
            watch_directories: vec![
                PathBuf::from("mnt/usb"),
                PathBuf::from("media/usb"),
                PathBuf::from("tmp/usb"),
            ],
            rescan_interval_ms: 10_000,
            auto_scan: true,
            supported_formats: DEFAULT_MEDIA_FORMATS.iter().map(|f| (*f).to_string()).collect(),
        }
    }
}

impl HeadUnitConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("sensor.update_interval_ms", self.sensor.update_interval_ms),
            ("bluetooth.discovery_interval_ms", self.bluetooth.discovery_interval_ms),
            ("bluetooth.signal_interval_ms", self.bluetooth.signal_interval_ms),
            ("usb.rescan_interval_ms", self.usb.rescan_interval_ms),
        ];
        for (field, value) in periods {
            if value == 0 {
                return Err(ConfigError::Validation {
                    field,
                    message: "interval must be greater than zero".into(),
                });
            }
        }

        if self.bluetooth.discovery_probability_percent > 100 {
            return Err(ConfigError::Validation {
                field: "bluetooth.discovery_probability_percent",
                message: format!("{} exceeds 100", self.bluetooth.discovery_probability_percent),
            });
        }

        let ranges = [
            ("sensor.temperature_range", self.sensor.temperature_range),
            ("sensor.humidity_range", self.sensor.humidity_range),
            ("sensor.pressure_range", self.sensor.pressure_range),
            ("sensor.light_range", self.sensor.light_range),
        ];
        for (field, [min, max]) in ranges {
            if !is_valid_range(min, max) {
                return Err(ConfigError::Validation {
                    field,
                    message: format!("[{min}, {max}] is not a valid range"),
                });
            }
        }

        Ok(())
    }

    pub fn sensor_calibration_path(&self) -> PathBuf {
        self.config_dir.join(SENSOR_CALIBRATION_FILE)
    }

    pub fn sensor_data_log_path(&self) -> PathBuf {
        self.config_dir.join(SENSOR_DATA_LOG_FILE)
    }

    pub fn bluetooth_devices_path(&self) -> PathBuf {
        self.config_dir.join(BLUETOOTH_DEVICES_FILE)
    }

    pub fn usb_devices_path(&self) -> PathBuf {
        self.config_dir.join(USB_DEVICES_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_stock_head_unit() {
        let config = HeadUnitConfig::default();
        assert_eq!(config.sensor.update_interval_ms, 5000);
        assert_eq!(config.sensor.i2c_address, 0x48);
        assert_eq!(config.bluetooth.pairing_timeout_ms, 10_000);
        assert_eq!(config.bluetooth.connection_timeout_ms, 15_000);
        assert_eq!(config.bluetooth.signal_interval_ms, 3000);
        assert_eq!(config.usb.rescan_interval_ms, 10_000);
        assert_eq!(config.usb.supported_formats.len(), 14);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides_defaults() {
        let json = r#"{ "seed": 7, "bluetooth": { "pairing_timeout_ms": 500 } }"#;
        let config: HeadUnitConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.bluetooth.pairing_timeout_ms, 500);
        assert_eq!(config.bluetooth.connection_timeout_ms, 15_000);
        assert_eq!(config.sensor, SensorConfig::default());
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let mut config = HeadUnitConfig::default();
        config.usb.rescan_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation { field: "usb.rescan_interval_ms", .. })
        ));
    }

    #[test]
    fn test_validation_rejects_reversed_range() {
        let mut config = HeadUnitConfig::default();
        config.sensor.humidity_range = [60.0, 40.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HeadUnitConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, HeadUnitConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headunit.json");
        let mut config = HeadUnitConfig::default();
        config.seed = Some(42);
        config.usb.auto_scan = false;
        config.save(&path).unwrap();

        assert_eq!(HeadUnitConfig::load(&path).unwrap(), config);
    }
}
