//! Error types for the head unit peripheral layer.
//!
//! Each subsystem reports failures through a narrow error enum that names one
//! class of failure. [`HeadUnitError`] unifies them for callers that drive all
//! three subsystems (the orchestrator and the binaries).
//!
//! Invalid operations on the Bluetooth and USB services keep a boolean
//! contract: the typed errors below are still produced internally and logged,
//! but the public method answers `false` and leaves state untouched.

use std::path::PathBuf;
use thiserror::Error;

/// The simulated I2C sensor could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Connection-error injection is armed; the device never answers.
    #[error("I2C connection failed - device at address {address:#04x} not responding")]
    DeviceNotResponding {
        /// Bus address the caller tried to open.
        address: u8,
    },

    /// A register access was attempted before `connect`.
    #[error("I2C device not connected")]
    NotConnected,
}

/// The simulated Bluetooth radio is unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    /// Radio-off injection is armed.
    #[error("Bluetooth radio is turned off")]
    PoweredOff,

    /// An operation needing the stack ran before `initialize`.
    #[error("Bluetooth stack not initialized")]
    NotInitialized,
}

/// An operation is not valid for the target's capabilities or current state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    /// No device with this id is tracked.
    #[error("Device {0} not found")]
    DeviceNotFound(String),

    /// The device does not advertise the requested profile.
    #[error("Profile {profile} not supported by device {device_id}")]
    ProfileNotSupported {
        /// Target device.
        device_id: String,
        /// Requested profile label.
        profile: String,
    },

    /// The device is in a state that does not allow the operation.
    #[error("Cannot {operation} device {device_id} while {state}")]
    InvalidState {
        /// Target device.
        device_id: String,
        /// Operation that was refused.
        operation: &'static str,
        /// Human-readable current state.
        state: String,
    },

    /// A generation range is empty, reversed or not finite.
    #[error("Invalid {channel} range [{min}, {max}]")]
    InvalidRange {
        /// Channel name.
        channel: &'static str,
        /// Requested lower bound.
        min: f64,
        /// Requested upper bound.
        max: f64,
    },
}

/// Reading or writing a persisted JSON file failed.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A sensor reading was marked invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataValidityError {
    #[error("Sensor failure - invalid readings")]
    SensorFailure,
}

/// The virtual clock refused to arm a timer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("Timer queue full ({capacity} timers pending)")]
    QueueFull { capacity: usize },

    #[error("Recurring timer period must be greater than zero")]
    ZeroPeriod,
}

/// Loading or validating the simulator configuration failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {message}")]
    Validation { field: &'static str, message: String },
}

/// Unified error for code that drives every subsystem.
#[derive(Debug, Error)]
pub enum HeadUnitError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Radio(#[from] RadioError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    DataValidity(#[from] DataValidityError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, HeadUnitError>;

impl HeadUnitError {
    /// Injected hardware failures: I2C unreachable or radio off.
    #[must_use]
    pub fn is_hardware_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Radio(_))
    }

    /// Failures that only affect on-disk state; the simulation keeps running.
    #[must_use]
    pub fn is_persistence_error(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Config(_))
    }

    /// Stable machine-readable code, used in command responses.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Radio(_) => "RADIO_ERROR",
            Self::Capability(_) => "CAPABILITY_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::DataValidity(_) => "DATA_VALIDITY_ERROR",
            Self::Clock(_) => "CLOCK_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_message_includes_address() {
        let err = ConnectionError::DeviceNotResponding { address: 0x48 };
        assert!(err.to_string().contains("0x48"));
    }

    #[test]
    fn test_error_classification() {
        assert!(HeadUnitError::from(RadioError::PoweredOff).is_hardware_error());
        assert!(HeadUnitError::from(ConnectionError::NotConnected).is_hardware_error());
        assert!(!HeadUnitError::from(ClockError::ZeroPeriod).is_hardware_error());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = HeadUnitError::from(PersistenceError::Write {
            path: PathBuf::from("config/x.json"),
            source: io,
        });
        assert!(err.is_persistence_error());
        assert_eq!(err.error_code(), "PERSISTENCE_ERROR");
    }

    #[test]
    fn test_capability_error_display() {
        let err = CapabilityError::ProfileNotSupported {
            device_id: "BT_1".into(),
            profile: "HID".into(),
        };
        assert_eq!(err.to_string(), "Profile HID not supported by device BT_1");

        let err = CapabilityError::InvalidState {
            device_id: "BT_2".into(),
            operation: "pair",
            state: "Pairing".into(),
        };
        assert_eq!(err.to_string(), "Cannot pair device BT_2 while Pairing");
    }

    #[test]
    fn test_errors_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HeadUnitError>();
    }
}
