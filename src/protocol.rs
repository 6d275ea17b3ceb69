use crate::fault_injection::InjectedFault;
use crate::subsystems::sensor::is_valid_range;
use crate::subsystems::{SensorChannel, SubsystemId};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub const MAX_COMMAND_SIZE: usize = 1024;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;

/// A UI-layer request, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandType {
    Ping,
    SystemStatus,

    // Sensor
    SensorConnect { address: Option<u8> },
    SensorDisconnect,
    SensorRead,
    SensorReadRegister { register: u8 },
    SensorWriteRegister { register: u8, value: u8 },
    SensorSetRange { channel: SensorChannel, min: f64, max: f64 },
    SensorCalibrate { channel: SensorChannel, offset: f64 },
    SensorSetUpdateInterval { interval_ms: u64 },
    SensorSetDataLogging { enabled: bool },

    // Bluetooth
    BluetoothInitialize,
    StartDiscovery,
    StopDiscovery,
    Pair { device_id: String },
    Unpair { device_id: String },
    Connect { device_id: String },
    Disconnect { device_id: String },
    EnableProfile { device_id: String, profile: String },
    DisableProfile { device_id: String, profile: String },
    SimulateDeviceAppearance { name: String, device_type: String },
    SimulateDeviceDisappearance { device_id: String },
    UpdateSignalStrength { device_id: String, strength: i32 },
    SetPairingTimeout { timeout_ms: u64 },
    SetConnectionTimeout { timeout_ms: u64 },
    SetDiscoveryTimeout { timeout_ms: Option<u64> },
    SetAutoReconnect { enabled: bool },
    ListBluetoothDevices,

    // USB
    StartUsbMonitoring,
    StopUsbMonitoring,
    SimulateUsbInsertion { name: String },
    SimulateUsbRemoval { device_id: Option<String> },
    Mount { device_id: String, mount_point: PathBuf },
    Unmount { device_id: String },
    ScanMedia { device_id: String },
    AddMediaFile { device_id: String, path: PathBuf },
    RemoveMediaFile { device_id: String, file_name: String },
    ListUsbDevices,
    ListMedia { device_id: String },
    SetSupportedFormats { formats: Vec<String> },
    SetWatchDirectories { directories: Vec<PathBuf> },
    SetAutoScan { enabled: bool },

    // Error injection
    InjectFault {
        fault: InjectedFault,
        enabled: bool,
        /// Narrows pairing/connection faults to one Bluetooth device.
        device_id: Option<String>,
    },
    ClearFaults { target: Option<SubsystemId> },
    GetFaultInjectionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub status: ResponseStatus,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    /// Accepted but refused by the subsystem; nothing changed.
    Error,
    InvalidCommand,
    /// Rejected before reaching a subsystem.
    NegativeAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Message exceeds buffer size")]
    MessageTooLarge,
    #[error("Serialization failed")]
    SerializationError,
    #[error("Invalid command")]
    InvalidCommand,
    #[error("Invalid parameter")]
    InvalidParameter,
}

#[derive(Debug, Default)]
pub struct ProtocolHandler {
    command_counter: u32,
    command_buffer: CommandBuffer,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_command(&mut self, json_str: &str) -> Result<Command, ProtocolError> {
        self.command_buffer.clear();
        let trimmed = json_str.trim();
        self.command_buffer
            .try_push_str(trimmed)
            .map_err(|_| ProtocolError::MessageTooLarge)?;

        serde_json::from_str::<Command>(&self.command_buffer).map_err(|_| ProtocolError::InvalidJson)
    }

    pub fn serialize_response(&self, response: &CommandResponse) -> Result<String, ProtocolError> {
        serde_json::to_string(response).map_err(|_| ProtocolError::SerializationError)
    }

    pub fn create_response(&mut self, command_id: u32, status: ResponseStatus, message: Option<&str>) -> CommandResponse {
        self.command_counter = self.command_counter.wrapping_add(1);
        CommandResponse {
            id: command_id,
            status,
            message: message.map(str::to_string),
            data: None,
        }
    }

    pub fn create_nack_response(&mut self, command_id: u32, reason: &str) -> CommandResponse {
        self.create_response(command_id, ResponseStatus::NegativeAck, Some(reason))
    }

    /// Number of responses produced so far.
    pub fn processed(&self) -> u32 {
        self.command_counter
    }

    pub fn validate_command(&self, command: &Command) -> Result<(), ProtocolError> {
        if command.id == 0 {
            return Err(ProtocolError::InvalidCommand);
        }

        let valid = match &command.command_type {
            CommandType::SensorSetRange { min, max, .. } => is_valid_range(*min, *max),
            CommandType::SensorCalibrate { offset, .. } => offset.is_finite(),
            CommandType::SensorSetUpdateInterval { interval_ms } => *interval_ms > 0,
            CommandType::SimulateDeviceAppearance { name, device_type } => {
                !name.trim().is_empty() && device_type.parse::<crate::subsystems::DeviceType>().is_ok()
            }
            CommandType::SimulateUsbInsertion { name } => !name.trim().is_empty(),
            CommandType::SetSupportedFormats { formats } => {
                !formats.is_empty() && formats.iter().all(|f| !f.trim().is_empty())
            }
            CommandType::EnableProfile { profile, .. } | CommandType::DisableProfile { profile, .. } => {
                !profile.trim().is_empty()
            }
            CommandType::InjectFault {
                fault,
                device_id: Some(_),
                ..
            } => matches!(fault, InjectedFault::PairingError | InjectedFault::ConnectionError),
            _ => true,
        };

        if valid {
            Ok(())
        } else {
            Err(ProtocolError::InvalidParameter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_command() {
        let mut handler = ProtocolHandler::new();
        let command = handler
            .parse_command(r#"{"id":1,"command_type":"StartDiscovery"}"#)
            .unwrap();
        assert_eq!(command.id, 1);
        assert!(matches!(command.command_type, CommandType::StartDiscovery));
    }

    #[test]
    fn test_parse_struct_command() {
        let mut handler = ProtocolHandler::new();
        let command = handler
            .parse_command(r#"{"id":2,"command_type":{"SensorCalibrate":{"channel":"humidity","offset":-1.5}}}"#)
            .unwrap();
        match command.command_type {
            CommandType::SensorCalibrate { channel, offset } => {
                assert_eq!(channel, SensorChannel::Humidity);
                assert_eq!(offset, -1.5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_garbage_and_oversize() {
        let mut handler = ProtocolHandler::new();
        assert!(matches!(handler.parse_command("{nope"), Err(ProtocolError::InvalidJson)));
        let huge = format!(r#"{{"id":1,"command_type":{{"SimulateUsbInsertion":{{"name":"{}"}}}}}}"#, "x".repeat(2000));
        assert!(matches!(handler.parse_command(&huge), Err(ProtocolError::MessageTooLarge)));
    }

    #[test]
    fn test_validation() {
        let handler = ProtocolHandler::new();
        let command = |command_type| Command { id: 5, command_type };

        assert!(handler.validate_command(&command(CommandType::Ping)).is_ok());
        assert_eq!(
            handler.validate_command(&Command { id: 0, command_type: CommandType::Ping }),
            Err(ProtocolError::InvalidCommand)
        );
        assert_eq!(
            handler.validate_command(&command(CommandType::SensorSetRange {
                channel: SensorChannel::Light,
                min: 10.0,
                max: 1.0,
            })),
            Err(ProtocolError::InvalidParameter)
        );
        assert_eq!(
            handler.validate_command(&command(CommandType::SensorSetRange {
                channel: SensorChannel::Light,
                min: -f64::MAX,
                max: f64::MAX,
            })),
            Err(ProtocolError::InvalidParameter)
        );
        assert_eq!(
            handler.validate_command(&command(CommandType::SimulateDeviceAppearance {
                name: "Thing".into(),
                device_type: "toaster".into(),
            })),
            Err(ProtocolError::InvalidParameter)
        );
        assert_eq!(
            handler.validate_command(&command(CommandType::InjectFault {
                fault: InjectedFault::RadioOff,
                enabled: true,
                device_id: Some("BT_1".into()),
            })),
            Err(ProtocolError::InvalidParameter)
        );
    }

    #[test]
    fn test_response_omits_empty_data() {
        let mut handler = ProtocolHandler::new();
        let response = handler.create_response(3, ResponseStatus::Success, None);
        let json = handler.serialize_response(&response).unwrap();
        assert_eq!(json, r#"{"id":3,"status":"Success","message":null}"#);
        assert_eq!(handler.processed(), 1);
    }
}
