use crate::persistence::{iso_format_opt, wall_clock_format};
use arrayvec::ArrayString;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `XX:XX:XX:XX:XX:XX`
pub type DeviceAddress = ArrayString<17>;

/// Category tag driving generated names, profiles and vendor metadata.
/// Persisted as its discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DeviceType {
    Phone = 0,
    Headset = 1,
    Speaker = 2,
    CarAudio = 3,
    Smartwatch = 4,
    Tablet = 5,
    Laptop = 6,
}

impl DeviceType {
    pub const ALL: [DeviceType; 7] = [
        Self::Phone,
        Self::Headset,
        Self::Speaker,
        Self::CarAudio,
        Self::Smartwatch,
        Self::Tablet,
        Self::Laptop,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::Headset => "headset",
            Self::Speaker => "speaker",
            Self::CarAudio => "car-audio",
            Self::Smartwatch => "smartwatch",
            Self::Tablet => "tablet",
            Self::Laptop => "laptop",
        }
    }
}

impl From<DeviceType> for u8 {
    fn from(value: DeviceType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for DeviceType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| format!("invalid device type {value}"))
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|t| t.label() == normalized || (normalized == "car" && *t == Self::CarAudio))
            .ok_or_else(|| format!("unknown device type '{s}'"))
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-device link state. Persisted as its discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ConnectionState {
    Disconnected = 0,
    Searching = 1,
    Connecting = 2,
    Connected = 3,
    Pairing = 4,
    Paired = 5,
    Error = 6,
}

impl ConnectionState {
    const ALL: [ConnectionState; 7] = [
        Self::Disconnected,
        Self::Searching,
        Self::Connecting,
        Self::Connected,
        Self::Pairing,
        Self::Paired,
        Self::Error,
    ];

    /// A timer is outstanding for this state.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pairing | Self::Connecting)
    }
}

impl From<ConnectionState> for u8 {
    fn from(value: ConnectionState) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for ConnectionState {
    type Error = String;

    // `Self::Error` would be ambiguous with the `Error` variant
    fn try_from(value: u8) -> Result<Self, String> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| format!("invalid connection state {value}"))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Searching => "Searching",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Pairing => "Pairing",
            Self::Paired => "Paired",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

/// One remote device as the registry tracks it, and as it is written to
/// `bluetooth_devices.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BluetoothDevice {
    pub device_id: String,
    pub device_name: String,
    pub device_address: DeviceAddress,
    pub device_type: DeviceType,
    pub connection_state: ConnectionState,
    pub is_paired: bool,
    pub is_trusted: bool,
    pub signal_strength: u8,
    #[serde(with = "wall_clock_format")]
    pub last_seen: NaiveDateTime,
    #[serde(with = "iso_format_opt", default)]
    pub paired_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub supported_profiles: Vec<String>,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub firmware_version: String,
}

impl BluetoothDevice {
    /// Case-insensitive profile lookup.
    pub fn supports_profile(&self, profile: &str) -> bool {
        self.supported_profiles
            .iter()
            .any(|p| p.eq_ignore_ascii_case(profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enums_serialize_as_integers() {
        assert_eq!(serde_json::to_string(&DeviceType::CarAudio).unwrap(), "3");
        assert_eq!(serde_json::to_string(&ConnectionState::Paired).unwrap(), "5");
        assert_eq!(serde_json::from_str::<DeviceType>("6").unwrap(), DeviceType::Laptop);
        assert!(serde_json::from_str::<ConnectionState>("9").is_err());
    }

    #[test]
    fn test_device_type_from_str() {
        assert_eq!("car_audio".parse::<DeviceType>(), Ok(DeviceType::CarAudio));
        assert_eq!("Headset".parse::<DeviceType>(), Ok(DeviceType::Headset));
        assert!("toaster".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_device_wire_format() {
        let json = r#"{
            "deviceId": "BT_1",
            "deviceName": "JBL Flip",
            "deviceAddress": "0A:1B:2C:3D:4E:5F",
            "deviceType": 2,
            "connectionState": 5,
            "isPaired": true,
            "isTrusted": false,
            "signalStrength": 80,
            "lastSeen": "2025-05-01 12:00:00",
            "pairedTime": "2025-05-01T12:00:10",
            "supportedProfiles": ["A2DP", "AVRCP"],
            "manufacturer": "JBL",
            "model": "Flip",
            "firmwareVersion": "1.0.0"
        }"#;

        let device: BluetoothDevice = serde_json::from_str(json).unwrap();
        assert_eq!(device.device_type, DeviceType::Speaker);
        assert_eq!(device.connection_state, ConnectionState::Paired);
        assert!(device.paired_time.is_some());
        assert!(device.supports_profile("a2dp"));
        assert!(!device.supports_profile("HFP"));

        let value = serde_json::to_value(&device).unwrap();
        assert_eq!(value["deviceType"], 2);
        assert_eq!(value["lastSeen"], "2025-05-01 12:00:00");
        assert_eq!(value["pairedTime"], "2025-05-01T12:00:10");
    }
}
