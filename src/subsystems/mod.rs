pub mod bluetooth;
pub mod sensor;
pub mod usb;

pub use bluetooth::{BluetoothDevice, BluetoothEvent, BluetoothStack, ConnectionState, DeviceType};
pub use sensor::{SensorChannel, SensorEvent, SensorReading, SensorSimulator};
pub use usb::{MediaFile, RemovableMediaTracker, UsbDevice, UsbEvent};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemId {
    Sensor,
    Bluetooth,
    Usb,
}

/// Common surface of the three peripheral services.
///
/// Every service runs on the caller's event loop: `advance_to` fires the
/// timers that fell due up to `now_ms` and returns without blocking.
pub trait Subsystem {
    type Event: Clone + Serialize;

    fn id(&self) -> SubsystemId;
    fn advance_to(&mut self, now_ms: u64);
    fn drain_events(&mut self) -> Vec<Self::Event>;
    /// Cancel every timer and flush persisted state.
    fn shutdown(&mut self);
    fn is_healthy(&self) -> bool;
}

/// Build a generator for one subsystem. With a fixed seed each subsystem
/// still gets its own stream so their sequences do not mirror each other.
pub(crate) fn subsystem_rng(seed: Option<u64>, subsystem: SubsystemId) -> StdRng {
    let stream = match subsystem {
        SubsystemId::Sensor => 0x5E45_0000_0000_0001,
        SubsystemId::Bluetooth => 0xB7B7_0000_0000_0002,
        SubsystemId::Usb => 0x05B0_0000_0000_0003,
    };
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ stream),
        None => StdRng::from_entropy(),
    }
}
