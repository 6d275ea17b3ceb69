use super::device::{BluetoothDevice, ConnectionState};
use tracing::warn;

/// Owns every known device, each in exactly one of two collections.
///
/// A device enters `available` when it is discovered and moves to `paired`
/// only when pairing completes. Unpairing removes it outright.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    available: Vec<BluetoothDevice>,
    paired: Vec<BluetoothDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the paired collection from persisted state. Duplicate ids keep
    /// the first entry.
    pub fn with_paired(devices: Vec<BluetoothDevice>) -> Self {
        let mut registry = Self::new();
        for device in devices {
            if registry.contains(&device.device_id) {
                warn!("Skipping duplicate paired device {}", device.device_id);
                continue;
            }
            registry.paired.push(device);
        }
        registry
    }

    pub fn available(&self) -> &[BluetoothDevice] {
        &self.available
    }

    pub fn paired(&self) -> &[BluetoothDevice] {
        &self.paired
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }

    pub fn get(&self, device_id: &str) -> Option<&BluetoothDevice> {
        self.find_available(device_id)
            .or_else(|| self.find_paired(device_id))
    }

    pub fn get_mut(&mut self, device_id: &str) -> Option<&mut BluetoothDevice> {
        if let Some(index) = self.available.iter().position(|d| d.device_id == device_id) {
            return self.available.get_mut(index);
        }
        self.paired_mut(device_id)
    }

    pub fn find_available(&self, device_id: &str) -> Option<&BluetoothDevice> {
        self.available.iter().find(|d| d.device_id == device_id)
    }

    pub fn find_paired(&self, device_id: &str) -> Option<&BluetoothDevice> {
        self.paired.iter().find(|d| d.device_id == device_id)
    }

    pub fn paired_mut(&mut self, device_id: &str) -> Option<&mut BluetoothDevice> {
        self.paired.iter_mut().find(|d| d.device_id == device_id)
    }

    pub fn is_paired(&self, device_id: &str) -> bool {
        self.find_paired(device_id).is_some_and(|d| d.is_paired)
    }

    /// Add a freshly discovered device. Returns `false` if the id is taken.
    pub fn insert_available(&mut self, device: BluetoothDevice) -> bool {
        if self.contains(&device.device_id) {
            return false;
        }
        self.available.push(device);
        true
    }

    pub fn remove_available(&mut self, device_id: &str) -> Option<BluetoothDevice> {
        let index = self.available.iter().position(|d| d.device_id == device_id)?;
        Some(self.available.remove(index))
    }

    pub fn remove_paired(&mut self, device_id: &str) -> Option<BluetoothDevice> {
        let index = self.paired.iter().position(|d| d.device_id == device_id)?;
        Some(self.paired.remove(index))
    }

    /// Move a device from `available` to `paired`, applying `complete` to it
    /// on the way.
    pub fn promote<F>(&mut self, device_id: &str, complete: F) -> Option<&BluetoothDevice>
    where
        F: FnOnce(&mut BluetoothDevice),
    {
        let mut device = self.remove_available(device_id)?;
        complete(&mut device);
        self.paired.push(device);
        self.paired.last()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BluetoothDevice> {
        self.available.iter_mut().chain(self.paired.iter_mut())
    }

    pub fn connection_state(&self, device_id: &str) -> Option<ConnectionState> {
        self.get(device_id).map(|d| d.connection_state)
    }

    pub fn len(&self) -> usize {
        self.available.len() + self.paired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::bluetooth::device::{DeviceAddress, DeviceType};

    fn device(id: &str) -> BluetoothDevice {
        BluetoothDevice {
            device_id: id.to_string(),
            device_name: "Test".into(),
            device_address: DeviceAddress::from("00:11:22:33:44:55").unwrap(),
            device_type: DeviceType::Phone,
            connection_state: ConnectionState::Disconnected,
            is_paired: false,
            is_trusted: false,
            signal_strength: 80,
            last_seen: chrono::Local::now().naive_local(),
            paired_time: None,
            supported_profiles: vec!["A2DP".into()],
            manufacturer: String::new(),
            model: String::new(),
            firmware_version: String::new(),
        }
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.insert_available(device("BT_1")));
        assert!(!registry.insert_available(device("BT_1")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_promote_moves_between_collections() {
        let mut registry = DeviceRegistry::new();
        registry.insert_available(device("BT_1"));

        let paired = registry
            .promote("BT_1", |d| {
                d.is_paired = true;
                d.connection_state = ConnectionState::Paired;
            })
            .unwrap();
        assert_eq!(paired.connection_state, ConnectionState::Paired);

        assert!(registry.available().is_empty());
        assert_eq!(registry.paired().len(), 1);
        assert!(registry.is_paired("BT_1"));
        assert!(registry.promote("BT_1", |_| {}).is_none());
    }

    #[test]
    fn test_paired_insert_blocks_available_duplicate() {
        let mut registry = DeviceRegistry::with_paired(vec![device("BT_9")]);
        assert!(!registry.insert_available(device("BT_9")));
        assert!(registry.find_available("BT_9").is_none());
    }

    #[test]
    fn test_with_paired_skips_duplicates() {
        let registry = DeviceRegistry::with_paired(vec![device("BT_1"), device("BT_1")]);
        assert_eq!(registry.paired().len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut registry = DeviceRegistry::with_paired(vec![device("BT_2")]);
        registry.insert_available(device("BT_3"));
        assert!(registry.remove_paired("BT_3").is_none());
        assert!(registry.remove_available("BT_3").is_some());
        assert!(registry.remove_paired("BT_2").is_some());
        assert!(registry.is_empty());
    }
}
