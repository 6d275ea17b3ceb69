use crate::subsystems::SubsystemId;
use heapless::Vec;
use serde::{Deserialize, Serialize};

const MAX_ARMED_FAULTS: usize = 16;

/// Deterministic failure toggles. An armed fault forces the next relevant
/// operation(s) of its subsystem to fail until it is disarmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectedFault {
    // Sensor
    SensorFailure,
    SensorConnectionError,
    SensorDataCorruption,
    // Bluetooth
    RadioOff,
    PairingError,
    ConnectionError,
    Interference,
    LowBattery,
    // USB
    MountError,
    FileSystemError,
    CorruptedFiles,
}

impl InjectedFault {
    pub fn subsystem(self) -> SubsystemId {
        match self {
            Self::SensorFailure | Self::SensorConnectionError | Self::SensorDataCorruption => {
                SubsystemId::Sensor
            }
            Self::RadioOff
            | Self::PairingError
            | Self::ConnectionError
            | Self::Interference
            | Self::LowBattery => SubsystemId::Bluetooth,
            Self::MountError | Self::FileSystemError | Self::CorruptedFiles => SubsystemId::Usb,
        }
    }
}

/// Injection statistics, reported alongside subsystem status.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FaultInjectionStats {
    pub total_armed: u32,
    pub total_disarmed: u32,
    pub total_triggered: u32,
    pub currently_armed: u8,
}

/// Set of armed faults for one subsystem.
#[derive(Debug)]
pub struct FaultInjector {
    subsystem: SubsystemId,
    armed: Vec<InjectedFault, MAX_ARMED_FAULTS>,
    stats: FaultInjectionStats,
}

impl FaultInjector {
    pub fn new(subsystem: SubsystemId) -> Self {
        Self {
            subsystem,
            armed: Vec::new(),
            stats: FaultInjectionStats::default(),
        }
    }

    /// Arm or disarm `fault`. Returns `true` if the armed set changed.
    ///
    /// Faults that belong to another subsystem are ignored.
    pub fn set(&mut self, fault: InjectedFault, enabled: bool) -> bool {
        if fault.subsystem() != self.subsystem {
            return false;
        }

        let position = self.armed.iter().position(|f| *f == fault);
        let changed = match (enabled, position) {
            (true, None) => {
                // One slot per variant, capacity cannot run out
                let _ = self.armed.push(fault);
                self.stats.total_armed += 1;
                true
            }
            (false, Some(index)) => {
                self.armed.swap_remove(index);
                self.stats.total_disarmed += 1;
                true
            }
            _ => false,
        };

        self.stats.currently_armed = self.armed.len() as u8;
        changed
    }

    pub fn is_armed(&self, fault: InjectedFault) -> bool {
        self.armed.contains(&fault)
    }

    /// Check `fault` at a transition point, counting it when it fires.
    pub fn trigger(&mut self, fault: InjectedFault) -> bool {
        let armed = self.is_armed(fault);
        if armed {
            self.stats.total_triggered += 1;
        }
        armed
    }

    pub fn clear_all(&mut self) {
        self.stats.total_disarmed += self.armed.len() as u32;
        self.armed.clear();
        self.stats.currently_armed = 0;
    }

    pub fn get_armed(&self) -> &[InjectedFault] {
        &self.armed
    }

    pub fn get_stats(&self) -> &FaultInjectionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injector_creation() {
        let injector = FaultInjector::new(SubsystemId::Sensor);
        assert!(injector.get_armed().is_empty());
        assert_eq!(injector.get_stats().total_armed, 0);
    }

    #[test]
    fn test_arm_and_disarm() {
        let mut injector = FaultInjector::new(SubsystemId::Bluetooth);

        assert!(injector.set(InjectedFault::RadioOff, true));
        assert!(!injector.set(InjectedFault::RadioOff, true));
        assert!(injector.is_armed(InjectedFault::RadioOff));

        assert!(injector.set(InjectedFault::RadioOff, false));
        assert!(!injector.is_armed(InjectedFault::RadioOff));
        assert_eq!(injector.get_stats().total_armed, 1);
        assert_eq!(injector.get_stats().total_disarmed, 1);
    }

    #[test]
    fn test_foreign_fault_ignored() {
        let mut injector = FaultInjector::new(SubsystemId::Usb);
        assert!(!injector.set(InjectedFault::SensorFailure, true));
        assert!(!injector.is_armed(InjectedFault::SensorFailure));
    }

    #[test]
    fn test_trigger_counts_only_armed() {
        let mut injector = FaultInjector::new(SubsystemId::Usb);
        assert!(!injector.trigger(InjectedFault::MountError));
        injector.set(InjectedFault::MountError, true);
        assert!(injector.trigger(InjectedFault::MountError));
        assert!(injector.trigger(InjectedFault::MountError));
        assert_eq!(injector.get_stats().total_triggered, 2);
    }

    #[test]
    fn test_clear_all() {
        let mut injector = FaultInjector::new(SubsystemId::Usb);
        injector.set(InjectedFault::MountError, true);
        injector.set(InjectedFault::CorruptedFiles, true);
        injector.clear_all();
        assert!(injector.get_armed().is_empty());
        assert_eq!(injector.get_stats().total_disarmed, 2);
    }
}
