use crate::config::HeadUnitConfig;
use crate::error::{CapabilityError, HeadUnitError};
use crate::fault_injection::{FaultInjectionStats, InjectedFault};
use crate::notifications::Notification;
use crate::persistence::JsonStore;
use crate::protocol::{Command, CommandResponse, CommandType, ProtocolError, ProtocolHandler, ResponseStatus};
use crate::subsystems::usb::media::media_file_from_path;
use crate::subsystems::{
    BluetoothStack, DeviceType, RemovableMediaTracker, SensorReading, SensorSimulator, Subsystem, SubsystemId,
};
use heapless::spsc::Queue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MAX_COMMAND_QUEUE_SIZE: usize = 32;

type CommandQueue = Queue<Command, MAX_COMMAND_QUEUE_SIZE>;
type Outcome = Result<Option<Value>, String>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeadUnitState {
    pub running: bool,
    /// Virtual time reached by the last `advance_to`.
    pub now_ms: u64,
    pub command_count: u32,
    pub notification_count: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeadUnitStatus {
    pub state: HeadUnitState,
    pub sensor: SensorStatus,
    pub bluetooth: BluetoothStatus,
    pub usb: UsbStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorStatus {
    pub connected: bool,
    pub healthy: bool,
    pub address: u8,
    pub update_interval_ms: u64,
    pub reading: SensorReading,
    pub armed_faults: Vec<InjectedFault>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BluetoothStatus {
    pub initialized: bool,
    pub discovering: bool,
    pub available_devices: usize,
    pub paired_devices: usize,
    pub armed_faults: Vec<InjectedFault>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsbStatus {
    pub monitoring: bool,
    pub connected_devices: usize,
    pub known_devices: usize,
    pub armed_faults: Vec<InjectedFault>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Command queue full")]
    CommandQueueFull,
}

/// Owns the three peripheral services and drives them from one event loop.
///
/// All state changes happen inside `&mut self` calls; callers that share a
/// head unit across tasks wrap it in a mutex.
pub struct HeadUnit {
    config: HeadUnitConfig,
    sensor: SensorSimulator,
    bluetooth: BluetoothStack,
    usb: RemovableMediaTracker,
    protocol_handler: ProtocolHandler,
    state: HeadUnitState,
    start_time: Instant,
    command_queue: CommandQueue,
    responses: Vec<CommandResponse>,
}

impl HeadUnit {
    /// Build every subsystem from `config`, restoring persisted state from
    /// `config.config_dir`.
    pub fn new(config: HeadUnitConfig) -> Self {
        let seed = config.seed;
        let sensor = SensorSimulator::new(&config.sensor, seed)
            .with_store(JsonStore::new(config.sensor_calibration_path()))
            .with_data_log(JsonStore::new(config.sensor_data_log_path()));
        let bluetooth = BluetoothStack::new(&config.bluetooth, seed)
            .with_store(JsonStore::new(config.bluetooth_devices_path()));
        let usb = RemovableMediaTracker::new(&config.usb, seed)
            .with_store(JsonStore::new(config.usb_devices_path()));

        Self {
            config,
            sensor,
            bluetooth,
            usb,
            protocol_handler: ProtocolHandler::new(),
            state: HeadUnitState::default(),
            start_time: Instant::now(),
            command_queue: Queue::new(),
            responses: Vec::new(),
        }
    }

    /// Bring every subsystem up. A subsystem that fails to start is logged
    /// and left down; the others keep running.
    pub fn start(&mut self) {
        self.state.running = true;
        self.start_time = Instant::now();
        info!("Head unit starting");

        match self.sensor.connect(self.config.sensor.i2c_address) {
            Ok(()) => info!("  Sensor: connected"),
            Err(e) => self.record_error(HeadUnitError::from(e)),
        }
        match self.bluetooth.initialize() {
            Ok(()) => info!("  Bluetooth: initialized"),
            Err(e) => self.record_error(HeadUnitError::from(e)),
        }
        self.usb.start_monitoring();
        info!("  USB: monitoring");
    }

    pub fn stop(&mut self) {
        if !self.state.running {
            return;
        }
        self.state.running = false;
        self.sensor.shutdown();
        self.bluetooth.shutdown();
        self.usb.shutdown();
        info!("Head unit stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    /// Fire everything due up to virtual time `now_ms`.
    pub fn advance_to(&mut self, now_ms: u64) {
        if !self.state.running {
            return;
        }
        let now_ms = now_ms.max(self.state.now_ms);
        self.state.now_ms = now_ms;

        self.sensor.advance_to(now_ms);
        self.bluetooth.advance_to(now_ms);
        self.usb.advance_to(now_ms);
    }

    /// Advance by `delta_ms` of virtual time.
    pub fn advance_by(&mut self, delta_ms: u64) {
        self.advance_to(self.state.now_ms.saturating_add(delta_ms));
    }

    /// Run queued commands, then advance to wall-clock time since `start`.
    pub fn update(&mut self) -> Result<(), AgentError> {
        if !self.state.running {
            return Ok(());
        }
        self.process_commands()?;
        let elapsed = u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.advance_to(elapsed);
        Ok(())
    }

    /// Everything the subsystems reported since the last call.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut notifications: Vec<Notification> = Vec::new();
        notifications.extend(self.sensor.drain_events().into_iter().map(Notification::from));
        notifications.extend(self.bluetooth.drain_events().into_iter().map(Notification::from));
        notifications.extend(self.usb.drain_events().into_iter().map(Notification::from));
        self.state.notification_count += notifications.len() as u64;
        notifications
    }

    pub fn queue_command(&mut self, command: Command) -> Result<(), AgentError> {
        self.command_queue
            .enqueue(command)
            .map_err(|_| AgentError::CommandQueueFull)
    }

    pub fn process_commands(&mut self) -> Result<(), AgentError> {
        while let Some(command) = self.command_queue.dequeue() {
            let response = self.execute_command(command);
            self.responses.push(response);
        }
        Ok(())
    }

    pub fn get_responses(&mut self) -> Vec<CommandResponse> {
        std::mem::take(&mut self.responses)
    }

    /// Parse one JSON command line, run it and return the JSON response.
    pub fn handle_json(&mut self, line: &str) -> Result<String, AgentError> {
        let response = match self.protocol_handler.parse_command(line) {
            Ok(command) => self.execute_command(command),
            Err(e) => {
                debug!("Rejected command line: {e}");
                self.protocol_handler
                    .create_response(0, ResponseStatus::InvalidCommand, Some(&e.to_string()))
            }
        };
        Ok(self.protocol_handler.serialize_response(&response)?)
    }

    pub fn execute_command(&mut self, command: Command) -> CommandResponse {
        self.state.command_count = self.state.command_count.saturating_add(1);

        if let Err(e) = self.protocol_handler.validate_command(&command) {
            return self
                .protocol_handler
                .create_nack_response(command.id, &format!("Command validation failed: {e}"));
        }

        match self.dispatch(command.command_type) {
            Ok(data) => {
                let mut response = self.protocol_handler.create_response(command.id, ResponseStatus::Success, None);
                response.data = data;
                response
            }
            Err(message) => {
                warn!("Command {} failed: {message}", command.id);
                self.state.last_error = Some(message.clone());
                self.protocol_handler
                    .create_response(command.id, ResponseStatus::Error, Some(&message))
            }
        }
    }

    fn dispatch(&mut self, command_type: CommandType) -> Outcome {
        match command_type {
            CommandType::Ping => done(),
            CommandType::SystemStatus => to_data(&self.status()),

            CommandType::SensorConnect { address } => {
                let address = address.unwrap_or(self.config.sensor.i2c_address);
                self.sensor.connect(address).map_err(|e| e.to_string())?;
                done()
            }
            CommandType::SensorDisconnect => {
                self.sensor.disconnect();
                done()
            }
            CommandType::SensorRead => to_data(self.sensor.current_reading()),
            CommandType::SensorReadRegister { register } => {
                Ok(Some(Value::from(self.sensor.read_register(register))))
            }
            CommandType::SensorWriteRegister { register, value } => check(
                self.sensor.write_register(register, value),
                || format!("Register {register:#04x} is read-only"),
            ),
            CommandType::SensorSetRange { channel, min, max } => {
                self.sensor.set_range(channel, min, max).map_err(|e| e.to_string())?;
                done()
            }
            CommandType::SensorCalibrate { channel, offset } => {
                self.sensor.calibrate(channel, offset);
                done()
            }
            CommandType::SensorSetUpdateInterval { interval_ms } => {
                self.sensor.set_update_interval(interval_ms).map_err(|e| e.to_string())?;
                done()
            }
            CommandType::SensorSetDataLogging { enabled } => {
                self.sensor.enable_data_logging(enabled);
                done()
            }

            CommandType::BluetoothInitialize => {
                self.bluetooth.initialize().map_err(|e| e.to_string())?;
                done()
            }
            CommandType::StartDiscovery => {
                check(self.bluetooth.start_discovery(), || "Discovery could not start".into())
            }
            CommandType::StopDiscovery => {
                self.bluetooth.stop_discovery();
                done()
            }
            CommandType::Pair { device_id } => {
                let ok = self.bluetooth.pair(&device_id);
                check(ok, || format!("Pairing refused for {device_id}"))
            }
            CommandType::Unpair { device_id } => {
                let ok = self.bluetooth.unpair(&device_id);
                check(ok, || CapabilityError::DeviceNotFound(device_id).to_string())
            }
            CommandType::Connect { device_id } => {
                let ok = self.bluetooth.connect(&device_id);
                check(ok, || format!("Connection refused for {device_id}"))
            }
            CommandType::Disconnect { device_id } => {
                let ok = self.bluetooth.disconnect(&device_id);
                check(ok, || format!("{device_id} is not connected"))
            }
            CommandType::EnableProfile { device_id, profile } => {
                let ok = self.bluetooth.enable_profile(&device_id, &profile);
                check(ok, || format!("Cannot enable {profile} on {device_id}"))
            }
            CommandType::DisableProfile { device_id, profile } => {
                let ok = self.bluetooth.disable_profile(&device_id, &profile);
                check(ok, || format!("Cannot disable {profile} on {device_id}"))
            }
            CommandType::SimulateDeviceAppearance { name, device_type } => {
                let device_type: DeviceType = device_type.parse()?;
                let device_id = self.bluetooth.simulate_device_appearance(&name, device_type);
                Ok(Some(Value::from(device_id)))
            }
            CommandType::SimulateDeviceDisappearance { device_id } => {
                let ok = self.bluetooth.simulate_device_disappearance(&device_id);
                check(ok, || CapabilityError::DeviceNotFound(device_id).to_string())
            }
            CommandType::UpdateSignalStrength { device_id, strength } => {
                let ok = self.bluetooth.update_signal_strength(&device_id, strength);
                check(ok, || CapabilityError::DeviceNotFound(device_id).to_string())
            }
            CommandType::SetPairingTimeout { timeout_ms } => {
                self.bluetooth.set_pairing_timeout(timeout_ms);
                done()
            }
            CommandType::SetConnectionTimeout { timeout_ms } => {
                self.bluetooth.set_connection_timeout(timeout_ms);
                done()
            }
            CommandType::SetDiscoveryTimeout { timeout_ms } => {
                self.bluetooth.set_discovery_timeout(timeout_ms);
                done()
            }
            CommandType::SetAutoReconnect { enabled } => {
                self.bluetooth.enable_auto_reconnect(enabled);
                done()
            }
            CommandType::ListBluetoothDevices => to_data(&serde_json::json!({
                "available": self.bluetooth.available_devices(),
                "paired": self.bluetooth.paired_devices(),
            })),

            CommandType::StartUsbMonitoring => {
                self.usb.start_monitoring();
                done()
            }
            CommandType::StopUsbMonitoring => {
                self.usb.stop_monitoring();
                done()
            }
            CommandType::SimulateUsbInsertion { name } => {
                Ok(Some(Value::from(self.usb.simulate_insertion(&name))))
            }
            CommandType::SimulateUsbRemoval { device_id } => match self.usb.simulate_removal(device_id.as_deref()) {
                Some(removed) => Ok(Some(Value::from(removed))),
                None => Err("No connected USB device to remove".into()),
            },
            CommandType::Mount { device_id, mount_point } => {
                let ok = self.usb.mount(&device_id, &mount_point);
                check(ok, || format!("Failed to mount {device_id} at {}", mount_point.display()))
            }
            CommandType::Unmount { device_id } => {
                let ok = self.usb.unmount(&device_id);
                check(ok, || format!("{device_id} is not mounted"))
            }
            CommandType::ScanMedia { device_id } => {
                if !self.usb.scan_media_files(&device_id) {
                    return Err(format!("Scan of {device_id} failed"));
                }
                to_data(self.usb.media_files(&device_id))
            }
            CommandType::AddMediaFile { device_id, path } => {
                let file = media_file_from_path(&path).map_err(|e| format!("{}: {e}", path.display()))?;
                let ok = self.usb.add_media_file(&device_id, file);
                check(ok, || format!("Cannot add {} to {device_id}", path.display()))
            }
            CommandType::RemoveMediaFile { device_id, file_name } => {
                let ok = self.usb.remove_media_file(&device_id, &file_name);
                check(ok, || format!("{file_name} not found on {device_id}"))
            }
            CommandType::ListUsbDevices => to_data(self.usb.devices()),
            CommandType::ListMedia { device_id } => match self.usb.device(&device_id) {
                Some(device) => to_data(&device.media_files),
                None => Err(CapabilityError::DeviceNotFound(device_id).to_string()),
            },
            CommandType::SetSupportedFormats { formats } => {
                self.usb.set_supported_formats(formats);
                done()
            }
            CommandType::SetWatchDirectories { directories } => {
                self.usb.set_watch_directories(directories);
                done()
            }
            CommandType::SetAutoScan { enabled } => {
                self.usb.enable_auto_scan(enabled);
                done()
            }

            CommandType::InjectFault { fault, enabled, device_id } => {
                self.inject_fault(fault, enabled, device_id.as_deref());
                done()
            }
            CommandType::ClearFaults { target } => {
                self.clear_faults(target);
                done()
            }
            CommandType::GetFaultInjectionStatus => to_data(&self.fault_injection_status()),
        }
    }

    /// Route an injection toggle to the subsystem that owns `fault`.
    pub fn inject_fault(&mut self, fault: InjectedFault, enabled: bool, device_id: Option<&str>) {
        match fault {
            InjectedFault::SensorFailure => self.sensor.inject_failure(enabled),
            InjectedFault::SensorConnectionError => self.sensor.inject_connection_error(enabled),
            InjectedFault::SensorDataCorruption => self.sensor.inject_data_corruption(enabled),
            InjectedFault::RadioOff => self.bluetooth.simulate_radio_off(enabled),
            InjectedFault::PairingError => self.bluetooth.simulate_pairing_error(device_id, enabled),
            InjectedFault::ConnectionError => self.bluetooth.simulate_connection_error(device_id, enabled),
            InjectedFault::Interference => self.bluetooth.simulate_interference(enabled),
            InjectedFault::LowBattery => self.bluetooth.simulate_low_battery(enabled),
            InjectedFault::MountError => self.usb.simulate_mount_error(enabled),
            InjectedFault::FileSystemError => self.usb.simulate_file_system_error(enabled),
            InjectedFault::CorruptedFiles => self.usb.simulate_corrupted_files(enabled),
        }
    }

    pub fn clear_faults(&mut self, target: Option<SubsystemId>) {
        match target {
            Some(SubsystemId::Sensor) => self.sensor.clear_faults(),
            Some(SubsystemId::Bluetooth) => self.bluetooth.clear_faults(),
            Some(SubsystemId::Usb) => self.usb.clear_faults(),
            None => {
                self.sensor.clear_faults();
                self.bluetooth.clear_faults();
                self.usb.clear_faults();
            }
        }
    }

    pub fn fault_injection_status(&self) -> Vec<(SubsystemId, Vec<InjectedFault>, FaultInjectionStats)> {
        [
            (SubsystemId::Sensor, self.sensor.faults()),
            (SubsystemId::Bluetooth, self.bluetooth.faults()),
            (SubsystemId::Usb, self.usb.faults()),
        ]
        .into_iter()
        .map(|(id, faults)| (id, faults.get_armed().to_vec(), faults.get_stats().clone()))
        .collect()
    }

    pub fn status(&self) -> HeadUnitStatus {
        HeadUnitStatus {
            state: self.state.clone(),
            sensor: SensorStatus {
                connected: self.sensor.is_connected(),
                healthy: self.sensor.is_healthy(),
                address: self.sensor.address(),
                update_interval_ms: self.sensor.update_interval_ms(),
                reading: self.sensor.current_reading().clone(),
                armed_faults: self.sensor.faults().get_armed().to_vec(),
            },
            bluetooth: BluetoothStatus {
                initialized: self.bluetooth.is_initialized(),
                discovering: self.bluetooth.is_discovering(),
                available_devices: self.bluetooth.available_devices().len(),
                paired_devices: self.bluetooth.paired_devices().len(),
                armed_faults: self.bluetooth.faults().get_armed().to_vec(),
            },
            usb: UsbStatus {
                monitoring: self.usb.is_monitoring(),
                connected_devices: self.usb.connected_devices().len(),
                known_devices: self.usb.devices().len(),
                armed_faults: self.usb.faults().get_armed().to_vec(),
            },
        }
    }

    pub fn state(&self) -> &HeadUnitState {
        &self.state
    }

    pub fn config(&self) -> &HeadUnitConfig {
        &self.config
    }

    pub fn sensor(&self) -> &SensorSimulator {
        &self.sensor
    }

    pub fn sensor_mut(&mut self) -> &mut SensorSimulator {
        &mut self.sensor
    }

    pub fn bluetooth(&self) -> &BluetoothStack {
        &self.bluetooth
    }

    pub fn bluetooth_mut(&mut self) -> &mut BluetoothStack {
        &mut self.bluetooth
    }

    pub fn usb(&self) -> &RemovableMediaTracker {
        &self.usb
    }

    pub fn usb_mut(&mut self) -> &mut RemovableMediaTracker {
        &mut self.usb
    }

    fn record_error(&mut self, e: HeadUnitError) {
        error!("[{}] {e}", e.error_code());
        self.state.last_error = Some(e.to_string());
    }
}

impl Drop for HeadUnit {
    fn drop(&mut self) {
        self.stop();
    }
}

fn done() -> Outcome {
    Ok(None)
}

fn check(ok: bool, refused: impl FnOnce() -> String) -> Outcome {
    if ok {
        Ok(None)
    } else {
        Err(refused())
    }
}

fn to_data<T: Serialize + ?Sized>(value: &T) -> Outcome {
    serde_json::to_value(value).map(Some).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_unit(dir: &std::path::Path) -> HeadUnit {
        let mut config = HeadUnitConfig::default();
        config.config_dir = dir.join("config");
        config.usb.watch_root = dir.join("media");
        config.seed = Some(7);
        HeadUnit::new(config)
    }

    fn command(id: u32, command_type: CommandType) -> Command {
        Command { id, command_type }
    }

    #[test]
    fn test_start_brings_up_subsystems() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = head_unit(dir.path());
        unit.start();

        let status = unit.status();
        assert!(status.state.running);
        assert!(status.sensor.connected);
        assert!(status.bluetooth.initialized);
        assert!(status.usb.monitoring);
    }

    #[test]
    fn test_advance_is_ignored_while_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = head_unit(dir.path());
        unit.advance_to(60_000);
        assert_eq!(unit.state().now_ms, 0);
        assert_eq!(unit.sensor().tick_count(), 0);
    }

    #[test]
    fn test_sensor_ticks_on_virtual_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = head_unit(dir.path());
        unit.start();
        unit.advance_to(15_000);
        assert_eq!(unit.sensor().tick_count(), 3);

        let updates = unit
            .drain_notifications()
            .into_iter()
            .filter(|n| matches!(n, Notification::Sensor(_)))
            .count();
        assert_eq!(updates, 3);
    }

    #[test]
    fn test_invalid_command_is_nacked() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = head_unit(dir.path());
        unit.start();
        let response = unit.execute_command(command(0, CommandType::Ping));
        assert_eq!(response.status, ResponseStatus::NegativeAck);
    }

    #[test]
    fn test_refused_operation_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = head_unit(dir.path());
        unit.start();
        let response = unit.execute_command(command(
            1,
            CommandType::Pair {
                device_id: "BT_MISSING".into(),
            },
        ));
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(unit.state().last_error.is_some());
    }

    #[test]
    fn test_queued_commands_produce_responses() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = head_unit(dir.path());
        unit.start();
        unit.queue_command(command(1, CommandType::Ping)).unwrap();
        unit.queue_command(command(2, CommandType::SystemStatus)).unwrap();
        unit.process_commands().unwrap();

        let responses = unit.get_responses();
        assert_eq!(responses.len(), 2);
        assert!(responses[1].data.is_some());
        assert!(unit.get_responses().is_empty());
    }

    #[test]
    fn test_handle_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = head_unit(dir.path());
        unit.start();
        let reply = unit
            .handle_json(r#"{"id":9,"command_type":{"SimulateUsbInsertion":{"name":"STICK"}}}"#)
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["status"], "Success");
        assert!(reply["data"].as_str().unwrap().starts_with("USB_"));

        let garbage = unit.handle_json("not json").unwrap();
        assert!(garbage.contains("InvalidCommand"));
    }

    #[test]
    fn test_clear_faults_disarms_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = head_unit(dir.path());
        unit.inject_fault(InjectedFault::SensorFailure, true, None);
        unit.inject_fault(InjectedFault::RadioOff, true, None);
        unit.inject_fault(InjectedFault::MountError, true, None);

        unit.clear_faults(Some(SubsystemId::Bluetooth));
        assert!(unit.bluetooth().faults().get_armed().is_empty());
        assert!(!unit.sensor().faults().get_armed().is_empty());

        unit.clear_faults(None);
        assert!(unit
            .fault_injection_status()
            .iter()
            .all(|(_, armed, _)| armed.is_empty()));
    }
}
