//! Simulated Bluetooth stack: device registry plus the per-device pairing
//! and connection state machine.
//!
//! ```text
//! Disconnected --pair--> Pairing --timeout--> Paired --connect--> Connecting
//!      ^                                                              |
//!      +------------------------disconnect------- Connected <--timeout+
//! ```
//!
//! Pairing and connection complete on one-shot timers keyed by device id.
//! A device has at most one of each outstanding; a second request while one
//! is pending is refused rather than restarting the timer. Any transition can
//! land in `Error` under injected faults; the device stays addressable.

pub mod catalog;
pub mod device;
pub mod registry;

pub use device::{BluetoothDevice, ConnectionState, DeviceAddress, DeviceType};
pub use registry::DeviceRegistry;

use super::{subsystem_rng, Subsystem, SubsystemId};
use crate::config::BluetoothConfig;
use crate::error::{CapabilityError, RadioError};
use crate::fault_injection::{FaultInjector, InjectedFault};
use crate::notifications::EventQueue;
use crate::persistence::JsonStore;
use crate::scheduler::{ClockStats, ScheduledClock};
use chrono::Local;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

const SIGNAL_JITTER: i16 = 5;
const INTERFERENCE_PENALTY: i16 = 10;
const LOW_BATTERY_SIGNAL_CAP: u8 = 40;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BluetoothEvent {
    DeviceDiscovered { device: BluetoothDevice },
    DeviceRemoved { device_id: String },
    DevicePaired { device_id: String },
    DeviceUnpaired { device_id: String },
    DeviceConnected { device_id: String },
    DeviceDisconnected { device_id: String },
    ConnectionStateChanged { device_id: String, state: ConnectionState },
    SignalStrengthChanged { device_id: String, strength: u8 },
    PairingError { device_id: String, error: String },
    ConnectionError { device_id: String, error: String },
    DiscoveryStarted,
    DiscoveryStopped,
    ProfileEnabled { device_id: String, profile: String },
    ProfileDisabled { device_id: String, profile: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BluetoothTimer {
    Discovery,
    DiscoveryTimeout,
    SignalJitter,
    PairingComplete(String),
    ConnectionComplete(String),
}

#[derive(Debug)]
pub struct BluetoothStack {
    config: BluetoothConfig,
    clock: ScheduledClock<BluetoothTimer>,
    rng: StdRng,
    registry: DeviceRegistry,
    faults: FaultInjector,
    pairing_error_devices: HashSet<String>,
    connection_error_devices: HashSet<String>,
    reconnect_queue: Vec<String>,
    events: EventQueue<BluetoothEvent>,
    store: Option<JsonStore>,
    initialized: bool,
    discovering: bool,
}

impl BluetoothStack {
    pub fn new(config: &BluetoothConfig, seed: Option<u64>) -> Self {
        Self {
            config: config.clone(),
            clock: ScheduledClock::new(),
            rng: subsystem_rng(seed, SubsystemId::Bluetooth),
            registry: DeviceRegistry::new(),
            faults: FaultInjector::new(SubsystemId::Bluetooth),
            pairing_error_devices: HashSet::new(),
            connection_error_devices: HashSet::new(),
            reconnect_queue: Vec::new(),
            events: EventQueue::new(),
            store: None,
            initialized: false,
            discovering: false,
        }
    }

    /// Persist paired devices to `store` and restore the ones it holds.
    ///
    /// Devices saved mid-transition come back `Disconnected`; those that were
    /// `Connected` are queued for reconnection on [`initialize`](Self::initialize).
    pub fn with_store(mut self, store: JsonStore) -> Self {
        match store.load::<Vec<BluetoothDevice>>() {
            Ok(Some(mut devices)) => {
                for device in &mut devices {
                    match device.connection_state {
                        ConnectionState::Connected => {
                            self.reconnect_queue.push(device.device_id.clone());
                            device.connection_state = ConnectionState::Disconnected;
                        }
                        ConnectionState::Connecting
                        | ConnectionState::Pairing
                        | ConnectionState::Searching
                        | ConnectionState::Error => {
                            device.connection_state = ConnectionState::Disconnected;
                        }
                        ConnectionState::Disconnected | ConnectionState::Paired => {}
                    }
                }
                self.registry = DeviceRegistry::with_paired(devices);
                debug!("Loaded {} paired devices from config", self.registry.paired().len());
            }
            Ok(None) => debug!("No paired device file at {}", store.path().display()),
            Err(e) => warn!("Paired devices not loaded: {e}"),
        }
        self.store = Some(store);
        self
    }

    /// Bring the radio up and start signal-strength tracking.
    pub fn initialize(&mut self) -> Result<(), RadioError> {
        if self.faults.trigger(InjectedFault::RadioOff) {
            error!("Bluetooth is turned off");
            return Err(RadioError::PoweredOff);
        }

        if self.initialized {
            debug!("Bluetooth stack already initialized");
            return Ok(());
        }

        self.initialized = true;
        self.clock.cancel(&BluetoothTimer::SignalJitter);
        if let Err(e) = self
            .clock
            .schedule_every(BluetoothTimer::SignalJitter, self.config.signal_interval_ms)
        {
            error!("Cannot schedule signal strength updates: {e}");
        }
        info!("Bluetooth stack initialized");

        let pending = std::mem::take(&mut self.reconnect_queue);
        if self.config.auto_reconnect {
            for device_id in pending {
                info!("Auto-reconnecting device {device_id}");
                self.connect(&device_id);
            }
        }

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized && !self.faults.is_armed(InjectedFault::RadioOff)
    }

    pub fn start_discovery(&mut self) -> bool {
        if let Err(e) = self.check_radio() {
            error!("Cannot start discovery: {e}");
            return false;
        }
        if self.discovering {
            debug!("Discovery already running");
            return true;
        }

        if let Err(e) = self
            .clock
            .schedule_every(BluetoothTimer::Discovery, self.config.discovery_interval_ms)
        {
            error!("Cannot start discovery: {e}");
            return false;
        }
        if let Some(timeout) = self.config.discovery_timeout_ms {
            if let Err(e) = self.clock.schedule_once(BluetoothTimer::DiscoveryTimeout, timeout) {
                warn!("Discovery will not time out: {e}");
            }
        }

        self.discovering = true;
        info!("Bluetooth discovery started");
        self.events.push(BluetoothEvent::DiscoveryStarted);
        true
    }

    pub fn stop_discovery(&mut self) {
        self.clock.cancel(&BluetoothTimer::Discovery);
        self.clock.cancel(&BluetoothTimer::DiscoveryTimeout);

        if !self.discovering {
            return;
        }
        self.discovering = false;
        info!("Bluetooth discovery stopped");
        self.events.push(BluetoothEvent::DiscoveryStopped);
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering && self.is_initialized()
    }

    /// Begin pairing an available device. Completes after the pairing timeout.
    pub fn pair(&mut self, device_id: &str) -> bool {
        if let Err(e) = self.check_radio() {
            error!("Cannot pair device {device_id}: {e}");
            return false;
        }

        let Some((state, name)) = self
            .registry
            .find_available(device_id)
            .map(|d| (d.connection_state, d.device_name.clone()))
        else {
            let err = match self.registry.find_paired(device_id) {
                Some(_) => CapabilityError::InvalidState {
                    device_id: device_id.to_string(),
                    operation: "pair",
                    state: "already paired".into(),
                },
                None => CapabilityError::DeviceNotFound(device_id.to_string()),
            };
            error!("Pairing refused: {err}");
            return false;
        };

        let pairing_key = BluetoothTimer::PairingComplete(device_id.to_string());
        if state == ConnectionState::Pairing || self.clock.is_scheduled(&pairing_key) {
            warn!("Device {device_id} is already being paired");
            return false;
        }

        if self.pairing_error_armed(device_id) {
            self.fail_pairing(device_id, "Simulated pairing error");
            return false;
        }

        if let Err(e) = self.clock.schedule_once(pairing_key, self.config.pairing_timeout_ms) {
            error!("Cannot start pairing for {device_id}: {e}");
            return false;
        }

        self.set_state(device_id, ConnectionState::Pairing);
        info!("Starting pairing process for device: {name}");
        true
    }

    /// Forget a paired device, disconnecting it first if needed.
    pub fn unpair(&mut self, device_id: &str) -> bool {
        let Some(device) = self.registry.find_paired(device_id) else {
            error!("Device {device_id} not found for unpairing");
            return false;
        };

        info!("Unpairing device: {}", device.device_name);
        if device.connection_state == ConnectionState::Connected {
            self.disconnect(device_id);
        }

        self.clock
            .cancel(&BluetoothTimer::ConnectionComplete(device_id.to_string()));
        self.registry.remove_paired(device_id);
        self.pairing_error_devices.remove(device_id);
        self.connection_error_devices.remove(device_id);

        self.events.push(BluetoothEvent::DeviceUnpaired {
            device_id: device_id.to_string(),
        });
        self.persist();
        true
    }

    /// Begin connecting a paired device. Completes after the connection timeout.
    pub fn connect(&mut self, device_id: &str) -> bool {
        if let Err(e) = self.check_radio() {
            error!("Cannot connect device {device_id}: {e}");
            return false;
        }

        if !self.registry.is_paired(device_id) {
            error!("Cannot connect device {device_id} - not paired");
            return false;
        }

        let connection_key = BluetoothTimer::ConnectionComplete(device_id.to_string());
        let (state, name) = match self.registry.find_paired(device_id) {
            Some(d) => (d.connection_state, d.device_name.clone()),
            None => return false,
        };
        if state == ConnectionState::Connecting || self.clock.is_scheduled(&connection_key) {
            warn!("Device {device_id} is already connecting");
            return false;
        }
        if state == ConnectionState::Connected {
            warn!("Device {device_id} is already connected");
            return false;
        }

        if self.connection_error_armed(device_id) {
            self.fail_connection(device_id, "Simulated connection error");
            return false;
        }

        if let Err(e) = self
            .clock
            .schedule_once(connection_key, self.config.connection_timeout_ms)
        {
            error!("Cannot start connection for {device_id}: {e}");
            return false;
        }

        self.set_state(device_id, ConnectionState::Connecting);
        info!("Starting connection process for device: {name}");
        true
    }

    /// Drop an active connection. Instantaneous, no timer involved.
    pub fn disconnect(&mut self, device_id: &str) -> bool {
        let Some(device) = self
            .registry
            .paired_mut(device_id)
            .filter(|d| d.connection_state == ConnectionState::Connected)
        else {
            error!("Device {device_id} not found or not connected");
            return false;
        };

        device.connection_state = ConnectionState::Disconnected;
        info!("Disconnected device: {}", device.device_name);

        self.events.push(BluetoothEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
        });
        self.events.push(BluetoothEvent::ConnectionStateChanged {
            device_id: device_id.to_string(),
            state: ConnectionState::Disconnected,
        });
        self.persist();
        true
    }

    pub fn enable_profile(&mut self, device_id: &str, profile: &str) -> bool {
        match self.check_profile(device_id, profile) {
            Ok(()) => {
                info!("Enabled profile {profile} for device {device_id}");
                self.events.push(BluetoothEvent::ProfileEnabled {
                    device_id: device_id.to_string(),
                    profile: profile.to_ascii_uppercase(),
                });
                true
            }
            Err(e) => {
                error!("Cannot enable profile: {e}");
                false
            }
        }
    }

    pub fn disable_profile(&mut self, device_id: &str, profile: &str) -> bool {
        match self.check_profile(device_id, profile) {
            Ok(()) => {
                info!("Disabled profile {profile} for device {device_id}");
                self.events.push(BluetoothEvent::ProfileDisabled {
                    device_id: device_id.to_string(),
                    profile: profile.to_ascii_uppercase(),
                });
                true
            }
            Err(e) => {
                error!("Cannot disable profile: {e}");
                false
            }
        }
    }

    fn check_profile(&self, device_id: &str, profile: &str) -> Result<(), CapabilityError> {
        let device = self
            .registry
            .find_paired(device_id)
            .ok_or_else(|| CapabilityError::DeviceNotFound(device_id.to_string()))?;

        if device.supports_profile(profile) {
            Ok(())
        } else {
            Err(CapabilityError::ProfileNotSupported {
                device_id: device_id.to_string(),
                profile: profile.to_string(),
            })
        }
    }

    /// Manufacture a new available device, as discovery does.
    pub fn simulate_device_appearance(&mut self, name: &str, device_type: DeviceType) -> String {
        let device_id = self.generate_device_id();
        let now = Local::now().naive_local();
        let (manufacturer, model) = catalog::vendor(device_type, name);

        let device = BluetoothDevice {
            device_id: device_id.clone(),
            device_name: name.to_string(),
            device_address: catalog::random_address(&mut self.rng),
            device_type,
            connection_state: ConnectionState::Disconnected,
            is_paired: false,
            is_trusted: false,
            signal_strength: catalog::random_signal_strength(&mut self.rng),
            last_seen: now,
            paired_time: None,
            supported_profiles: catalog::profiles(device_type)
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
            manufacturer,
            model,
            firmware_version: catalog::firmware_version(device_type).to_string(),
        };

        info!("Device appeared: {name} ({})", device.device_address);
        self.registry.insert_available(device.clone());
        self.events.push(BluetoothEvent::DeviceDiscovered { device });
        device_id
    }

    /// Remove an available device, abandoning any pairing in progress.
    pub fn simulate_device_disappearance(&mut self, device_id: &str) -> bool {
        let Some(device) = self.registry.remove_available(device_id) else {
            debug!("Device {device_id} not available, nothing disappears");
            return false;
        };

        self.clock
            .cancel(&BluetoothTimer::PairingComplete(device_id.to_string()));
        info!("Device disappeared: {}", device.device_name);
        self.events.push(BluetoothEvent::DeviceRemoved {
            device_id: device_id.to_string(),
        });
        true
    }

    /// Arm or disarm connection failures, for one device or globally.
    pub fn simulate_connection_error(&mut self, device_id: Option<&str>, enable: bool) {
        match device_id {
            Some(id) => {
                if enable {
                    self.connection_error_devices.insert(id.to_string());
                } else {
                    self.connection_error_devices.remove(id);
                }
            }
            None => {
                self.faults.set(InjectedFault::ConnectionError, enable);
            }
        }

        let target = device_id.unwrap_or("all devices");
        if enable {
            warn!("Connection error simulation enabled for {target}");
            self.events.push(BluetoothEvent::ConnectionError {
                device_id: device_id.unwrap_or_default().to_string(),
                error: "Simulated connection error".into(),
            });
        } else {
            info!("Connection error simulation disabled for {target}");
        }
    }

    /// Arm or disarm pairing failures, for one device or globally.
    pub fn simulate_pairing_error(&mut self, device_id: Option<&str>, enable: bool) {
        match device_id {
            Some(id) => {
                if enable {
                    self.pairing_error_devices.insert(id.to_string());
                } else {
                    self.pairing_error_devices.remove(id);
                }
            }
            None => {
                self.faults.set(InjectedFault::PairingError, enable);
            }
        }

        let target = device_id.unwrap_or("all devices");
        if enable {
            warn!("Pairing error simulation enabled for {target}");
            self.events.push(BluetoothEvent::PairingError {
                device_id: device_id.unwrap_or_default().to_string(),
                error: "Simulated pairing error".into(),
            });
        } else {
            info!("Pairing error simulation disabled for {target}");
        }
    }

    pub fn simulate_radio_off(&mut self, enable: bool) {
        self.faults.set(InjectedFault::RadioOff, enable);
        if enable {
            self.stop_discovery();
            warn!("Bluetooth turned off");
        } else {
            info!("Bluetooth turned on");
        }
    }

    pub fn simulate_interference(&mut self, enable: bool) {
        self.faults.set(InjectedFault::Interference, enable);
        info!("Interference simulation {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn simulate_low_battery(&mut self, enable: bool) {
        self.faults.set(InjectedFault::LowBattery, enable);
        info!("Low battery simulation {}", if enable { "enabled" } else { "disabled" });
    }

    /// Override a device's signal strength. Values are clamped to 0..=100.
    pub fn update_signal_strength(&mut self, device_id: &str, strength: i32) -> bool {
        let strength = strength.clamp(0, 100) as u8;
        let Some(device) = self.registry.get_mut(device_id) else {
            error!("Device {device_id} not found for signal update");
            return false;
        };

        if device.signal_strength != strength {
            device.signal_strength = strength;
            self.events.push(BluetoothEvent::SignalStrengthChanged {
                device_id: device_id.to_string(),
                strength,
            });
        }
        true
    }

    pub fn set_pairing_timeout(&mut self, timeout_ms: u64) {
        self.config.pairing_timeout_ms = timeout_ms;
        info!("Pairing timeout set to {timeout_ms} ms");
    }

    pub fn set_connection_timeout(&mut self, timeout_ms: u64) {
        self.config.connection_timeout_ms = timeout_ms;
        info!("Connection timeout set to {timeout_ms} ms");
    }

    /// Applies to the next discovery run.
    pub fn set_discovery_timeout(&mut self, timeout_ms: Option<u64>) {
        self.config.discovery_timeout_ms = timeout_ms;
        match timeout_ms {
            Some(ms) => info!("Discovery timeout set to {ms} ms"),
            None => info!("Discovery timeout disabled"),
        }
    }

    pub fn enable_auto_reconnect(&mut self, enable: bool) {
        self.config.auto_reconnect = enable;
        info!("Auto reconnect {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn device(&self, device_id: &str) -> Option<&BluetoothDevice> {
        self.registry.get(device_id)
    }

    pub fn available_devices(&self) -> &[BluetoothDevice] {
        self.registry.available()
    }

    pub fn paired_devices(&self) -> &[BluetoothDevice] {
        self.registry.paired()
    }

    pub fn is_device_paired(&self, device_id: &str) -> bool {
        self.registry.is_paired(device_id)
    }

    /// `Disconnected` for unknown devices.
    pub fn connection_state(&self, device_id: &str) -> ConnectionState {
        self.registry
            .connection_state(device_id)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// 0 for unknown devices.
    pub fn signal_strength(&self, device_id: &str) -> u8 {
        self.registry.get(device_id).map_or(0, |d| d.signal_strength)
    }

    pub fn supported_profiles(&self) -> &'static [&'static str] {
        &catalog::KNOWN_PROFILES
    }

    pub fn is_profile_supported(&self, profile: &str) -> bool {
        catalog::KNOWN_PROFILES
            .iter()
            .any(|p| p.eq_ignore_ascii_case(profile))
    }

    pub fn config(&self) -> &BluetoothConfig {
        &self.config
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Disarm every injected fault, including per-device ones.
    pub fn clear_faults(&mut self) {
        self.faults.clear_all();
        self.pairing_error_devices.clear();
        self.connection_error_devices.clear();
        info!("Bluetooth error injection cleared");
    }

    pub fn clock_stats(&self) -> &ClockStats {
        self.clock.get_stats()
    }

    pub fn save_paired_devices(&self) {
        self.persist();
    }

    fn check_radio(&self) -> Result<(), RadioError> {
        if self.faults.is_armed(InjectedFault::RadioOff) {
            Err(RadioError::PoweredOff)
        } else if !self.initialized {
            Err(RadioError::NotInitialized)
        } else {
            Ok(())
        }
    }

    fn pairing_error_armed(&mut self, device_id: &str) -> bool {
        self.faults.trigger(InjectedFault::PairingError) || self.pairing_error_devices.contains(device_id)
    }

    fn connection_error_armed(&mut self, device_id: &str) -> bool {
        self.faults.trigger(InjectedFault::ConnectionError)
            || self.connection_error_devices.contains(device_id)
    }

    fn set_state(&mut self, device_id: &str, state: ConnectionState) {
        if let Some(device) = self.registry.get_mut(device_id) {
            device.connection_state = state;
            self.events.push(BluetoothEvent::ConnectionStateChanged {
                device_id: device_id.to_string(),
                state,
            });
        }
    }

    fn fail_pairing(&mut self, device_id: &str, reason: &str) {
        error!("Pairing failed for device {device_id}: {reason}");
        self.set_state(device_id, ConnectionState::Error);
        self.events.push(BluetoothEvent::PairingError {
            device_id: device_id.to_string(),
            error: reason.to_string(),
        });
    }

    fn fail_connection(&mut self, device_id: &str, reason: &str) {
        error!("Connection failed for device {device_id}: {reason}");
        self.set_state(device_id, ConnectionState::Error);
        self.events.push(BluetoothEvent::ConnectionError {
            device_id: device_id.to_string(),
            error: reason.to_string(),
        });
    }

    fn complete_pairing(&mut self, device_id: &str) {
        let pending = self
            .registry
            .find_available(device_id)
            .is_some_and(|d| d.connection_state == ConnectionState::Pairing);
        if !pending {
            debug!("Pairing timer for {device_id} fired with no pairing in progress");
            return;
        }

        if let Err(e) = self.check_radio() {
            self.fail_pairing(device_id, &e.to_string());
            return;
        }
        if self.pairing_error_armed(device_id) {
            self.fail_pairing(device_id, "Simulated pairing error");
            return;
        }

        let now = Local::now().naive_local();
        let Some(device) = self.registry.promote(device_id, |d| {
            d.is_paired = true;
            d.connection_state = ConnectionState::Paired;
            d.paired_time = Some(now);
            d.last_seen = now;
        }) else {
            return;
        };

        info!("Device paired successfully: {}", device.device_name);
        self.events.push(BluetoothEvent::DevicePaired {
            device_id: device_id.to_string(),
        });
        self.events.push(BluetoothEvent::ConnectionStateChanged {
            device_id: device_id.to_string(),
            state: ConnectionState::Paired,
        });
        self.persist();
    }

    fn complete_connection(&mut self, device_id: &str) {
        let pending = self
            .registry
            .find_paired(device_id)
            .is_some_and(|d| d.connection_state == ConnectionState::Connecting);
        if !pending {
            debug!("Connection timer for {device_id} fired with no connection in progress");
            return;
        }

        if let Err(e) = self.check_radio() {
            self.fail_connection(device_id, &e.to_string());
            return;
        }
        if self.connection_error_armed(device_id) {
            self.fail_connection(device_id, "Simulated connection error");
            return;
        }

        let Some(device) = self.registry.paired_mut(device_id) else {
            return;
        };
        device.connection_state = ConnectionState::Connected;
        device.last_seen = Local::now().naive_local();
        info!("Device connected successfully: {}", device.device_name);

        self.events.push(BluetoothEvent::DeviceConnected {
            device_id: device_id.to_string(),
        });
        self.events.push(BluetoothEvent::ConnectionStateChanged {
            device_id: device_id.to_string(),
            state: ConnectionState::Connected,
        });
        self.persist();
    }

    fn discovery_tick(&mut self) {
        if !self.is_discovering() {
            return;
        }
        if self.rng.gen_range(0..100u8) < self.config.discovery_probability_percent {
            let device_type = catalog::random_type(&mut self.rng);
            let name = catalog::random_name(device_type, &mut self.rng);
            self.simulate_device_appearance(&name, device_type);
        }
    }

    fn signal_tick(&mut self) {
        if !self.is_initialized() {
            return;
        }

        let interference = self.faults.trigger(InjectedFault::Interference);
        let low_battery = self.faults.trigger(InjectedFault::LowBattery);

        for device in self.registry.iter_mut() {
            let mut strength =
                i16::from(device.signal_strength) + self.rng.gen_range(-SIGNAL_JITTER..=SIGNAL_JITTER);
            if interference {
                strength -= INTERFERENCE_PENALTY;
            }
            let mut strength = strength.clamp(0, 100) as u8;
            if low_battery {
                strength = strength.min(LOW_BATTERY_SIGNAL_CAP);
            }

            if strength != device.signal_strength {
                device.signal_strength = strength;
                self.events.push(BluetoothEvent::SignalStrengthChanged {
                    device_id: device.device_id.clone(),
                    strength,
                });
            }
        }
    }

    fn generate_device_id(&mut self) -> String {
        loop {
            let id = format!("BT_{:012X}", self.rng.gen::<u64>() & 0xFFFF_FFFF_FFFF);
            if !self.registry.contains(&id) {
                return id;
            }
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            match store.save(self.registry.paired()) {
                Ok(()) => debug!("Paired devices saved"),
                Err(e) => error!("Failed to save paired devices: {e}"),
            }
        }
    }
}

impl Subsystem for BluetoothStack {
    type Event = BluetoothEvent;

    fn id(&self) -> SubsystemId {
        SubsystemId::Bluetooth
    }

    fn advance_to(&mut self, now_ms: u64) {
        while let Some(timer) = self.clock.pop_due(now_ms) {
            match timer {
                BluetoothTimer::Discovery => self.discovery_tick(),
                BluetoothTimer::DiscoveryTimeout => {
                    info!("Discovery timeout reached");
                    self.stop_discovery();
                }
                BluetoothTimer::SignalJitter => self.signal_tick(),
                BluetoothTimer::PairingComplete(id) => self.complete_pairing(&id),
                BluetoothTimer::ConnectionComplete(id) => self.complete_connection(&id),
            }
        }
        self.clock.settle(now_ms);
    }

    fn drain_events(&mut self) -> Vec<BluetoothEvent> {
        self.events.drain()
    }

    fn shutdown(&mut self) {
        self.clock.clear_all();
        self.discovering = false;
        self.initialized = false;

        // Pending pairings and connections die with their timers
        let mut reset = Vec::new();
        for device in self.registry.iter_mut() {
            if device.connection_state.is_in_flight() {
                device.connection_state = if device.is_paired {
                    ConnectionState::Paired
                } else {
                    ConnectionState::Disconnected
                };
                reset.push((device.device_id.clone(), device.connection_state));
            }
        }
        for (device_id, state) in reset {
            debug!("Abandoned in-flight operation for {device_id}");
            self.events.push(BluetoothEvent::ConnectionStateChanged { device_id, state });
        }

        self.persist();
        info!("Bluetooth simulation system shutdown");
    }

    fn is_healthy(&self) -> bool {
        self.is_initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> BluetoothStack {
        let mut stack = BluetoothStack::new(&BluetoothConfig::default(), Some(11));
        stack.initialize().unwrap();
        stack
    }

    #[test]
    fn test_radio_off_blocks_initialize() {
        let mut stack = BluetoothStack::new(&BluetoothConfig::default(), Some(1));
        stack.simulate_radio_off(true);
        assert_eq!(stack.initialize(), Err(RadioError::PoweredOff));
        assert!(!stack.is_initialized());
    }

    #[test]
    fn test_pair_requires_initialization() {
        let mut stack = BluetoothStack::new(&BluetoothConfig::default(), Some(1));
        let id = stack.simulate_device_appearance("JBL Flip", DeviceType::Speaker);
        assert!(!stack.pair(&id));
        assert_eq!(stack.connection_state(&id), ConnectionState::Disconnected);
    }

    #[test]
    fn test_second_pair_is_refused() {
        let mut stack = stack();
        let id = stack.simulate_device_appearance("Apple Watch", DeviceType::Smartwatch);
        assert!(stack.pair(&id));
        assert!(!stack.pair(&id));
        assert_eq!(stack.clock.get_pending_timers().len(), 2);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let mut stack = stack();
        let mut ids = HashSet::new();
        for _ in 0..40 {
            ids.insert(stack.simulate_device_appearance("Xiaomi", DeviceType::Phone));
        }
        assert_eq!(ids.len(), 40);
    }

    #[test]
    fn test_disappearance_cancels_pairing() {
        let mut stack = stack();
        let id = stack.simulate_device_appearance("UE Boom", DeviceType::Speaker);
        stack.pair(&id);
        assert!(stack.simulate_device_disappearance(&id));
        stack.advance_to(20_000);
        assert!(stack.device(&id).is_none());
        assert!(stack.paired_devices().is_empty());
    }

    #[test]
    fn test_low_battery_caps_signal() {
        let mut stack = stack();
        let id = stack.simulate_device_appearance("Jabra Elite", DeviceType::Headset);
        stack.simulate_low_battery(true);
        stack.advance_to(3000);
        assert!(stack.signal_strength(&id) <= LOW_BATTERY_SIGNAL_CAP);
    }
}
