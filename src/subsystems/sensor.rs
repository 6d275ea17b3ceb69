//! Simulated I2C climate sensor.
//!
//! Each tick draws temperature, humidity, pressure and light independently
//! and uniformly from their configured ranges. Successive readings are not
//! correlated. Calibration offsets are added after generation, then every
//! channel is clamped to its absolute physical bounds (not to the configured
//! range, so a corrupted reading is still physically plausible).

use super::{subsystem_rng, Subsystem, SubsystemId};
use crate::config::SensorConfig;
use crate::error::{CapabilityError, ClockError, ConnectionError, DataValidityError};
use crate::fault_injection::{FaultInjector, InjectedFault};
use crate::notifications::EventQueue;
use crate::persistence::JsonStore;
use crate::scheduler::ScheduledClock;
use chrono::{DateTime, Local};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tracing::{debug, error, info, warn};

/// Synthetic register map exposed through [`SensorSimulator::read_register`].
pub mod registers {
    /// Temperature, 0.5 °C per LSB.
    pub const TEMPERATURE: u8 = 0x00;
    /// Relative humidity scaled to 0..=255.
    pub const HUMIDITY: u8 = 0x01;
    pub const PRESSURE_HIGH: u8 = 0x02;
    pub const PRESSURE_LOW: u8 = 0x03;
    pub const LIGHT_HIGH: u8 = 0x04;
    pub const LIGHT_LOW: u8 = 0x05;
}

const CORRUPTION_NOISE: f64 = 5.0;
const MAX_LOGGED_READINGS: usize = 4096;
const MAX_LIGHT_LUX: u32 = 10_000;

const_assert!(MAX_LIGHT_LUX <= u16::MAX as u32);

/// A generation range must be finite, ordered, and have a finite width
/// for uniform sampling.
pub fn is_valid_range(min: f64, max: f64) -> bool {
    min.is_finite() && max.is_finite() && min <= max && (max - min).is_finite()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorChannel {
    Temperature,
    Humidity,
    Pressure,
    Light,
}

impl SensorChannel {
    pub const ALL: [SensorChannel; 4] = [
        Self::Temperature,
        Self::Humidity,
        Self::Pressure,
        Self::Light,
    ];

    /// Physical limits every valid reading is clamped to.
    pub fn absolute_bounds(self) -> (f64, f64) {
        match self {
            Self::Temperature => (-40.0, 80.0),
            Self::Humidity => (0.0, 100.0),
            Self::Pressure => (800.0, 1200.0),
            Self::Light => (0.0, f64::from(MAX_LIGHT_LUX)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Pressure => "pressure",
            Self::Light => "light",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            Self::Pressure => "hPa",
            Self::Light => "lux",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Temperature => 0,
            Self::Humidity => 1,
            Self::Pressure => 2,
            Self::Light => 3,
        }
    }
}

impl std::str::FromStr for SensorChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Ok(Self::Temperature),
            "humidity" => Ok(Self::Humidity),
            "pressure" => Ok(Self::Pressure),
            "light" | "light_level" => Ok(Self::Light),
            other => Err(format!("unknown sensor channel '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub light_level: f64,
    pub valid: bool,
    pub timestamp: Option<DateTime<Local>>,
}

impl SensorReading {
    pub fn value(&self, channel: SensorChannel) -> f64 {
        match channel {
            SensorChannel::Temperature => self.temperature,
            SensorChannel::Humidity => self.humidity,
            SensorChannel::Pressure => self.pressure,
            SensorChannel::Light => self.light_level,
        }
    }

    fn set_value(&mut self, channel: SensorChannel, value: f64) {
        match channel {
            SensorChannel::Temperature => self.temperature = value,
            SensorChannel::Humidity => self.humidity = value,
            SensorChannel::Pressure => self.pressure = value,
            SensorChannel::Light => self.light_level = value,
        }
    }
}

impl Default for SensorReading {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            humidity: 0.0,
            pressure: 0.0,
            light_level: 0.0,
            valid: false,
            timestamp: None,
        }
    }
}

/// Persisted calibration: `config/i2c_calibration.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationData {
    pub temperature_offset: f64,
    pub humidity_offset: f64,
    pub pressure_offset: f64,
    pub light_offset: f64,
    pub temperature_range: [f64; 2],
    pub humidity_range: [f64; 2],
    pub pressure_range: [f64; 2],
    pub light_range: [f64; 2],
}

impl CalibrationData {
    fn from_config(config: &SensorConfig) -> Self {
        Self {
            temperature_offset: 0.0,
            humidity_offset: 0.0,
            pressure_offset: 0.0,
            light_offset: 0.0,
            temperature_range: config.temperature_range,
            humidity_range: config.humidity_range,
            pressure_range: config.pressure_range,
            light_range: config.light_range,
        }
    }

    pub fn offset(&self, channel: SensorChannel) -> f64 {
        match channel {
            SensorChannel::Temperature => self.temperature_offset,
            SensorChannel::Humidity => self.humidity_offset,
            SensorChannel::Pressure => self.pressure_offset,
            SensorChannel::Light => self.light_offset,
        }
    }

    pub fn range(&self, channel: SensorChannel) -> [f64; 2] {
        match channel {
            SensorChannel::Temperature => self.temperature_range,
            SensorChannel::Humidity => self.humidity_range,
            SensorChannel::Pressure => self.pressure_range,
            SensorChannel::Light => self.light_range,
        }
    }

    fn offset_mut(&mut self, channel: SensorChannel) -> &mut f64 {
        match channel {
            SensorChannel::Temperature => &mut self.temperature_offset,
            SensorChannel::Humidity => &mut self.humidity_offset,
            SensorChannel::Pressure => &mut self.pressure_offset,
            SensorChannel::Light => &mut self.light_offset,
        }
    }

    fn range_mut(&mut self, channel: SensorChannel) -> &mut [f64; 2] {
        match channel {
            SensorChannel::Temperature => &mut self.temperature_range,
            SensorChannel::Humidity => &mut self.humidity_range,
            SensorChannel::Pressure => &mut self.pressure_range,
            SensorChannel::Light => &mut self.light_range,
        }
    }

    /// Drop ranges that a hand-edited file may have broken.
    fn sanitize(&mut self, fallback: &Self) {
        for channel in SensorChannel::ALL {
            let [min, max] = self.range(channel);
            if !is_valid_range(min, max) {
                warn!("Ignoring invalid persisted {} range [{min}, {max}]", channel.name());
                *self.range_mut(channel) = fallback.range(channel);
            }
            if !self.offset(channel).is_finite() {
                *self.offset_mut(channel) = 0.0;
            }
        }
    }
}

impl Default for CalibrationData {
    fn default() -> Self {
        Self::from_config(&SensorConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggedReading {
    timestamp: String,
    temperature: f64,
    humidity: f64,
    pressure: f64,
    light_level: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SensorEvent {
    DataUpdated(SensorReading),
    ConnectionError(String),
    SensorError(String),
    CalibrationChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorTimer {
    Update,
}

#[derive(Debug)]
pub struct SensorSimulator {
    clock: ScheduledClock<SensorTimer>,
    rng: StdRng,
    current: SensorReading,
    calibration: CalibrationData,
    faults: FaultInjector,
    events: EventQueue<SensorEvent>,
    store: Option<JsonStore>,
    data_log: Option<JsonStore>,
    connected: bool,
    address: u8,
    update_interval_ms: u64,
    data_logging: bool,
    tick_count: u64,
}

impl SensorSimulator {
    pub fn new(config: &SensorConfig, seed: Option<u64>) -> Self {
        Self {
            clock: ScheduledClock::new(),
            rng: subsystem_rng(seed, SubsystemId::Sensor),
            current: SensorReading::default(),
            calibration: CalibrationData::from_config(config),
            faults: FaultInjector::new(SubsystemId::Sensor),
            events: EventQueue::new(),
            store: None,
            data_log: None,
            connected: false,
            address: config.i2c_address,
            update_interval_ms: config.update_interval_ms.max(1),
            data_logging: config.data_logging,
            tick_count: 0,
        }
    }

    /// Persist calibration to `store`, loading whatever it already holds.
    pub fn with_store(mut self, store: JsonStore) -> Self {
        match store.load::<CalibrationData>() {
            Ok(Some(mut loaded)) => {
                loaded.sanitize(&self.calibration);
                self.calibration = loaded;
                info!("Calibration data loaded from {}", store.path().display());
            }
            Ok(None) => debug!("No calibration file at {}", store.path().display()),
            Err(e) => warn!("Calibration data not loaded: {e}"),
        }
        self.store = Some(store);
        self
    }

    /// Where readings go when data logging is enabled.
    pub fn with_data_log(mut self, store: JsonStore) -> Self {
        self.data_log = Some(store);
        self
    }

    /// Open the device. Starts the periodic update on success.
    pub fn connect(&mut self, address: u8) -> Result<(), ConnectionError> {
        if self.faults.trigger(InjectedFault::SensorConnectionError) {
            let err = ConnectionError::DeviceNotResponding { address };
            error!("Failed to connect to I2C device at address {address:#04x}");
            self.events.push(SensorEvent::ConnectionError(err.to_string()));
            return Err(err);
        }

        self.connected = true;
        self.address = address;
        info!("Connected to I2C device at address {address:#04x}");

        self.arm_update_timer();
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.connected {
            info!("Disconnected from I2C device at address {:#04x}", self.address);
        }
        self.connected = false;
        self.clock.cancel(&SensorTimer::Update);
    }

    pub fn is_connected(&self) -> bool {
        self.connected && !self.faults.is_armed(InjectedFault::SensorConnectionError)
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Map the current reading onto the synthetic register file.
    /// Never fails: an unreachable device or unknown register reads as 0.
    pub fn read_register(&self, reg: u8) -> u8 {
        if !self.is_connected() {
            error!("Cannot read register {reg:#04x} - device not connected");
            return 0;
        }

        let pressure = self.current.pressure as u32;
        let light = self.current.light_level as u32;

        match reg {
            registers::TEMPERATURE => (self.current.temperature * 2.0) as u8,
            registers::HUMIDITY => (self.current.humidity * 2.55) as u8,
            registers::PRESSURE_HIGH => ((pressure >> 8) & 0xFF) as u8,
            registers::PRESSURE_LOW => (pressure & 0xFF) as u8,
            registers::LIGHT_HIGH => ((light >> 8) & 0xFF) as u8,
            registers::LIGHT_LOW => (light & 0xFF) as u8,
            _ => 0,
        }
    }

    /// Registers are read-only in the simulation; a write is only acknowledged.
    pub fn write_register(&self, reg: u8, value: u8) -> bool {
        if !self.is_connected() {
            error!("Cannot write register {reg:#04x} - device not connected");
            return false;
        }
        debug!("Writing {value:#04x} to register {reg:#04x}");
        true
    }

    pub fn current_reading(&self) -> &SensorReading {
        &self.current
    }

    pub fn temperature(&self) -> f64 {
        self.current.temperature
    }

    pub fn humidity(&self) -> f64 {
        self.current.humidity
    }

    pub fn pressure(&self) -> f64 {
        self.current.pressure
    }

    pub fn light_level(&self) -> f64 {
        self.current.light_level
    }

    pub fn calibration(&self) -> &CalibrationData {
        &self.calibration
    }

    pub fn update_interval_ms(&self) -> u64 {
        self.update_interval_ms
    }

    pub fn set_update_interval(&mut self, interval_ms: u64) -> Result<(), ClockError> {
        if interval_ms == 0 {
            return Err(ClockError::ZeroPeriod);
        }
        self.update_interval_ms = interval_ms;
        if self.connected {
            self.arm_update_timer();
        }
        info!("Update interval set to {interval_ms} ms");
        Ok(())
    }

    /// Reconfigure the generation bounds of one channel; used from the next tick.
    pub fn set_range(&mut self, channel: SensorChannel, min: f64, max: f64) -> Result<(), CapabilityError> {
        if !is_valid_range(min, max) {
            return Err(CapabilityError::InvalidRange {
                channel: channel.name(),
                min,
                max,
            });
        }

        *self.calibration.range_mut(channel) = [min, max];
        info!("{} range set to {min}-{max} {}", channel.name(), channel.unit());
        self.persist();
        Ok(())
    }

    /// Set the additive offset applied to `channel` before clamping.
    pub fn calibrate(&mut self, channel: SensorChannel, offset: f64) {
        if !offset.is_finite() {
            warn!("Ignoring non-finite {} calibration offset", channel.name());
            return;
        }

        *self.calibration.offset_mut(channel) = offset;
        info!("{} calibration offset set to {offset} {}", channel.name(), channel.unit());
        self.persist();
        self.events.push(SensorEvent::CalibrationChanged);
    }

    pub fn inject_failure(&mut self, enable: bool) {
        self.faults.set(InjectedFault::SensorFailure, enable);
        if enable {
            warn!("Sensor failure simulation enabled");
            self.events.push(SensorEvent::SensorError("Simulated sensor failure".into()));
        } else {
            info!("Sensor failure simulation disabled");
        }
    }

    pub fn inject_connection_error(&mut self, enable: bool) {
        self.faults.set(InjectedFault::SensorConnectionError, enable);
        if enable {
            warn!("Connection error simulation enabled");
            self.events.push(SensorEvent::ConnectionError("Simulated I2C connection error".into()));
        } else {
            info!("Connection error simulation disabled");
        }
    }

    pub fn inject_data_corruption(&mut self, enable: bool) {
        self.faults.set(InjectedFault::SensorDataCorruption, enable);
        if enable {
            warn!("Data corruption simulation enabled");
        } else {
            info!("Data corruption simulation disabled");
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear_all();
        info!("Sensor error injection cleared");
    }

    pub fn enable_data_logging(&mut self, enable: bool) {
        self.data_logging = enable;
        info!("Data logging {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// One periodic update. Public so tests and the UI can force a sample.
    pub fn tick(&mut self) {
        self.tick_count += 1;

        if self.faults.trigger(InjectedFault::SensorFailure) {
            self.current.valid = false;
            self.current.timestamp = Some(Local::now());
            error!("Sensor failure detected - invalid data");
            self.events.push(SensorEvent::DataUpdated(self.current.clone()));
            self.events
                .push(SensorEvent::SensorError(DataValidityError::SensorFailure.to_string()));
            return;
        }

        let mut reading = SensorReading::default();
        for channel in SensorChannel::ALL {
            let [min, max] = self.calibration.range(channel);
            reading.set_value(channel, self.rng.gen_range(min..=max));
        }

        if self.faults.trigger(InjectedFault::SensorDataCorruption) {
            reading.temperature += self.rng.gen_range(-CORRUPTION_NOISE..CORRUPTION_NOISE);
            reading.humidity += self.rng.gen_range(-CORRUPTION_NOISE..CORRUPTION_NOISE);
        }

        for channel in SensorChannel::ALL {
            let (lo, hi) = channel.absolute_bounds();
            let value = reading.value(channel) + self.calibration.offset(channel);
            reading.set_value(channel, value.clamp(lo, hi));
        }

        reading.valid = true;
        reading.timestamp = Some(Local::now());
        self.current = reading;

        if self.data_logging {
            self.log_reading();
        }

        debug!(
            "Sensor data updated: T={:.1}°C, H={:.1}%, P={:.1} hPa, L={:.0} lux",
            self.current.temperature,
            self.current.humidity,
            self.current.pressure,
            self.current.light_level
        );
        self.events.push(SensorEvent::DataUpdated(self.current.clone()));
    }

    pub fn save_calibration(&self) {
        self.persist();
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            match store.save(&self.calibration) {
                Ok(()) => debug!("Calibration data saved"),
                Err(e) => error!("Failed to save calibration data: {e}"),
            }
        }
    }

    fn log_reading(&self) {
        let Some(store) = &self.data_log else {
            return;
        };

        let mut entries: Vec<LoggedReading> = match store.load() {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!("Sensor data log unreadable, starting a new one: {e}");
                Vec::new()
            }
        };

        entries.push(LoggedReading {
            timestamp: self
                .current
                .timestamp
                .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                .unwrap_or_default(),
            temperature: self.current.temperature,
            humidity: self.current.humidity,
            pressure: self.current.pressure,
            light_level: self.current.light_level,
        });
        if entries.len() > MAX_LOGGED_READINGS {
            let excess = entries.len() - MAX_LOGGED_READINGS;
            entries.drain(..excess);
        }

        if let Err(e) = store.save(&entries) {
            error!("Failed to append sensor data log: {e}");
        }
    }

    fn arm_update_timer(&mut self) {
        self.clock.cancel(&SensorTimer::Update);
        if let Err(e) = self.clock.schedule_every(SensorTimer::Update, self.update_interval_ms) {
            error!("Cannot schedule sensor updates: {e}");
        }
    }
}

impl Subsystem for SensorSimulator {
    type Event = SensorEvent;

    fn id(&self) -> SubsystemId {
        SubsystemId::Sensor
    }

    fn advance_to(&mut self, now_ms: u64) {
        while let Some(timer) = self.clock.pop_due(now_ms) {
            match timer {
                SensorTimer::Update => {
                    if self.is_connected() {
                        self.tick();
                    } else {
                        debug!("Skipping sensor update - device not connected");
                    }
                }
            }
        }
        self.clock.settle(now_ms);
    }

    fn drain_events(&mut self) -> Vec<SensorEvent> {
        self.events.drain()
    }

    fn shutdown(&mut self) {
        self.clock.clear_all();
        self.connected = false;
        self.persist();
        info!("Sensor simulator shutdown");
    }

    fn is_healthy(&self) -> bool {
        self.is_connected()
            && !self.faults.is_armed(InjectedFault::SensorFailure)
            && (self.current.valid || self.tick_count == 0)
    }
}
