//! # Head Unit Hardware Simulator
//!
//! Simulated peripherals for an in-vehicle infotainment head unit, so the UI
//! layer can be developed and tested without the real hardware.
//!
//! ## Features
//!
//! - **Environmental sensor**: an I2C sensor with temperature, humidity,
//!   pressure and light channels, register-level reads and calibration
//! - **Bluetooth**: discovery, pairing and connection state machines with
//!   persisted paired devices
//! - **USB media**: removable device tracking with media file scanning and
//!   directory watching
//! - **Error injection**: deterministic failure toggles for every subsystem
//! - **Virtual time**: every timer runs on a caller-driven clock, so tests
//!   advance time instead of sleeping
//!
//! ## Quick Start
//!
//! ```no_run
//! use headunit::{HeadUnit, HeadUnitConfig};
//!
//! let mut unit = HeadUnit::new(HeadUnitConfig::default());
//! unit.start();
//!
//! // Five seconds of virtual time: one sensor update
//! unit.advance_to(5_000);
//! for notification in unit.drain_notifications() {
//!     println!("{}", serde_json::to_string(&notification).unwrap());
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`agent`] - orchestrator owning the three subsystems
//! - [`subsystems`] - sensor, Bluetooth and USB services
//! - [`protocol`] - JSON command/response protocol for the UI layer
//! - [`scheduler`] - virtual clock and timer queue
//! - [`notifications`] - per-subsystem outboxes
//! - [`persistence`] - JSON state files
//! - [`fault_injection`] - armed failure toggles

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod agent;
pub mod config;
pub mod error;
pub mod fault_injection;
pub mod notifications;
pub mod persistence;
pub mod protocol;
pub mod scheduler;
pub mod subsystems;

pub use agent::HeadUnit;
pub use config::HeadUnitConfig;
pub use error::{HeadUnitError, Result};
pub use notifications::Notification;
pub use protocol::{Command, CommandResponse, CommandType};
pub use subsystems::{BluetoothStack, RemovableMediaTracker, SensorSimulator, Subsystem};
