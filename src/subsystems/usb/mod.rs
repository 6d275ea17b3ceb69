//! Removable media tracking: simulated USB hotplug, mount bookkeeping and
//! media library scans.
//!
//! A device's media list is always replaced as a whole by a scan, never
//! merged. Scans triggered by the directory watch and by the periodic rescan
//! run the same code and produce identical lists for an unchanged directory.

pub mod media;
mod watch;

pub use media::{MediaFile, TrackMetadata};

use super::{subsystem_rng, Subsystem, SubsystemId};
use crate::config::UsbConfig;
use crate::fault_injection::{FaultInjector, InjectedFault};
use crate::notifications::EventQueue;
use crate::persistence::{iso_format, JsonStore};
use crate::scheduler::{ClockStats, ScheduledClock};
use chrono::{Local, NaiveDateTime};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use watch::DirectoryWatch;

/// Placeholder capacity of a freshly inserted stick, before a scan measures it.
pub const SIMULATED_TOTAL_SPACE: u64 = 32_000_000_000;
pub const SIMULATED_FREE_SPACE: u64 = 28_000_000_000;
pub const SIMULATED_FILE_SYSTEM: &str = "FAT32";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDevice {
    pub device_id: String,
    pub device_name: String,
    pub mount_point: PathBuf,
    pub total_space: u64,
    pub free_space: u64,
    pub file_system: String,
    pub is_connected: bool,
    #[serde(with = "iso_format")]
    pub connected_time: NaiveDateTime,
    #[serde(default)]
    pub media_files: Vec<MediaFile>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UsbEvent {
    DeviceConnected { device: UsbDevice },
    DeviceDisconnected { device_id: String },
    MediaFilesChanged { device_id: String, files: Vec<MediaFile> },
    MountError { device_id: String, error: String },
    FileSystemError { device_id: String, error: String },
    MediaFileAdded { device_id: String, file: MediaFile },
    MediaFileRemoved { device_id: String, file_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UsbTimer {
    Rescan,
}

#[derive(Debug)]
pub struct RemovableMediaTracker {
    config: UsbConfig,
    clock: ScheduledClock<UsbTimer>,
    rng: StdRng,
    devices: Vec<UsbDevice>,
    faults: FaultInjector,
    events: EventQueue<UsbEvent>,
    store: Option<JsonStore>,
    watch: Option<DirectoryWatch>,
    monitoring: bool,
}

impl RemovableMediaTracker {
    pub fn new(config: &UsbConfig, seed: Option<u64>) -> Self {
        let mut config = config.clone();
        for format in &mut config.supported_formats {
            format.make_ascii_lowercase();
        }

        Self {
            config,
            clock: ScheduledClock::new(),
            rng: subsystem_rng(seed, SubsystemId::Usb),
            devices: Vec::new(),
            faults: FaultInjector::new(SubsystemId::Usb),
            events: EventQueue::new(),
            store: None,
            watch: None,
            monitoring: false,
        }
    }

    /// Persist the device list to `store` and restore what it holds.
    pub fn with_store(mut self, store: JsonStore) -> Self {
        match store.load::<Vec<UsbDevice>>() {
            Ok(Some(devices)) => {
                debug!("Loaded {} devices from config", devices.len());
                self.devices = devices;
            }
            Ok(None) => debug!("No USB device file at {}", store.path().display()),
            Err(e) => warn!("USB device list not loaded: {e}"),
        }
        self.store = Some(store);
        self
    }

    /// Watch the configured directories plus every mount point, and arm the
    /// periodic rescan if auto-scan is on.
    pub fn start_monitoring(&mut self) {
        if self.monitoring {
            return;
        }

        self.init_watch();
        if self.config.auto_scan {
            self.arm_rescan();
        }
        self.monitoring = true;
        info!("USB monitoring started");
    }

    pub fn stop_monitoring(&mut self) {
        if !self.monitoring {
            return;
        }

        if let Some(watch) = &mut self.watch {
            watch.unwatch_all();
        }
        self.watch = None;
        self.clock.cancel(&UsbTimer::Rescan);
        self.monitoring = false;
        info!("USB monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    /// Plug in a new simulated stick. Returns its id.
    pub fn simulate_insertion(&mut self, name: &str) -> String {
        let device_id = self.generate_device_id();
        let mount_point = self.config.watch_root.join(&device_id);

        if let Err(e) = std::fs::create_dir_all(&mount_point) {
            warn!("Cannot create mount point {}: {e}", mount_point.display());
        }

        let device = UsbDevice {
            device_id: device_id.clone(),
            device_name: name.to_string(),
            mount_point: mount_point.clone(),
            total_space: SIMULATED_TOTAL_SPACE,
            free_space: SIMULATED_FREE_SPACE,
            file_system: SIMULATED_FILE_SYSTEM.to_string(),
            is_connected: true,
            connected_time: Local::now().naive_local(),
            media_files: Vec::new(),
        };
        self.devices.push(device.clone());

        info!("USB device inserted: {name} at {}", mount_point.display());
        self.events.push(UsbEvent::DeviceConnected { device });

        if self.monitoring {
            self.watch_path(&mount_point);
        }
        self.persist();
        device_id
    }

    /// Pull a device out. Without an id, the first connected device goes.
    /// Returns the id of the removed device.
    pub fn simulate_removal(&mut self, device_id: Option<&str>) -> Option<String> {
        let index = match device_id {
            Some(id) => self.devices.iter().position(|d| d.device_id == id),
            None => self.devices.iter().position(|d| d.is_connected),
        };
        let Some(index) = index else {
            warn!("No USB device to remove ({})", device_id.unwrap_or("none connected"));
            return None;
        };

        let device = self.devices.remove(index);
        info!("USB device removed: {}", device.device_name);
        self.unwatch_path(&device.mount_point);

        self.events.push(UsbEvent::DeviceDisconnected {
            device_id: device.device_id.clone(),
        });
        self.persist();
        Some(device.device_id)
    }

    /// Reassign a device's mount point and mark it connected.
    pub fn mount(&mut self, device_id: &str, mount_point: &Path) -> bool {
        if self.faults.trigger(InjectedFault::MountError) {
            error!("Failed to mount device {device_id}");
            self.events.push(UsbEvent::MountError {
                device_id: device_id.to_string(),
                error: "Simulated mount error - device not responding".into(),
            });
            return false;
        }

        let Some(index) = self.index_of(device_id) else {
            error!("Device {device_id} not found for mounting");
            return false;
        };

        if let Err(e) = std::fs::create_dir_all(mount_point) {
            warn!("Cannot create mount point {}: {e}", mount_point.display());
        }

        let previous = std::mem::replace(&mut self.devices[index].mount_point, mount_point.to_path_buf());
        let was_connected = std::mem::replace(&mut self.devices[index].is_connected, true);
        info!("Device {device_id} mounted at {}", mount_point.display());

        if self.monitoring {
            self.unwatch_path(&previous);
            self.watch_path(mount_point);
        }
        if !was_connected {
            self.events.push(UsbEvent::DeviceConnected {
                device: self.devices[index].clone(),
            });
        }
        self.persist();
        true
    }

    /// Mark a device disconnected. It stays known and can be mounted again.
    pub fn unmount(&mut self, device_id: &str) -> bool {
        let Some(index) = self.index_of(device_id) else {
            error!("Device {device_id} not found for unmounting");
            return false;
        };
        if !self.devices[index].is_connected {
            debug!("Device {device_id} already unmounted");
            return false;
        }

        self.devices[index].is_connected = false;
        let mount_point = self.devices[index].mount_point.clone();
        self.unwatch_path(&mount_point);

        info!("Device {device_id} unmounted");
        self.events.push(UsbEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
        });
        self.persist();
        true
    }

    /// Rebuild a connected device's media list from its mount point.
    pub fn scan_media_files(&mut self, device_id: &str) -> bool {
        let Some(index) = self
            .index_of(device_id)
            .filter(|&i| self.devices[i].is_connected)
        else {
            debug!("Device {device_id} not connected, skipping scan");
            return false;
        };

        if self.faults.trigger(InjectedFault::FileSystemError) {
            self.report_fs_error(device_id, "Simulated file system error");
            return false;
        }
        if self.faults.trigger(InjectedFault::CorruptedFiles) {
            self.report_fs_error(device_id, "Simulated corrupted media files");
            return false;
        }

        let mount_point = self.devices[index].mount_point.clone();
        let files = match media::scan_directory(&mount_point, &self.config.supported_formats) {
            Ok(files) => files,
            Err(e) => {
                self.report_fs_error(device_id, &format!("Cannot read {}: {e}", mount_point.display()));
                return false;
            }
        };

        let space = filesystem_space(&mount_point);
        let device = &mut self.devices[index];
        let changed = device.media_files != files;
        device.media_files = files.clone();
        if let Some((total, free)) = space {
            device.total_space = total;
            device.free_space = free;
        }

        info!("Scanned {} media files from device {device_id}", files.len());
        self.events.push(UsbEvent::MediaFilesChanged {
            device_id: device_id.to_string(),
            files,
        });
        if changed {
            self.persist();
        }
        true
    }

    pub fn add_media_file(&mut self, device_id: &str, file: MediaFile) -> bool {
        let Some(index) = self.index_of(device_id) else {
            error!("Device {device_id} not found for adding media");
            return false;
        };

        info!("Added media file: {} to device {device_id}", file.file_name);
        let device = &mut self.devices[index];
        device.media_files.push(file.clone());
        let files = device.media_files.clone();

        self.events.push(UsbEvent::MediaFileAdded {
            device_id: device_id.to_string(),
            file,
        });
        self.events.push(UsbEvent::MediaFilesChanged {
            device_id: device_id.to_string(),
            files,
        });
        true
    }

    pub fn remove_media_file(&mut self, device_id: &str, file_name: &str) -> bool {
        let Some(device) = self.devices.iter_mut().find(|d| d.device_id == device_id) else {
            error!("Device {device_id} not found for removing media");
            return false;
        };
        let Some(position) = device.media_files.iter().position(|f| f.file_name == file_name) else {
            debug!("Media file {file_name} not on device {device_id}");
            return false;
        };

        device.media_files.remove(position);
        let files = device.media_files.clone();
        info!("Removed media file: {file_name} from device {device_id}");

        self.events.push(UsbEvent::MediaFileRemoved {
            device_id: device_id.to_string(),
            file_name: file_name.to_string(),
        });
        self.events.push(UsbEvent::MediaFilesChanged {
            device_id: device_id.to_string(),
            files,
        });
        true
    }

    /// Every known device, connected or not.
    pub fn devices(&self) -> &[UsbDevice] {
        &self.devices
    }

    pub fn connected_devices(&self) -> Vec<&UsbDevice> {
        self.devices.iter().filter(|d| d.is_connected).collect()
    }

    pub fn device(&self, device_id: &str) -> Option<&UsbDevice> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    /// Empty for unknown devices.
    pub fn media_files(&self, device_id: &str) -> &[MediaFile] {
        self.device(device_id)
            .map(|d| d.media_files.as_slice())
            .unwrap_or_default()
    }

    pub fn is_device_connected(&self, device_id: &str) -> bool {
        self.device(device_id).is_some_and(|d| d.is_connected)
    }

    pub fn supported_formats(&self) -> &[String] {
        &self.config.supported_formats
    }

    pub fn is_media_file(&self, file_name: &str) -> bool {
        media::is_supported(file_name, &self.config.supported_formats)
    }

    pub fn file_metadata(&self, path: &Path) -> TrackMetadata {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        media::metadata_for(path, size)
    }

    pub fn set_watch_directories(&mut self, directories: Vec<PathBuf>) {
        self.config.watch_directories = directories;
        if self.monitoring {
            self.init_watch();
        }
    }

    pub fn set_supported_formats(&mut self, formats: Vec<String>) {
        self.config.supported_formats = formats.into_iter().map(|f| f.to_ascii_lowercase()).collect();
        info!("Supported formats updated: {}", self.config.supported_formats.join(", "));
    }

    pub fn enable_auto_scan(&mut self, enable: bool) {
        self.config.auto_scan = enable;
        if enable && self.monitoring {
            self.arm_rescan();
        } else {
            self.clock.cancel(&UsbTimer::Rescan);
        }
        info!("Auto scan {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn simulate_mount_error(&mut self, enable: bool) {
        self.faults.set(InjectedFault::MountError, enable);
        info!("Mount error simulation {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn simulate_file_system_error(&mut self, enable: bool) {
        self.faults.set(InjectedFault::FileSystemError, enable);
        info!("File system error simulation {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn simulate_corrupted_files(&mut self, enable: bool) {
        self.faults.set(InjectedFault::CorruptedFiles, enable);
        info!("Corrupted files simulation {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn config(&self) -> &UsbConfig {
        &self.config
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear_all();
        info!("USB error injection cleared");
    }

    pub fn clock_stats(&self) -> &ClockStats {
        self.clock.get_stats()
    }

    /// Directories currently under watch.
    pub fn watched_paths(&self) -> &[PathBuf] {
        self.watch.as_ref().map(|w| w.watched()).unwrap_or_default()
    }

    pub fn save_device_list(&self) {
        self.persist();
    }

    fn index_of(&self, device_id: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.device_id == device_id)
    }

    fn report_fs_error(&mut self, device_id: &str, message: &str) {
        error!("Scan of device {device_id} failed: {message}");
        self.events.push(UsbEvent::FileSystemError {
            device_id: device_id.to_string(),
            error: message.to_string(),
        });
    }

    fn arm_rescan(&mut self) {
        self.clock.cancel(&UsbTimer::Rescan);
        if let Err(e) = self
            .clock
            .schedule_every(UsbTimer::Rescan, self.config.rescan_interval_ms)
        {
            error!("Cannot schedule media rescans: {e}");
        }
    }

    fn init_watch(&mut self) {
        let mut watch = match self.watch.take() {
            Some(mut existing) => {
                existing.unwatch_all();
                existing
            }
            None => match DirectoryWatch::new() {
                Ok(watch) => watch,
                Err(e) => {
                    warn!("Directory watching unavailable, relying on periodic rescans: {e}");
                    return;
                }
            },
        };

        for directory in &self.config.watch_directories {
            watch.watch(directory);
        }
        for device in self.devices.iter().filter(|d| d.is_connected) {
            watch.watch(&device.mount_point);
        }
        self.watch = Some(watch);
    }

    fn watch_path(&mut self, path: &Path) {
        if let Some(watch) = &mut self.watch {
            watch.watch(path);
        }
    }

    fn unwatch_path(&mut self, path: &Path) {
        if let Some(watch) = &mut self.watch {
            watch.unwatch(path);
        }
    }

    /// Map watch reports to the connected devices whose mount point they touch.
    fn devices_touched_by_watch(&mut self) -> Vec<String> {
        let Some(watch) = &mut self.watch else {
            return Vec::new();
        };
        let changed = watch.changed_paths();
        if changed.is_empty() {
            return Vec::new();
        }

        let mut touched = Vec::new();
        for device in self.devices.iter().filter(|d| d.is_connected) {
            let canonical = device.mount_point.canonicalize().ok();
            let hit = changed.iter().any(|path| {
                path.starts_with(&device.mount_point)
                    || canonical.as_ref().is_some_and(|c| path.starts_with(c))
            });
            if hit {
                touched.push(device.device_id.clone());
            }
        }
        touched
    }

    fn rescan_connected(&mut self) {
        let ids: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.is_connected)
            .map(|d| d.device_id.clone())
            .collect();
        for id in ids {
            self.scan_media_files(&id);
        }
    }

    fn generate_device_id(&mut self) -> String {
        loop {
            let id = format!("USB_{:08X}", self.rng.gen::<u32>());
            if self.index_of(&id).is_none() {
                return id;
            }
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            match store.save(&self.devices) {
                Ok(()) => debug!("Device list saved"),
                Err(e) => error!("Failed to save USB device list: {e}"),
            }
        }
    }
}

/// `(total, free)` bytes of the filesystem holding `path`.
#[cfg(unix)]
fn filesystem_space(path: &Path) -> Option<(u64, u64)> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let fragment = stat.fragment_size() as u64;
            Some((
                (stat.blocks() as u64).saturating_mul(fragment),
                (stat.blocks_available() as u64).saturating_mul(fragment),
            ))
        }
        Err(e) => {
            debug!("statvfs {} failed: {e}", path.display());
            None
        }
    }
}

#[cfg(not(unix))]
fn filesystem_space(_path: &Path) -> Option<(u64, u64)> {
    None
}

impl Subsystem for RemovableMediaTracker {
    type Event = UsbEvent;

    fn id(&self) -> SubsystemId {
        SubsystemId::Usb
    }

    fn advance_to(&mut self, now_ms: u64) {
        for device_id in self.devices_touched_by_watch() {
            debug!("Directory changed for device {device_id}");
            self.scan_media_files(&device_id);
        }

        while let Some(timer) = self.clock.pop_due(now_ms) {
            match timer {
                UsbTimer::Rescan => self.rescan_connected(),
            }
        }
        self.clock.settle(now_ms);
    }

    fn drain_events(&mut self) -> Vec<UsbEvent> {
        self.events.drain()
    }

    fn shutdown(&mut self) {
        self.stop_monitoring();
        self.clock.clear_all();
        self.persist();
        info!("USB Monitor system shutdown");
    }

    fn is_healthy(&self) -> bool {
        !self.faults.is_armed(InjectedFault::FileSystemError)
            && !self.faults.is_armed(InjectedFault::CorruptedFiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(root: &Path) -> RemovableMediaTracker {
        let config = UsbConfig {
            watch_root: root.to_path_buf(),
            watch_directories: vec![root.to_path_buf()],
            ..UsbConfig::default()
        };
        RemovableMediaTracker::new(&config, Some(5))
    }

    #[test]
    fn test_insertion_creates_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let mut usb = tracker(dir.path());
        let id = usb.simulate_insertion("SanDisk");

        let device = usb.device(&id).unwrap();
        assert_eq!(device.mount_point, dir.path().join(&id));
        assert!(device.mount_point.is_dir());
        assert_eq!(device.total_space, SIMULATED_TOTAL_SPACE);
        assert_eq!(device.file_system, "FAT32");
        assert!(usb.is_device_connected(&id));
    }

    #[test]
    fn test_removal_without_id_takes_first_connected() {
        let dir = tempfile::tempdir().unwrap();
        let mut usb = tracker(dir.path());
        let first = usb.simulate_insertion("A");
        let second = usb.simulate_insertion("B");
        usb.unmount(&first);

        assert_eq!(usb.simulate_removal(None), Some(second));
        assert_eq!(usb.devices().len(), 1);
    }

    #[test]
    fn test_formats_are_lowercased() {
        let dir = tempfile::tempdir().unwrap();
        let mut usb = tracker(dir.path());
        usb.set_supported_formats(vec!["MP3".into(), "Ogg".into()]);
        assert_eq!(usb.supported_formats(), &["mp3".to_string(), "ogg".to_string()]);
        assert!(usb.is_media_file("x.OGG"));
        assert!(!usb.is_media_file("x.wav"));
    }

    #[test]
    fn test_auto_scan_toggle_controls_timer() {
        let dir = tempfile::tempdir().unwrap();
        let mut usb = tracker(dir.path());
        usb.start_monitoring();
        assert!(usb.clock.is_scheduled(&UsbTimer::Rescan));
        usb.enable_auto_scan(false);
        assert!(!usb.clock.is_scheduled(&UsbTimer::Rescan));
        usb.stop_monitoring();
        assert!(!usb.is_monitoring());
    }
}
