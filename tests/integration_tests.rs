use headunit::config::HeadUnitConfig;
use headunit::fault_injection::InjectedFault;
use headunit::protocol::ResponseStatus;
use headunit::subsystems::{ConnectionState, SubsystemId};
use headunit::{Command, CommandType, HeadUnit};
use serde_json::{json, Value};
use std::path::Path;

fn test_config(dir: &Path) -> HeadUnitConfig {
    let mut config = HeadUnitConfig {
        config_dir: dir.join("config"),
        seed: Some(1234),
        ..HeadUnitConfig::default()
    };
    config.usb.watch_root = dir.join("mnt");
    config.usb.watch_directories = Vec::new();
    config.sensor.data_logging = false;
    config
}

fn started_unit(dir: &Path) -> HeadUnit {
    let mut unit = HeadUnit::new(test_config(dir));
    unit.start();
    unit
}

fn send(unit: &mut HeadUnit, id: u32, command_type: Value) -> Value {
    let line = json!({ "id": id, "command_type": command_type }).to_string();
    let response = unit.handle_json(&line).unwrap();
    serde_json::from_str(&response).unwrap()
}

#[cfg(test)]
mod protocol_tests {
    use super::*;

    #[test]
    fn test_ping_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = started_unit(dir.path());

        let pong = send(&mut unit, 1, json!("Ping"));
        assert_eq!(pong["id"], 1);
        assert_eq!(pong["status"], "Success");

        let status = send(&mut unit, 2, json!("SystemStatus"));
        assert_eq!(status["data"]["state"]["running"], true);
        assert_eq!(status["data"]["sensor"]["connected"], true);
        assert_eq!(status["data"]["sensor"]["address"], 0x48);
        assert_eq!(status["data"]["bluetooth"]["initialized"], true);
        assert_eq!(status["data"]["usb"]["monitoring"], true);
        assert_eq!(status["data"]["state"]["command_count"], 2);
    }

    #[test]
    fn test_malformed_lines_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = started_unit(dir.path());

        let garbage: Value = serde_json::from_str(&unit.handle_json("{not json").unwrap()).unwrap();
        assert_eq!(garbage["status"], "InvalidCommand");

        let unknown = send(&mut unit, 5, json!("SelfDestruct"));
        assert_eq!(unknown["status"], "InvalidCommand");

        let bad_range = send(
            &mut unit,
            6,
            json!({ "SensorSetRange": { "channel": "temperature", "min": 30.0, "max": 10.0 } }),
        );
        assert_eq!(bad_range["status"], "NegativeAck");
        assert_eq!(unit.sensor().calibration().temperature_range, [18.0, 25.0]);
    }

    #[test]
    fn test_queued_commands_answered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = started_unit(dir.path());

        for id in 1..=3 {
            unit.queue_command(Command {
                id,
                command_type: CommandType::Ping,
            })
            .unwrap();
        }
        unit.process_commands().unwrap();

        let responses = unit.get_responses();
        let ids: Vec<u32> = responses.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(responses.iter().all(|r| r.status == ResponseStatus::Success));
        assert!(unit.get_responses().is_empty());
    }
}

#[cfg(test)]
mod scenario_tests {
    use super::*;

    #[test]
    fn test_bluetooth_pair_and_connect_over_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = started_unit(dir.path());

        let appeared = send(
            &mut unit,
            1,
            json!({ "SimulateDeviceAppearance": { "name": "Pixel 8", "device_type": "phone" } }),
        );
        let device_id = appeared["data"].as_str().unwrap().to_string();

        let pair = send(&mut unit, 2, json!({ "Pair": { "device_id": device_id } }));
        assert_eq!(pair["status"], "Success");

        unit.advance_by(10_000);
        let connect = send(&mut unit, 3, json!({ "Connect": { "device_id": device_id } }));
        assert_eq!(connect["status"], "Success");
        unit.advance_by(15_000);
        assert_eq!(unit.bluetooth().connection_state(&device_id), ConnectionState::Connected);

        let listing = send(&mut unit, 4, json!("ListBluetoothDevices"));
        assert_eq!(listing["data"]["available"].as_array().unwrap().len(), 0);
        assert_eq!(listing["data"]["paired"][0]["deviceId"], device_id.as_str());

        let kinds: Vec<String> = unit
            .drain_notifications()
            .iter()
            .map(|n| serde_json::to_value(n).unwrap())
            .filter(|v| v["subsystem"] == "bluetooth")
            .map(|v| v["event"]["type"].as_str().unwrap_or_default().to_string())
            .collect();
        let paired = kinds.iter().position(|k| k == "device_paired").unwrap();
        let connected = kinds.iter().position(|k| k == "device_connected").unwrap();
        assert_eq!(kinds[0], "device_discovered");
        assert!(paired < connected);
    }

    #[test]
    fn test_refused_operation_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = started_unit(dir.path());

        let response = send(&mut unit, 9, json!({ "Connect": { "device_id": "BT_000000000000" } }));
        assert_eq!(response["status"], "Error");
        assert!(response["message"].as_str().is_some());
        assert!(unit.state().last_error.is_some());
    }

    #[test]
    fn test_sensor_updates_reach_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = started_unit(dir.path());
        unit.drain_notifications();

        unit.advance_to(15_000);
        let updates: Vec<Value> = unit
            .drain_notifications()
            .iter()
            .map(|n| serde_json::to_value(n).unwrap())
            .filter(|v| v["subsystem"] == "sensor" && v["event"]["type"] == "data_updated")
            .collect();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0]["event"]["data"]["valid"], true);

        let read = send(&mut unit, 1, json!("SensorRead"));
        assert!(read["data"]["temperature"].as_f64().is_some());
    }

    #[test]
    fn test_usb_insert_scan_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = started_unit(dir.path());

        let inserted = send(&mut unit, 1, json!({ "SimulateUsbInsertion": { "name": "SanDisk" } }));
        let device_id = inserted["data"].as_str().unwrap().to_string();
        assert!(device_id.starts_with("USB_"));

        let mount = unit.usb().device(&device_id).unwrap().mount_point.clone();
        std::fs::write(mount.join("Queen - Bohemian Rhapsody.flac"), vec![0u8; 4096]).unwrap();

        let scan = send(&mut unit, 2, json!({ "ScanMedia": { "device_id": device_id } }));
        assert_eq!(scan["status"], "Success");
        assert_eq!(scan["data"][0]["artist"], "Queen");
        assert_eq!(scan["data"][0]["title"], "Bohemian Rhapsody");

        let removed = send(&mut unit, 3, json!({ "SimulateUsbRemoval": { "device_id": null } }));
        assert_eq!(removed["data"], device_id.as_str());
        let again = send(&mut unit, 4, json!({ "SimulateUsbRemoval": { "device_id": null } }));
        assert_eq!(again["status"], "Error");
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let device_id = {
            let mut unit = started_unit(dir.path());
            unit.sensor_mut()
                .calibrate(headunit::subsystems::SensorChannel::Temperature, 1.5);
            let bt = unit.bluetooth_mut();
            let id = bt.simulate_device_appearance("Car Kit", headunit::subsystems::DeviceType::CarAudio);
            bt.pair(&id);
            unit.advance_by(10_000);
            unit.stop();
            id
        };

        let unit = started_unit(dir.path());
        assert_eq!(unit.sensor().calibration().temperature_offset, 1.5);
        assert!(unit.bluetooth().is_device_paired(&device_id));
    }
}

#[cfg(test)]
mod fault_injection_tests {
    use super::*;

    #[test]
    fn test_inject_and_clear_over_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = started_unit(dir.path());

        let inject = send(
            &mut unit,
            1,
            json!({ "InjectFault": { "fault": "sensor_failure", "enabled": true, "device_id": null } }),
        );
        assert_eq!(inject["status"], "Success");
        unit.advance_to(5_000);
        assert!(!unit.sensor().current_reading().valid);

        let status = send(&mut unit, 2, json!("GetFaultInjectionStatus"));
        assert_eq!(status["data"][0][0], "sensor");
        assert_eq!(status["data"][0][1][0], "sensor_failure");

        let clear = send(&mut unit, 3, json!({ "ClearFaults": { "target": "sensor" } }));
        assert_eq!(clear["status"], "Success");
        unit.advance_to(10_000);
        assert!(unit.sensor().current_reading().valid);
    }

    #[test]
    fn test_device_scoped_fault_needs_bluetooth_fault() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = started_unit(dir.path());

        let response = send(
            &mut unit,
            1,
            json!({ "InjectFault": { "fault": "mount_error", "enabled": true, "device_id": "BT_1" } }),
        );
        assert_eq!(response["status"], "NegativeAck");
        assert!(unit.usb().faults().get_armed().is_empty());
    }

    #[test]
    fn test_radio_off_blocks_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = started_unit(dir.path());
        let id = unit
            .bluetooth_mut()
            .simulate_device_appearance("AirPods", headunit::subsystems::DeviceType::Headset);

        unit.inject_fault(InjectedFault::RadioOff, true, None);
        assert!(!unit.bluetooth_mut().pair(&id));

        unit.clear_faults(Some(SubsystemId::Bluetooth));
        assert!(unit.bluetooth_mut().pair(&id));
    }
}
