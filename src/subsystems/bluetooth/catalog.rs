//! Plausible device data for simulated discovery.

use super::device::{DeviceAddress, DeviceType};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt::Write;

/// Every profile label the simulated radio knows about.
pub const KNOWN_PROFILES: [&str; 8] = ["A2DP", "AVRCP", "HFP", "HSP", "PBAP", "MAP", "OPP", "HID"];

pub fn names(device_type: DeviceType) -> &'static [&'static str] {
    match device_type {
        DeviceType::Phone => &["iPhone", "Samsung Galaxy", "Google Pixel", "OnePlus", "Xiaomi"],
        DeviceType::Headset => &[
            "Sony WH-1000XM",
            "Bose QuietComfort",
            "Apple AirPods",
            "Samsung Galaxy Buds",
            "Jabra Elite",
        ],
        DeviceType::Speaker => &["JBL Flip", "Bose SoundLink", "Sony SRS", "UE Boom", "Anker Soundcore"],
        DeviceType::CarAudio => &[
            "VW Passat Audio",
            "BMW iDrive",
            "Mercedes COMAND",
            "Audi MMI",
            "Tesla Audio",
        ],
        DeviceType::Smartwatch => &[
            "Apple Watch",
            "Samsung Galaxy Watch",
            "Garmin Fenix",
            "Fitbit Sense",
            "Amazfit",
        ],
        DeviceType::Tablet => &["iPad", "Galaxy Tab", "Surface Go", "Lenovo Tab", "Fire HD"],
        DeviceType::Laptop => &["MacBook", "ThinkPad", "Dell XPS", "Surface Laptop", "HP Spectre"],
    }
}

pub fn profiles(device_type: DeviceType) -> &'static [&'static str] {
    match device_type {
        DeviceType::Phone | DeviceType::CarAudio => &["A2DP", "AVRCP", "HFP", "HSP", "PBAP", "MAP"],
        DeviceType::Headset => &["A2DP", "AVRCP", "HFP", "HSP"],
        DeviceType::Speaker => &["A2DP", "AVRCP"],
        DeviceType::Smartwatch => &["HFP", "HSP", "OPP"],
        DeviceType::Tablet => &["A2DP", "AVRCP", "OPP"],
        DeviceType::Laptop => &["A2DP", "AVRCP", "OPP", "HID"],
    }
}

/// `(manufacturer, model)` used when a device is generated.
pub fn vendor(device_type: DeviceType, name: &str) -> (String, String) {
    let manufacturer = match name.split_whitespace().next() {
        Some("iPhone" | "iPad" | "MacBook") => "Apple",
        Some("Galaxy") => "Samsung",
        Some("ThinkPad") => "Lenovo",
        Some("Surface") => "Microsoft",
        Some("Fire") => "Amazon",
        Some("VW") => "Volkswagen",
        Some("UE") => "Ultimate Ears",
        Some(first) => first,
        None => "Generic Manufacturer",
    };

    let model = match device_type {
        DeviceType::CarAudio => format!("{name} Head Unit"),
        _ => name.to_string(),
    };

    (manufacturer.to_string(), model)
}

pub fn firmware_version(device_type: DeviceType) -> &'static str {
    match device_type {
        DeviceType::Phone | DeviceType::Tablet | DeviceType::Laptop => "5.3.0",
        DeviceType::Headset | DeviceType::Smartwatch => "5.2.1",
        DeviceType::Speaker => "5.0.4",
        DeviceType::CarAudio => "4.2.0",
    }
}

pub fn random_name<R: Rng + ?Sized>(device_type: DeviceType, rng: &mut R) -> String {
    names(device_type)
        .choose(rng)
        .map_or_else(|| "Generic Device".to_string(), |name| (*name).to_string())
}

pub fn random_type<R: Rng + ?Sized>(rng: &mut R) -> DeviceType {
    DeviceType::ALL
        .choose(rng)
        .copied()
        .unwrap_or(DeviceType::Phone)
}

/// Six random octets as uppercase hex pairs.
pub fn random_address<R: Rng + ?Sized>(rng: &mut R) -> DeviceAddress {
    let mut address = DeviceAddress::new();
    for i in 0..6 {
        if i > 0 {
            address.push(':');
        }
        // 17 chars always fit
        let _ = write!(address, "{:02X}", rng.gen::<u8>());
    }
    address
}

pub fn random_signal_strength<R: Rng + ?Sized>(rng: &mut R) -> u8 {
    rng.gen_range(75..=100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_address_format() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let address = random_address(&mut rng);
            assert_eq!(address.len(), 17);
            let octets: Vec<&str> = address.split(':').collect();
            assert_eq!(octets.len(), 6);
            for octet in octets {
                assert_eq!(octet.len(), 2);
                assert!(octet.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
            }
        }
    }

    #[test]
    fn test_every_type_has_names_and_known_profiles() {
        for device_type in DeviceType::ALL {
            assert!(!names(device_type).is_empty());
            for profile in profiles(device_type) {
                assert!(KNOWN_PROFILES.contains(profile));
            }
        }
    }

    #[test]
    fn test_speaker_profiles() {
        assert_eq!(profiles(DeviceType::Speaker), &["A2DP", "AVRCP"]);
        assert_eq!(profiles(DeviceType::Smartwatch), &["HFP", "HSP", "OPP"]);
    }

    #[test]
    fn test_signal_strength_range() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..200 {
            let strength = random_signal_strength(&mut rng);
            assert!((75..=100).contains(&strength));
        }
    }

    #[test]
    fn test_vendor_metadata() {
        assert_eq!(vendor(DeviceType::Phone, "iPhone").0, "Apple");
        assert_eq!(vendor(DeviceType::Laptop, "ThinkPad").0, "Lenovo");
        let (manufacturer, model) = vendor(DeviceType::CarAudio, "BMW iDrive");
        assert_eq!(manufacturer, "BMW");
        assert_eq!(model, "BMW iDrive Head Unit");
    }
}
