//! JSON file persistence shared by the three subsystems.
//!
//! Each subsystem owns one [`JsonStore`]. Writes go to a sibling temporary
//! file first and are renamed into place, so a crash mid-write never leaves
//! a truncated state file behind. Callers treat every error as non-fatal:
//! they log it and keep running on in-memory state.

use crate::error::PersistenceError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decode the file. `Ok(None)` when it does not exist yet.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, PersistenceError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path).map_err(|source| PersistenceError::Read {
            path: self.path.clone(),
            source,
        })?;

        let value = serde_json::from_str(&content).map_err(|source| PersistenceError::Parse {
            path: self.path.clone(),
            source,
        })?;

        debug!("Loaded {}", self.path.display());
        Ok(Some(value))
    }

    pub fn save<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(value)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, content).map_err(|source| PersistenceError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        })?;

        debug!("Saved {}", self.path.display());
        Ok(())
    }
}

/// `chrono` timestamps in the `yyyy-MM-dd hh:mm:ss` wall-clock form the head
/// unit writes for "last seen" and sensor reading stamps.
pub mod wall_clock_format {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// ISO-8601 local timestamps without offset (`2024-03-09T07:05:01`).
pub mod iso_format {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Accepts fractional seconds, which older files may carry.
    pub(crate) fn parse(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
    }
}

/// Optional form of [`iso_format`]. An empty string or `null` reads as `None`.
pub mod iso_format_opt {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => super::iso_format::serialize(value, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) if !s.trim().is_empty() => super::iso_format::parse(s.trim())
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<u32>,
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("missing.json"));
        let loaded: Option<Sample> = store.load().unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("nested/config/state.json"));
        let sample = Sample {
            name: "usb".into(),
            values: vec![1, 2, 3],
        };
        store.save(&sample).unwrap();

        assert_eq!(store.load::<Sample>().unwrap(), Some(sample));
        assert!(!dir.path().join("nested/config/state.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonStore::new(&path);
        assert!(matches!(
            store.load::<Sample>(),
            Err(PersistenceError::Parse { .. })
        ));
    }

    #[test]
    fn test_write_into_file_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").unwrap();

        let store = JsonStore::new(blocker.join("state.json"));
        assert!(store.save(&vec![1u8]).is_err());
    }

    #[test]
    fn test_wall_clock_format() {
        #[derive(Serialize, Deserialize)]
        struct Stamp {
            #[serde(with = "wall_clock_format")]
            at: chrono::NaiveDateTime,
        }

        let at = chrono::NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap();
        let json = serde_json::to_string(&Stamp { at }).unwrap();
        assert_eq!(json, r#"{"at":"2024-03-09 07:05:01"}"#);

        let back: Stamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back.at, at);
    }

    #[test]
    fn test_optional_iso_timestamp() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Paired {
            #[serde(with = "iso_format_opt", default)]
            at: Option<chrono::NaiveDateTime>,
        }

        let json = serde_json::to_string(&Paired {
            at: chrono::NaiveDate::from_ymd_opt(2025, 1, 2)
                .unwrap()
                .and_hms_opt(10, 30, 0),
        })
        .unwrap();
        assert_eq!(json, r#"{"at":"2025-01-02T10:30:00"}"#);

        let empty: Paired = serde_json::from_str(r#"{"at":""}"#).unwrap();
        assert!(empty.at.is_none());
        let null: Paired = serde_json::from_str(r#"{"at":null}"#).unwrap();
        assert!(null.at.is_none());
        let missing: Paired = serde_json::from_str("{}").unwrap();
        assert!(missing.at.is_none());
        let fractional: Paired = serde_json::from_str(r#"{"at":"2025-01-02T10:30:00.250"}"#).unwrap();
        assert!(fractional.at.is_some());
    }
}
