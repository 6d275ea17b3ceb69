//! Media file discovery and filename-derived metadata.

use crate::persistence::iso_format_opt;
use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";
pub const UNKNOWN_DURATION: &str = "00:00";

const MP3_BITS_PER_SECOND: u64 = 128 * 1024;
const WAV_BYTES_PER_SECOND: u64 = 44_100 * 2 * 2;

/// One playable file on a removable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFile {
    pub file_name: String,
    pub file_path: PathBuf,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration: String,
    pub file_size: u64,
    pub file_type: String,
    #[serde(with = "iso_format_opt", default)]
    pub last_modified: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration: String,
}

/// Lowercased extension of `file_name`, if any.
pub fn extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

pub fn is_supported(file_name: &str, formats: &[String]) -> bool {
    extension(file_name).is_some_and(|ext| formats.iter().any(|f| f.eq_ignore_ascii_case(&ext)))
}

/// Rough play time from the file size; only mp3 and wav are estimated.
pub fn estimate_duration(file_type: &str, size: u64) -> String {
    let seconds = match file_type {
        "mp3" => size.saturating_mul(8) / MP3_BITS_PER_SECOND,
        "wav" => size / WAV_BYTES_PER_SECOND,
        _ => return UNKNOWN_DURATION.to_string(),
    };
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Metadata from the `Artist - Title` naming convention, falling back to
/// the bare file stem.
pub fn metadata_for(path: &Path, size: u64) -> TrackMetadata {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_type = path
        .file_name()
        .and_then(|n| extension(&n.to_string_lossy()))
        .unwrap_or_default();

    let mut parts = stem.split(" - ");
    let (artist, title) = match (parts.next(), parts.next()) {
        (Some(artist), Some(title)) => (artist.trim().to_string(), title.trim().to_string()),
        _ => (UNKNOWN_ARTIST.to_string(), stem.clone()),
    };

    TrackMetadata {
        title,
        artist,
        album: UNKNOWN_ALBUM.to_string(),
        duration: estimate_duration(&file_type, size),
    }
}

/// Build a [`MediaFile`] from what is on disk at `path`.
pub fn media_file_from_path(path: &Path) -> io::Result<MediaFile> {
    let info = std::fs::metadata(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let size = info.len();
    let metadata = metadata_for(path, size);

    Ok(MediaFile {
        file_type: extension(&file_name).unwrap_or_default(),
        file_name,
        file_path: path.to_path_buf(),
        title: metadata.title,
        artist: metadata.artist,
        album: metadata.album,
        duration: metadata.duration,
        file_size: size,
        last_modified: info
            .modified()
            .ok()
            .map(|t| DateTime::<Local>::from(t).naive_local()),
    })
}

/// List the supported media files directly under `dir`, sorted by name.
pub fn scan_directory(dir: &Path, formats: &[String]) -> io::Result<Vec<MediaFile>> {
    let root = dir.canonicalize()?;
    let mut files = Vec::new();

    for entry in std::fs::read_dir(&root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_supported(&name, formats) {
            continue;
        }
        match media_file_from_path(&root.join(&name)) {
            Ok(file) => files.push(file),
            // Deleted between listing and stat
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }

    files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MEDIA_FORMATS;

    fn formats() -> Vec<String> {
        DEFAULT_MEDIA_FORMATS.iter().map(|f| (*f).to_string()).collect()
    }

    #[test]
    fn test_artist_title_split() {
        let meta = metadata_for(Path::new("/mnt/usb/Daft Punk - One More Time.mp3"), 0);
        assert_eq!(meta.artist, "Daft Punk");
        assert_eq!(meta.title, "One More Time");
        assert_eq!(meta.album, UNKNOWN_ALBUM);
    }

    #[test]
    fn test_plain_name_fallback() {
        let meta = metadata_for(Path::new("track01.wav"), 0);
        assert_eq!(meta.title, "track01");
        assert_eq!(meta.artist, UNKNOWN_ARTIST);
    }

    #[test]
    fn test_duration_estimate() {
        // 128 kbit/s for 3 minutes 5 seconds
        assert_eq!(estimate_duration("mp3", 185 * 128 * 1024 / 8), "03:05");
        assert_eq!(estimate_duration("wav", 44_100 * 4 * 61), "01:01");
        assert_eq!(estimate_duration("flac", 10_000_000), "00:00");
    }

    #[test]
    fn test_is_supported_is_case_insensitive() {
        let formats = formats();
        assert!(is_supported("song.MP3", &formats));
        assert!(is_supported("clip.webm", &formats));
        assert!(!is_supported("notes.txt", &formats));
        assert!(!is_supported("mp3", &formats));
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.mp3"), b"bb").unwrap();
        std::fs::write(dir.path().join("a.flac"), b"a").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"text").unwrap();
        std::fs::create_dir(dir.path().join("folder.mp3")).unwrap();

        let files = scan_directory(dir.path(), &formats()).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.flac", "b.mp3"]);
        assert_eq!(files[1].file_size, 2);
        assert_eq!(files[1].file_type, "mp3");
        assert!(files[1].file_path.is_absolute());
    }

    #[test]
    fn test_scan_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_directory(&dir.path().join("gone"), &formats()).is_err());
    }
}
