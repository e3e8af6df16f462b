//! File persistence helpers: the daily CSV event log and JSON rollup
//! artifacts.

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

use crate::model::DelayEvent;
use csv::WriterBuilder;

/// Appends a resolved [`DelayEvent`] to that day's CSV log under `dir`.
///
/// Creates the file with headers if it does not already exist.
pub fn append_event(dir: &Path, event: &DelayEvent) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let date = event.started_at.date_naive().format("%Y-%m-%d");
    let path = dir.join(format!("events_date={date}.csv"));
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending event CSV record");

    let file = OpenOptions::new().append(true).create(true).open(&path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(event)?;
    writer.flush()?;

    Ok(())
}

/// Loads every event from the daily CSV logs under `dir`.
pub fn load_events(dir: &Path) -> Result<Vec<DelayEvent>> {
    let mut events = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("events_date=") || path.extension().and_then(|e| e.to_str()) != Some("csv")
        {
            continue;
        }

        let file = File::open(&path)?;
        let mut rdr = csv::Reader::from_reader(file);
        for result in rdr.deserialize() {
            let event: DelayEvent = result?;
            events.push(event);
        }
    }

    Ok(events)
}

/// Writes a value as pretty JSON, replacing any previous file content.
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Reads a JSON file back into a value.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Classification;
    use chrono::{Duration, TimeZone, Utc};
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn event() -> DelayEvent {
        let started_at = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        DelayEvent {
            id: 1,
            vehicle_id: "1000".to_string(),
            line: "17".to_string(),
            lat: 52.23,
            lon: 21.01,
            started_at,
            resolved_at: Some(started_at + Duration::seconds(150)),
            duration_seconds: Some(150),
            classification: Classification::Delay,
            at_stop: false,
            near_intersection: true,
            multi_cycle: true,
        }
    }

    #[test]
    fn test_append_event_creates_dated_file() {
        let dir = temp_dir("tram_delay_tracker_test_append");

        append_event(&dir, &event()).unwrap();

        let path = dir.join("events_date=2025-06-01.csv");
        assert!(path.exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.is_empty());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_append_event_writes_header_once() {
        let dir = temp_dir("tram_delay_tracker_test_header");

        append_event(&dir, &event()).unwrap();
        append_event(&dir, &event()).unwrap();

        let content = fs::read_to_string(dir.join("events_date=2025-06-01.csv")).unwrap();
        let header_count = content.lines().filter(|l| l.contains("vehicle_id")).count();
        assert_eq!(header_count, 1);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_event_csv_round_trip() {
        let dir = temp_dir("tram_delay_tracker_test_roundtrip");

        append_event(&dir, &event()).unwrap();
        append_event(&dir, &event()).unwrap();

        let events = load_events(&dir).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].classification, Classification::Delay);
        assert_eq!(events[0].duration_seconds, Some(150));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = temp_dir("tram_delay_tracker_test_json");
        let path = dir.join("value.json");

        write_json_file(&path, &vec![1, 2, 3]).unwrap();
        let back: Vec<i32> = read_json_file(&path).unwrap();
        assert_eq!(back, vec![1, 2, 3]);

        fs::remove_dir_all(&dir).unwrap();
    }
}
