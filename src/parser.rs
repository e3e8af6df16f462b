//! Parsing and validation of fleet snapshot records.
//!
//! The feed delivers a JSON array of raw records whose coordinates arrive as
//! free-form text. Malformed records are skipped, never fatal.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::model::VehiclePosition;

/// A raw record as delivered by the feed, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPosition {
    pub vehicle_id: String,
    pub line: String,
    pub lat: String,
    pub lon: String,
    pub observed_at: DateTime<Utc>,
}

/// Decodes a JSON fleet snapshot from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid JSON array of records.
pub fn parse_snapshot(bytes: &[u8]) -> Result<Vec<RawPosition>> {
    Ok(serde_json::from_slice(bytes)?)
}

impl RawPosition {
    /// Trims and parses the free-form coordinate fields.
    ///
    /// Returns `None` when either coordinate fails to parse; the caller
    /// skips the record and moves on with the batch.
    pub fn into_position(self) -> Option<VehiclePosition> {
        let lat: f64 = self.lat.trim().parse().ok()?;
        let lon: f64 = self.lon.trim().parse().ok()?;

        Some(VehiclePosition {
            vehicle_id: self.vehicle_id,
            line: self.line.trim().to_string(),
            lat,
            lon,
            observed_at: self.observed_at,
        })
    }
}

/// Whether a line identifier belongs to the tram network.
///
/// Tram lines are plain numerics within the operator's range. Bus lines sit
/// above it, night buses carry an `N` prefix, and anything non-numeric or
/// empty is out of scope.
pub fn is_tram_line(line: &str, max_tram_line: u32) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    match line.parse::<u32>() {
        Ok(n) => n >= 1 && n <= max_tram_line,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(lat: &str, lon: &str) -> RawPosition {
        RawPosition {
            vehicle_id: "1000".to_string(),
            line: "17".to_string(),
            lat: lat.to_string(),
            lon: lon.to_string(),
            observed_at: Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_parse_snapshot_empty_array() {
        let records = parse_snapshot(b"[]").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_parse_snapshot_invalid_json() {
        assert!(parse_snapshot(b"{not json").is_err());
    }

    #[test]
    fn test_parse_snapshot_one_record() {
        let body = br#"[{"vehicle_id":"1000","line":"17","lat":"52.2300",
            "lon":"21.0100","observed_at":"2025-06-01T08:30:00Z"}]"#;
        let records = parse_snapshot(body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].vehicle_id, "1000");
    }

    #[test]
    fn test_into_position_trims_whitespace() {
        let pos = raw("  52.2300 ", " 21.0100\n").into_position().unwrap();
        assert_eq!(pos.lat, 52.23);
        assert_eq!(pos.lon, 21.01);
    }

    #[test]
    fn test_into_position_rejects_malformed_coordinates() {
        assert!(raw("52,23", "21.01").into_position().is_none());
        assert!(raw("", "21.01").into_position().is_none());
        assert!(raw("52.23", "east").into_position().is_none());
    }

    #[test]
    fn test_tram_line_filter() {
        assert!(is_tram_line("4", 99));
        assert!(is_tram_line("17", 99));
        assert!(is_tram_line(" 33 ", 99));
        // Buses, night buses, and junk are out of scope.
        assert!(!is_tram_line("190", 99));
        assert!(!is_tram_line("N02", 99));
        assert!(!is_tram_line("", 99));
        assert!(!is_tram_line("A", 99));
        assert!(!is_tram_line("0", 99));
    }
}
