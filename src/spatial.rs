//! Proximity lookups against known platforms and signal-controlled crossings.
//!
//! The tracker only needs a yes/no answer per coordinate pair; richer spatial
//! analysis (clustering, nearest-stop reports) lives in the downstream query
//! service.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

use crate::geo::haversine_m;

/// Proximity answers for one position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProximityFlags {
    pub at_stop: bool,
    pub near_intersection: bool,
}

/// Answers platform/intersection proximity questions for the tracker.
pub trait SpatialIndex: Send + Sync {
    fn classify_point(&self, lat: f64, lon: f64) -> ProximityFlags;
}

#[derive(Debug, Deserialize)]
struct RefPoint {
    lat: f64,
    lon: f64,
}

/// In-memory index over fixed reference points, answered by haversine scan.
///
/// Reference sets are small (a few thousand points city-wide), so a linear
/// scan per lookup is adequate at one lookup per vehicle per poll.
pub struct StaticSpatialIndex {
    stops: Vec<(f64, f64)>,
    intersections: Vec<(f64, f64)>,
    stop_radius_m: f64,
    intersection_radius_m: f64,
}

impl StaticSpatialIndex {
    pub fn new(
        stops: Vec<(f64, f64)>,
        intersections: Vec<(f64, f64)>,
        stop_radius_m: f64,
        intersection_radius_m: f64,
    ) -> Self {
        Self {
            stops,
            intersections,
            stop_radius_m,
            intersection_radius_m,
        }
    }

    /// An index with no reference data; every lookup answers all-false.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), 0.0, 0.0)
    }

    /// Loads reference points from `lat,lon` CSV files. Either path may be
    /// absent, leaving that reference set empty.
    pub fn from_csv_files(
        stops_path: Option<&Path>,
        intersections_path: Option<&Path>,
        stop_radius_m: f64,
        intersection_radius_m: f64,
    ) -> Result<Self> {
        let stops = match stops_path {
            Some(p) => load_points(p)?,
            None => Vec::new(),
        };
        let intersections = match intersections_path {
            Some(p) => load_points(p)?,
            None => Vec::new(),
        };
        Ok(Self::new(
            stops,
            intersections,
            stop_radius_m,
            intersection_radius_m,
        ))
    }

    fn within(&self, points: &[(f64, f64)], lat: f64, lon: f64, radius_m: f64) -> bool {
        points
            .iter()
            .any(|(p_lat, p_lon)| haversine_m(lat, lon, *p_lat, *p_lon) <= radius_m)
    }
}

impl SpatialIndex for StaticSpatialIndex {
    fn classify_point(&self, lat: f64, lon: f64) -> ProximityFlags {
        ProximityFlags {
            at_stop: self.within(&self.stops, lat, lon, self.stop_radius_m),
            near_intersection: self.within(
                &self.intersections,
                lat,
                lon,
                self.intersection_radius_m,
            ),
        }
    }
}

fn load_points(path: &Path) -> Result<Vec<(f64, f64)>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut points = Vec::new();
    for result in rdr.deserialize() {
        let p: RefPoint = result?;
        points.push((p.lat, p.lon));
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_index_answers_all_false() {
        let idx = StaticSpatialIndex::empty();
        assert_eq!(idx.classify_point(52.23, 21.01), ProximityFlags::default());
    }

    #[test]
    fn test_within_stop_radius() {
        let idx = StaticSpatialIndex::new(vec![(52.2300, 21.0100)], vec![], 50.0, 50.0);
        // ~22 m north of the platform.
        let flags = idx.classify_point(52.2302, 21.0100);
        assert!(flags.at_stop);
        assert!(!flags.near_intersection);
    }

    #[test]
    fn test_outside_stop_radius() {
        let idx = StaticSpatialIndex::new(vec![(52.2300, 21.0100)], vec![], 50.0, 50.0);
        // ~111 m north of the platform.
        let flags = idx.classify_point(52.2310, 21.0100);
        assert!(!flags.at_stop);
    }

    #[test]
    fn test_intersection_lookup_independent_of_stops() {
        let idx = StaticSpatialIndex::new(
            vec![(52.2300, 21.0100)],
            vec![(52.2400, 21.0200)],
            50.0,
            50.0,
        );
        let flags = idx.classify_point(52.2400, 21.0200);
        assert!(!flags.at_stop);
        assert!(flags.near_intersection);
    }

    #[test]
    fn test_load_points_from_csv() {
        let path = std::env::temp_dir().join("tram_delay_tracker_test_stops.csv");
        std::fs::write(&path, "lat,lon\n52.2300,21.0100\n52.2400,21.0200\n").unwrap();

        let points = load_points(&path).unwrap();
        assert_eq!(points, vec![(52.23, 21.01), (52.24, 21.02)]);

        std::fs::remove_file(&path).unwrap();
    }
}
