//! Rollup store: pre-computed aggregates keyed by natural composite keys.
//!
//! Every write is a value-upsert, so re-aggregating an hour with the same
//! underlying events stores identical values. The shipped implementation
//! keeps rollups in memory and can persist them, plus the aggregation
//! checkpoint, as JSON files so catch-up survives restarts.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RollupStoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Per-hour contribution to a line's daily totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LineHourSlice {
    pub event_count: u64,
    pub total_duration_s: i64,
}

/// Daily totals for one line, keyed `(date, line)`, with an hour-of-day
/// breakdown. Totals are recomputed from the slices on every upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyLineStat {
    pub date: NaiveDate,
    pub line: String,
    pub event_count: u64,
    pub total_duration_s: i64,
    pub by_hour: BTreeMap<u32, LineHourSlice>,
}

impl DailyLineStat {
    fn new(date: NaiveDate, line: String) -> Self {
        Self {
            date,
            line,
            event_count: 0,
            total_duration_s: 0,
            by_hour: BTreeMap::new(),
        }
    }

    fn recompute_totals(&mut self) {
        self.event_count = self.by_hour.values().map(|s| s.event_count).sum();
        self.total_duration_s = self.by_hour.values().map(|s| s.total_duration_s).sum();
    }
}

/// Hourly totals for one rounded location, keyed `(date, hour, lat, lon)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyIntersectionStat {
    pub date: NaiveDate,
    pub hour: u32,
    /// Coordinates rounded to the clustering precision (~11 m at 4 places).
    pub lat: f64,
    pub lon: f64,
    pub event_count: u64,
    pub total_duration_s: i64,
    pub multi_cycle_count: u64,
    pub estimated_cost: f64,
}

/// One date's contribution to a weekday/hour pattern cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSlice {
    pub event_count: u64,
    pub total_duration_s: i64,
}

/// Cumulative day-of-week x hour-of-day pattern cell, keyed
/// `(weekday, hour)` with weekday 0 = Monday.
///
/// Contributions are stored per date and the cumulative totals recomputed on
/// upsert, which keeps re-aggregation of any single hour idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyPattern {
    pub weekday: u32,
    pub hour: u32,
    pub event_count: u64,
    pub total_duration_s: i64,
    pub by_date: BTreeMap<NaiveDate, PatternSlice>,
}

impl HourlyPattern {
    fn new(weekday: u32, hour: u32) -> Self {
        Self {
            weekday,
            hour,
            event_count: 0,
            total_duration_s: 0,
            by_date: BTreeMap::new(),
        }
    }

    fn recompute_totals(&mut self) {
        self.event_count = self.by_date.values().map(|s| s.event_count).sum();
        self.total_duration_s = self.by_date.values().map(|s| s.total_duration_s).sum();
    }
}

/// Narrow rollup surface consumed by the aggregator: idempotent upserts plus
/// the aggregation checkpoint, which only the aggregator advances.
#[async_trait]
pub trait RollupStore: Send + Sync {
    async fn upsert_intersection(
        &self,
        stat: HourlyIntersectionStat,
    ) -> Result<(), RollupStoreError>;

    async fn upsert_line_hour(
        &self,
        date: NaiveDate,
        line: &str,
        hour: u32,
        slice: LineHourSlice,
    ) -> Result<(), RollupStoreError>;

    async fn upsert_pattern(
        &self,
        weekday: u32,
        hour: u32,
        date: NaiveDate,
        slice: PatternSlice,
    ) -> Result<(), RollupStoreError>;

    /// The last fully aggregated hour, if any pass has completed.
    async fn checkpoint(&self) -> Result<Option<DateTime<Utc>>, RollupStoreError>;

    /// Records `hour` as fully aggregated. Called only after a successful pass.
    async fn advance_checkpoint(&self, hour: DateTime<Utc>) -> Result<(), RollupStoreError>;

    async fn intersection_stat(
        &self,
        date: NaiveDate,
        hour: u32,
        lat: f64,
        lon: f64,
    ) -> Result<Option<HourlyIntersectionStat>, RollupStoreError>;

    async fn line_stat(
        &self,
        date: NaiveDate,
        line: &str,
    ) -> Result<Option<DailyLineStat>, RollupStoreError>;

    async fn pattern(
        &self,
        weekday: u32,
        hour: u32,
    ) -> Result<Option<HourlyPattern>, RollupStoreError>;
}

// Rounded coordinates are compared through a fixed-point key so they can
// index a map without floating-point equality surprises.
fn coord_key(v: f64) -> i64 {
    (v * 1e6).round() as i64
}

type IntersectionKey = (NaiveDate, u32, i64, i64);

#[derive(Default)]
struct Inner {
    intersections: BTreeMap<IntersectionKey, HourlyIntersectionStat>,
    lines: BTreeMap<(NaiveDate, String), DailyLineStat>,
    patterns: BTreeMap<(u32, u32), HourlyPattern>,
    checkpoint: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    last_aggregated_hour: DateTime<Utc>,
}

/// In-memory [`RollupStore`] with optional JSON persistence.
pub struct MemoryRollupStore {
    inner: Mutex<Inner>,
    persist_dir: Option<PathBuf>,
}

impl MemoryRollupStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            persist_dir: None,
        }
    }

    /// Persists rollups and the checkpoint under `dir`, loading any state a
    /// previous run left there so daily records keep their earlier hours.
    pub fn with_persist_dir(dir: impl Into<PathBuf>) -> Result<Self, RollupStoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(backend)?;

        let mut inner = Inner::default();
        load_persisted(&dir, &mut inner)?;

        Ok(Self {
            inner: Mutex::new(inner),
            persist_dir: Some(dir),
        })
    }

    fn flush_intersections(&self, inner: &Inner, date: NaiveDate) -> Result<(), RollupStoreError> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let stats: Vec<&HourlyIntersectionStat> = inner
            .intersections
            .values()
            .filter(|s| s.date == date)
            .collect();
        let path = dir.join(format!("intersections_date={date}.json"));
        crate::output::write_json_file(&path, &stats).map_err(backend)
    }

    fn flush_lines(&self, inner: &Inner, date: NaiveDate) -> Result<(), RollupStoreError> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let stats: Vec<&DailyLineStat> =
            inner.lines.values().filter(|s| s.date == date).collect();
        let path = dir.join(format!("lines_date={date}.json"));
        crate::output::write_json_file(&path, &stats).map_err(backend)
    }

    fn flush_patterns(&self, inner: &Inner) -> Result<(), RollupStoreError> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let stats: Vec<&HourlyPattern> = inner.patterns.values().collect();
        crate::output::write_json_file(&dir.join("patterns.json"), &stats).map_err(backend)
    }

    fn flush_checkpoint(&self, hour: DateTime<Utc>) -> Result<(), RollupStoreError> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let file = CheckpointFile {
            last_aggregated_hour: hour,
        };
        crate::output::write_json_file(&dir.join("checkpoint.json"), &file).map_err(backend)
    }
}

impl Default for MemoryRollupStore {
    fn default() -> Self {
        Self::new()
    }
}

fn backend(e: impl std::fmt::Display) -> RollupStoreError {
    RollupStoreError::Backend(e.to_string())
}

fn load_persisted(dir: &Path, inner: &mut Inner) -> Result<(), RollupStoreError> {
    let checkpoint_path = dir.join("checkpoint.json");
    if checkpoint_path.exists() {
        let file: CheckpointFile =
            crate::output::read_json_file(&checkpoint_path).map_err(backend)?;
        inner.checkpoint = Some(file.last_aggregated_hour);
    }

    let patterns_path = dir.join("patterns.json");
    if patterns_path.exists() {
        let patterns: Vec<HourlyPattern> =
            crate::output::read_json_file(&patterns_path).map_err(backend)?;
        for p in patterns {
            inner.patterns.insert((p.weekday, p.hour), p);
        }
    }

    for entry in std::fs::read_dir(dir).map_err(backend)? {
        let entry = entry.map_err(backend)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if name.starts_with("intersections_date=") && name.ends_with(".json") {
            let stats: Vec<HourlyIntersectionStat> =
                crate::output::read_json_file(&entry.path()).map_err(backend)?;
            for s in stats {
                let key = (s.date, s.hour, coord_key(s.lat), coord_key(s.lon));
                inner.intersections.insert(key, s);
            }
        } else if name.starts_with("lines_date=") && name.ends_with(".json") {
            let stats: Vec<DailyLineStat> =
                crate::output::read_json_file(&entry.path()).map_err(backend)?;
            for s in stats {
                inner.lines.insert((s.date, s.line.clone()), s);
            }
        }
    }

    Ok(())
}

#[async_trait]
impl RollupStore for MemoryRollupStore {
    async fn upsert_intersection(
        &self,
        stat: HourlyIntersectionStat,
    ) -> Result<(), RollupStoreError> {
        let mut inner = self.inner.lock().expect("rollup store lock poisoned");
        let date = stat.date;
        let key = (stat.date, stat.hour, coord_key(stat.lat), coord_key(stat.lon));
        inner.intersections.insert(key, stat);
        self.flush_intersections(&inner, date)
    }

    async fn upsert_line_hour(
        &self,
        date: NaiveDate,
        line: &str,
        hour: u32,
        slice: LineHourSlice,
    ) -> Result<(), RollupStoreError> {
        let mut inner = self.inner.lock().expect("rollup store lock poisoned");
        let stat = inner
            .lines
            .entry((date, line.to_string()))
            .or_insert_with(|| DailyLineStat::new(date, line.to_string()));
        stat.by_hour.insert(hour, slice);
        stat.recompute_totals();
        self.flush_lines(&inner, date)
    }

    async fn upsert_pattern(
        &self,
        weekday: u32,
        hour: u32,
        date: NaiveDate,
        slice: PatternSlice,
    ) -> Result<(), RollupStoreError> {
        let mut inner = self.inner.lock().expect("rollup store lock poisoned");
        let pattern = inner
            .patterns
            .entry((weekday, hour))
            .or_insert_with(|| HourlyPattern::new(weekday, hour));
        pattern.by_date.insert(date, slice);
        pattern.recompute_totals();
        self.flush_patterns(&inner)
    }

    async fn checkpoint(&self) -> Result<Option<DateTime<Utc>>, RollupStoreError> {
        let inner = self.inner.lock().expect("rollup store lock poisoned");
        Ok(inner.checkpoint)
    }

    async fn advance_checkpoint(&self, hour: DateTime<Utc>) -> Result<(), RollupStoreError> {
        let mut inner = self.inner.lock().expect("rollup store lock poisoned");
        inner.checkpoint = Some(hour);
        self.flush_checkpoint(hour)
    }

    async fn intersection_stat(
        &self,
        date: NaiveDate,
        hour: u32,
        lat: f64,
        lon: f64,
    ) -> Result<Option<HourlyIntersectionStat>, RollupStoreError> {
        let inner = self.inner.lock().expect("rollup store lock poisoned");
        Ok(inner
            .intersections
            .get(&(date, hour, coord_key(lat), coord_key(lon)))
            .cloned())
    }

    async fn line_stat(
        &self,
        date: NaiveDate,
        line: &str,
    ) -> Result<Option<DailyLineStat>, RollupStoreError> {
        let inner = self.inner.lock().expect("rollup store lock poisoned");
        Ok(inner.lines.get(&(date, line.to_string())).cloned())
    }

    async fn pattern(
        &self,
        weekday: u32,
        hour: u32,
    ) -> Result<Option<HourlyPattern>, RollupStoreError> {
        let inner = self.inner.lock().expect("rollup store lock poisoned");
        Ok(inner.patterns.get(&(weekday, hour)).cloned())
    }
}
