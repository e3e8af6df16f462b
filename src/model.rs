//! Core domain types shared between the tracker and the aggregation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A parsed, validated position report for one vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct VehiclePosition {
    pub vehicle_id: String,
    pub line: String,
    pub lat: f64,
    pub lon: f64,
    pub observed_at: DateTime<Utc>,
}

/// Terminal classification of a stop, decided at resolution time.
///
/// Only [`Delay`](Classification::Delay) and
/// [`Blockage`](Classification::Blockage) are ever persisted; the other two
/// are expected dwell noise and are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    NormalDwell,
    BriefStop,
    Delay,
    Blockage,
}

impl Classification {
    /// Whether events of this classification reach the event store.
    pub fn persists(self) -> bool {
        matches!(self, Classification::Delay | Classification::Blockage)
    }
}

/// A persisted abnormal-stop event, owned by the event store.
///
/// `duration_seconds` and `multi_cycle` are set exactly once, at resolution,
/// and the record is never updated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayEvent {
    pub id: u64,
    pub vehicle_id: String,
    pub line: String,
    pub lat: f64,
    pub lon: f64,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub classification: Classification,
    pub at_stop: bool,
    pub near_intersection: bool,
    pub multi_cycle: bool,
}

impl DelayEvent {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Attributes for creating an unresolved [`DelayEvent`].
#[derive(Debug, Clone)]
pub struct NewDelayEvent {
    pub vehicle_id: String,
    pub line: String,
    pub lat: f64,
    pub lon: f64,
    pub started_at: DateTime<Utc>,
    pub classification: Classification,
    pub at_stop: bool,
    pub near_intersection: bool,
}
