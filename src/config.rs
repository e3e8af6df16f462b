//! Runtime configuration for the tracking and aggregation pipeline.
//!
//! Every business threshold is tunable; the defaults mirror production
//! operation of the tram network.

/// Tunables for the dispatcher, vehicle workers, and aggregator.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Feed poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Speeds below this (km/h) count as stopped.
    pub speed_threshold_kmh: f64,
    /// Highest numeric identifier accepted as a tram line.
    pub max_tram_line: u32,
    /// Radius (m) within which a position counts as at a platform.
    pub stop_proximity_m: f64,
    /// Radius (m) within which a position counts as near a signal-controlled
    /// crossing.
    pub intersection_proximity_m: f64,
    /// Longest dwell (s) still considered normal boarding at a platform.
    pub normal_dwell_max_s: i64,
    /// Shortest stop (s) away from a platform that counts as a delay.
    pub delay_min_duration_s: i64,
    /// Maximum distance (m) between two stops for the double-stop merge.
    pub merge_distance_m: f64,
    /// Grace window (s) after resumption during which a re-stop can merge.
    pub merge_grace_period_s: i64,
    /// Stops strictly longer than this (s) may be flagged multi-cycle.
    pub multi_cycle_threshold_s: i64,
    /// Workers with no positions for this long (ms) are evicted.
    pub worker_idle_timeout_ms: u64,
    /// Bounded per-worker mailbox capacity.
    pub mailbox_capacity: usize,
    /// Recent positions retained per vehicle.
    pub history_cap: usize,
    /// Aggregator wake interval in milliseconds.
    pub aggregate_interval_ms: u64,
    /// The aggregator never touches hours newer than now minus this margin (s).
    pub aggregate_safety_margin_s: i64,
    /// With no checkpoint, catch-up starts this many hours back.
    pub catch_up_lookback_hours: i64,
    /// Decimal places coordinates are rounded to when clustering rollups.
    pub coord_precision: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            poll_interval_ms: 10_000,
            speed_threshold_kmh: 3.0,
            max_tram_line: 99,
            stop_proximity_m: 50.0,
            intersection_proximity_m: 50.0,
            normal_dwell_max_s: 180,
            delay_min_duration_s: 30,
            merge_distance_m: 60.0,
            merge_grace_period_s: 45,
            multi_cycle_threshold_s: 120,
            worker_idle_timeout_ms: 300_000,
            mailbox_capacity: 32,
            history_cap: 10,
            aggregate_interval_ms: 300_000,
            aggregate_safety_margin_s: 300,
            catch_up_lookback_hours: 24,
            coord_precision: 4,
        }
    }
}

impl TrackerConfig {
    /// Persistence threshold (s) for a stop with the given platform flag.
    pub fn persist_threshold_s(&self, at_stop: bool) -> i64 {
        if at_stop {
            self.normal_dwell_max_s
        } else {
            self.delay_min_duration_s
        }
    }
}
