//! Hourly aggregation engine.
//!
//! Converts raw delay events into pre-computed rollups, one hour bucket at a
//! time, with catch-up from a persisted checkpoint. Every rollup write is a
//! value-upsert keyed by a natural composite key, so re-running an hour with
//! the same events stores identical values; the checkpoint only advances
//! after a successful pass, which makes a crashed run safe to retry
//! wholesale.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::TrackerConfig;
use crate::aggregate::cost::CostModel;
use crate::store::rollup::{
    HourlyIntersectionStat, LineHourSlice, PatternSlice, RollupStore,
};
use crate::store::EventStore;

/// Truncates a timestamp to its hour bucket.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive()
        .and_hms_opt(ts.hour(), 0, 0)
        .expect("hour within range")
        .and_utc()
}

fn round_coord(v: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (v * factor).round() / factor
}

/// What one aggregation pass observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateSummary {
    pub event_count: usize,
    pub distinct_lines: usize,
    pub distinct_clusters: usize,
}

#[derive(Default)]
struct ClusterAccum {
    event_count: u64,
    total_duration_s: i64,
    multi_cycle_count: u64,
}

pub struct HourlyAggregator {
    cfg: Arc<TrackerConfig>,
    events: Arc<dyn EventStore>,
    rollups: Arc<dyn RollupStore>,
    cost: Arc<dyn CostModel>,
}

impl HourlyAggregator {
    pub fn new(
        cfg: Arc<TrackerConfig>,
        events: Arc<dyn EventStore>,
        rollups: Arc<dyn RollupStore>,
        cost: Arc<dyn CostModel>,
    ) -> Self {
        Self {
            cfg,
            events,
            rollups,
            cost,
        }
    }

    /// Aggregates one hour bucket into the three rollup families.
    #[tracing::instrument(skip(self), fields(hour = %hour))]
    pub async fn aggregate(&self, hour: DateTime<Utc>) -> Result<AggregateSummary> {
        let from = hour_bucket(hour);
        let to = from + Duration::hours(1);
        let date = from.date_naive();
        let hour_of_day = from.hour();
        let weekday = from.weekday().num_days_from_monday();

        let all = self.events.query_range(from, to).await?;
        // Events still open when their start hour comes up for aggregation
        // have no duration yet; the safety margin makes these rare and the
        // dashboards' real-time path covers them until then.
        let events: Vec<_> = all.iter().filter(|e| e.is_resolved()).collect();
        let open = all.len() - events.len();
        if open > 0 {
            debug!(open, "Unresolved events excluded from hour");
        }

        let mut by_line: BTreeMap<&str, LineHourSlice> = BTreeMap::new();
        let mut clusters: BTreeMap<(i64, i64), ClusterAccum> = BTreeMap::new();
        let mut pattern = PatternSlice::default();

        for event in &events {
            let duration = event.duration_seconds.unwrap_or(0);

            let line = by_line.entry(event.line.as_str()).or_default();
            line.event_count += 1;
            line.total_duration_s += duration;

            let lat = round_coord(event.lat, self.cfg.coord_precision);
            let lon = round_coord(event.lon, self.cfg.coord_precision);
            let cluster = clusters
                .entry(((lat * 1e6).round() as i64, (lon * 1e6).round() as i64))
                .or_default();
            cluster.event_count += 1;
            cluster.total_duration_s += duration;
            if event.multi_cycle {
                cluster.multi_cycle_count += 1;
            }

            pattern.event_count += 1;
            pattern.total_duration_s += duration;
        }

        let summary = AggregateSummary {
            event_count: events.len(),
            distinct_lines: by_line.len(),
            distinct_clusters: clusters.len(),
        };

        for (line, slice) in by_line {
            self.rollups
                .upsert_line_hour(date, line, hour_of_day, slice)
                .await?;
        }

        for ((lat_key, lon_key), accum) in clusters {
            let stat = HourlyIntersectionStat {
                date,
                hour: hour_of_day,
                lat: lat_key as f64 / 1e6,
                lon: lon_key as f64 / 1e6,
                event_count: accum.event_count,
                total_duration_s: accum.total_duration_s,
                multi_cycle_count: accum.multi_cycle_count,
                estimated_cost: self
                    .cost
                    .delay_cost(accum.event_count, accum.total_duration_s),
            };
            self.rollups.upsert_intersection(stat).await?;
        }

        if !events.is_empty() {
            self.rollups
                .upsert_pattern(weekday, hour_of_day, date, pattern)
                .await?;
        }

        Ok(summary)
    }

    /// Aggregates every hour between the checkpoint and `now` minus the
    /// safety margin, advancing the checkpoint after each successful pass.
    /// Returns the number of hours processed.
    #[tracing::instrument(skip(self), fields(now = %now))]
    pub async fn catch_up(&self, now: DateTime<Utc>) -> Result<u32> {
        let cutoff = now - Duration::seconds(self.cfg.aggregate_safety_margin_s);

        let mut hour = match self.rollups.checkpoint().await? {
            Some(checkpoint) => checkpoint + Duration::hours(1),
            None => hour_bucket(cutoff - Duration::hours(self.cfg.catch_up_lookback_hours)),
        };

        let mut processed = 0u32;
        // Only fully elapsed hours: the still-accumulating current hour is
        // never touched.
        while hour + Duration::hours(1) <= cutoff {
            let summary = self.aggregate(hour).await?;
            self.rollups.advance_checkpoint(hour).await?;
            info!(
                hour = %hour,
                events = summary.event_count,
                lines = summary.distinct_lines,
                clusters = summary.distinct_clusters,
                "Hour aggregated"
            );
            processed += 1;
            hour += Duration::hours(1);
        }

        Ok(processed)
    }

    /// Offline path: aggregates every hour bucket in `[from, to]` without
    /// consulting the checkpoint, e.g. over a loaded CSV event log.
    pub async fn aggregate_span(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, AggregateSummary)>> {
        let mut summaries = Vec::new();
        let mut hour = hour_bucket(from);
        let last = hour_bucket(to);
        while hour <= last {
            let summary = self.aggregate(hour).await?;
            summaries.push((hour, summary));
            hour += Duration::hours(1);
        }
        Ok(summaries)
    }

    /// Periodic catch-up loop. One task runs this, so no two passes over
    /// the same hour can overlap.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
            self.cfg.aggregate_interval_ms,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.catch_up(Utc::now()).await {
                Ok(0) => debug!("Catch-up found no eligible hours"),
                Ok(hours) => info!(hours, "Catch-up pass complete"),
                // The checkpoint did not advance past the failed hour, so
                // the next pass retries it wholesale.
                Err(e) => error!(error = %e, "Aggregation pass failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::cost::DefaultCostModel;
    use crate::model::{Classification, DelayEvent};
    use crate::store::{MemoryEventStore, MemoryRollupStore};
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, m, 0).unwrap()
    }

    fn event(
        id: u64,
        line: &str,
        lat: f64,
        lon: f64,
        started_at: DateTime<Utc>,
        duration: i64,
        multi_cycle: bool,
    ) -> DelayEvent {
        DelayEvent {
            id,
            vehicle_id: format!("{}", 1000 + id),
            line: line.to_string(),
            lat,
            lon,
            started_at,
            resolved_at: Some(started_at + Duration::seconds(duration)),
            duration_seconds: Some(duration),
            classification: Classification::Delay,
            at_stop: false,
            near_intersection: true,
            multi_cycle,
        }
    }

    fn aggregator(
        events: Vec<DelayEvent>,
    ) -> (HourlyAggregator, Arc<MemoryRollupStore>) {
        let rollups = Arc::new(MemoryRollupStore::new());
        let aggregator = HourlyAggregator::new(
            Arc::new(TrackerConfig::default()),
            Arc::new(MemoryEventStore::with_events(events)),
            rollups.clone(),
            Arc::new(DefaultCostModel::default()),
        );
        (aggregator, rollups)
    }

    #[test]
    fn test_hour_bucket_truncates() {
        assert_eq!(hour_bucket(t(8, 59)), t(8, 0));
        assert_eq!(hour_bucket(t(8, 0)), t(8, 0));
    }

    #[tokio::test]
    async fn test_aggregate_groups_by_line_and_cluster() {
        let (aggregator, rollups) = aggregator(vec![
            event(1, "17", 52.23001, 21.01001, t(8, 5), 120, false),
            event(2, "17", 52.23004, 21.01003, t(8, 20), 180, true),
            event(3, "4", 52.24000, 21.02000, t(8, 40), 60, false),
            // Next hour; out of this bucket.
            event(4, "4", 52.24000, 21.02000, t(9, 10), 60, false),
        ]);

        let summary = aggregator.aggregate(t(8, 0)).await.unwrap();
        assert_eq!(
            summary,
            AggregateSummary {
                event_count: 3,
                distinct_lines: 2,
                // Events 1 and 2 round to the same 4-decimal cell.
                distinct_clusters: 2,
            }
        );

        let date = t(8, 0).date_naive();
        let line17 = rollups.line_stat(date, "17").await.unwrap().unwrap();
        assert_eq!(line17.event_count, 2);
        assert_eq!(line17.total_duration_s, 300);
        assert_eq!(line17.by_hour[&8].event_count, 2);

        let cluster = rollups
            .intersection_stat(date, 8, 52.2300, 21.0100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.event_count, 2);
        assert_eq!(cluster.multi_cycle_count, 1);
        assert!(cluster.estimated_cost > 0.0);

        // 2025-06-02 is a Monday.
        let pattern = rollups.pattern(0, 8).await.unwrap().unwrap();
        assert_eq!(pattern.event_count, 3);
    }

    #[tokio::test]
    async fn test_aggregate_twice_is_idempotent() {
        let (aggregator, rollups) = aggregator(vec![
            event(1, "17", 52.23001, 21.01001, t(8, 5), 120, false),
            event(2, "4", 52.24000, 21.02000, t(8, 40), 60, true),
        ]);

        let first = aggregator.aggregate(t(8, 0)).await.unwrap();
        let date = t(8, 0).date_naive();
        let line_first = rollups.line_stat(date, "17").await.unwrap().unwrap();
        let pattern_first = rollups.pattern(0, 8).await.unwrap().unwrap();

        let second = aggregator.aggregate(t(8, 0)).await.unwrap();
        let line_second = rollups.line_stat(date, "17").await.unwrap().unwrap();
        let pattern_second = rollups.pattern(0, 8).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(line_first.event_count, line_second.event_count);
        assert_eq!(line_first.total_duration_s, line_second.total_duration_s);
        assert_eq!(pattern_first.event_count, pattern_second.event_count);
        assert_eq!(
            pattern_first.total_duration_s,
            pattern_second.total_duration_s
        );
    }

    #[tokio::test]
    async fn test_unresolved_events_are_excluded() {
        let mut open = event(1, "17", 52.23, 21.01, t(8, 5), 0, false);
        open.resolved_at = None;
        open.duration_seconds = None;

        let (aggregator, _) = aggregator(vec![
            open,
            event(2, "17", 52.23, 21.01, t(8, 20), 90, false),
        ]);

        let summary = aggregator.aggregate(t(8, 0)).await.unwrap();
        assert_eq!(summary.event_count, 1);
    }

    #[tokio::test]
    async fn test_catch_up_processes_missed_hours_and_advances_checkpoint() {
        let (aggregator, rollups) = aggregator(vec![
            event(1, "17", 52.23, 21.01, t(8, 5), 120, false),
            event(2, "17", 52.23, 21.01, t(10, 5), 60, false),
        ]);
        rollups.advance_checkpoint(t(7, 0)).await.unwrap();

        // 12:30 with a 300 s margin: hours 8..=11 are fully elapsed.
        let processed = aggregator.catch_up(t(12, 30)).await.unwrap();
        assert_eq!(processed, 4);
        assert_eq!(rollups.checkpoint().await.unwrap(), Some(t(11, 0)));

        // A second pass has nothing new.
        assert_eq!(aggregator.catch_up(t(12, 30)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_catch_up_never_touches_current_hour() {
        let (aggregator, rollups) = aggregator(vec![event(
            1,
            "17",
            52.23,
            21.01,
            t(12, 1),
            60,
            false,
        )]);
        rollups.advance_checkpoint(t(10, 0)).await.unwrap();

        // Only hour 11 is eligible at 12:30; hour 12 is still accumulating.
        let processed = aggregator.catch_up(t(12, 30)).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(rollups.checkpoint().await.unwrap(), Some(t(11, 0)));
        assert!(
            rollups
                .line_stat(t(12, 0).date_naive(), "17")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_catch_up_without_checkpoint_uses_lookback() {
        let (aggregator, rollups) = aggregator(vec![]);

        let processed = aggregator.catch_up(t(12, 30)).await.unwrap();
        // 24 hours of lookback, each fully elapsed before the margin.
        assert_eq!(processed, 24);
        assert_eq!(rollups.checkpoint().await.unwrap(), Some(t(11, 0)));
    }

    #[tokio::test]
    async fn test_aggregate_span_covers_inclusive_range() {
        let (aggregator, _) = aggregator(vec![
            event(1, "17", 52.23, 21.01, t(8, 5), 120, false),
            event(2, "4", 52.24, 21.02, t(10, 45), 60, false),
        ]);

        let summaries = aggregator.aggregate_span(t(8, 15), t(10, 50)).await.unwrap();
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[0].1.event_count, 1);
        assert_eq!(summaries[1].1.event_count, 0);
        assert_eq!(summaries[2].1.event_count, 1);
    }
}
