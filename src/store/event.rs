//! Durable store interface for delay events.
//!
//! The tracker consumes a narrow create/resolve/query surface; everything
//! else about the storage backend is a collaborator concern. The shipped
//! implementation keeps events in memory and can mirror resolved events into
//! a daily CSV log for the offline aggregation path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::model::{DelayEvent, NewDelayEvent};
use crate::tracker::classify;

#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The attributes failed a required-field or range constraint.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no event with id {0}")]
    NotFound(u64),

    /// Resolution is a one-shot transition; a second attempt is a caller bug.
    #[error("event {0} is already resolved")]
    AlreadyResolved(u64),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Narrow event-store surface consumed by the tracker and aggregator.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists a new unresolved event after validating its attributes.
    async fn create(&self, attrs: NewDelayEvent) -> Result<DelayEvent, EventStoreError>;

    /// The open event for a vehicle, if any. At most one exists at a time.
    async fn find_unresolved(
        &self,
        vehicle_id: &str,
    ) -> Result<Option<DelayEvent>, EventStoreError>;

    /// Closes an event, computing `duration_seconds` and `multi_cycle` from
    /// the stored attributes and `resolved_at`. One-shot per event.
    async fn resolve(
        &self,
        id: u64,
        resolved_at: DateTime<Utc>,
    ) -> Result<DelayEvent, EventStoreError>;

    /// All events whose `started_at` falls in `[from, to)`.
    async fn query_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DelayEvent>, EventStoreError>;

    /// Pull-based gauge: number of currently open events.
    async fn unresolved_count(&self) -> Result<usize, EventStoreError>;
}

fn validate(attrs: &NewDelayEvent) -> Result<(), EventStoreError> {
    if attrs.vehicle_id.trim().is_empty() {
        return Err(EventStoreError::Validation("vehicle_id is required".into()));
    }
    if attrs.line.trim().is_empty() {
        return Err(EventStoreError::Validation("line is required".into()));
    }
    if !(-90.0..=90.0).contains(&attrs.lat) {
        return Err(EventStoreError::Validation(format!(
            "lat {} out of range",
            attrs.lat
        )));
    }
    if !(-180.0..=180.0).contains(&attrs.lon) {
        return Err(EventStoreError::Validation(format!(
            "lon {} out of range",
            attrs.lon
        )));
    }
    if !attrs.classification.persists() {
        return Err(EventStoreError::Validation(format!(
            "classification {:?} is never persisted",
            attrs.classification
        )));
    }
    Ok(())
}

struct Inner {
    events: Vec<DelayEvent>,
    next_id: u64,
}

/// In-memory [`EventStore`] with an optional CSV mirror of resolved events.
pub struct MemoryEventStore {
    inner: Mutex<Inner>,
    csv_log_dir: Option<PathBuf>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: Vec::new(),
                next_id: 1,
            }),
            csv_log_dir: None,
        }
    }

    /// Mirrors every resolved event into `dir/events_date=YYYY-MM-DD.csv`.
    pub fn with_csv_log(mut self, dir: impl Into<PathBuf>) -> Self {
        self.csv_log_dir = Some(dir.into());
        self
    }

    /// Seeds the store with already-resolved events, e.g. loaded from a CSV
    /// log for offline aggregation.
    pub fn with_events(events: Vec<DelayEvent>) -> Self {
        let next_id = events.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        Self {
            inner: Mutex::new(Inner { events, next_id }),
            csv_log_dir: None,
        }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn create(&self, attrs: NewDelayEvent) -> Result<DelayEvent, EventStoreError> {
        validate(&attrs)?;

        let mut inner = self.inner.lock().expect("event store lock poisoned");
        let event = DelayEvent {
            id: inner.next_id,
            vehicle_id: attrs.vehicle_id,
            line: attrs.line,
            lat: attrs.lat,
            lon: attrs.lon,
            started_at: attrs.started_at,
            resolved_at: None,
            duration_seconds: None,
            classification: attrs.classification,
            at_stop: attrs.at_stop,
            near_intersection: attrs.near_intersection,
            multi_cycle: false,
        };
        inner.next_id += 1;
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn find_unresolved(
        &self,
        vehicle_id: &str,
    ) -> Result<Option<DelayEvent>, EventStoreError> {
        let inner = self.inner.lock().expect("event store lock poisoned");
        Ok(inner
            .events
            .iter()
            .find(|e| e.vehicle_id == vehicle_id && !e.is_resolved())
            .cloned())
    }

    async fn resolve(
        &self,
        id: u64,
        resolved_at: DateTime<Utc>,
    ) -> Result<DelayEvent, EventStoreError> {
        let resolved = {
            let mut inner = self.inner.lock().expect("event store lock poisoned");
            let event = inner
                .events
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or(EventStoreError::NotFound(id))?;

            if event.is_resolved() {
                return Err(EventStoreError::AlreadyResolved(id));
            }

            let duration = (resolved_at - event.started_at).num_seconds();
            event.resolved_at = Some(resolved_at);
            event.duration_seconds = Some(duration);
            event.multi_cycle =
                classify::multi_cycle(duration, event.at_stop, event.near_intersection);
            event.clone()
        };

        if let Some(dir) = &self.csv_log_dir {
            // The CSV mirror is observability, not the source of truth; a
            // write failure must not fail the resolution.
            if let Err(e) = crate::output::append_event(dir, &resolved) {
                warn!(error = %e, event_id = id, "Failed to append event to CSV log");
            }
        }

        Ok(resolved)
    }

    async fn query_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DelayEvent>, EventStoreError> {
        let inner = self.inner.lock().expect("event store lock poisoned");
        Ok(inner
            .events
            .iter()
            .filter(|e| e.started_at >= from && e.started_at < to)
            .cloned()
            .collect())
    }

    async fn unresolved_count(&self) -> Result<usize, EventStoreError> {
        let inner = self.inner.lock().expect("event store lock poisoned");
        Ok(inner.events.iter().filter(|e| !e.is_resolved()).count())
    }
}
