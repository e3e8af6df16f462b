//! Polls the fleet feed and routes positions to per-vehicle workers.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::fetch::FeedSource;
use crate::model::VehiclePosition;
use crate::parser::{RawPosition, is_tram_line};
use crate::spatial::SpatialIndex;
use crate::store::EventStore;
use crate::tracker::registry::WorkerRegistry;
use crate::tracker::worker::{VehicleWorker, WorkerMsg};

pub struct Dispatcher<F: FeedSource> {
    cfg: Arc<TrackerConfig>,
    feed: F,
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn EventStore>,
    spatial: Arc<dyn SpatialIndex>,
}

impl<F: FeedSource> Dispatcher<F> {
    pub fn new(
        cfg: Arc<TrackerConfig>,
        feed: F,
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn EventStore>,
        spatial: Arc<dyn SpatialIndex>,
    ) -> Self {
        Self {
            cfg,
            feed,
            registry,
            store,
            spatial,
        }
    }

    /// Polls the feed on the configured interval until the task is dropped.
    pub async fn run(&self) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.cfg.poll_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.cycle().await;
        }
    }

    /// One poll cycle: fetch, validate, route, then sweep idle workers.
    ///
    /// A fetch failure is logged and retried on the next interval; it never
    /// terminates the dispatcher.
    #[tracing::instrument(skip(self))]
    pub async fn cycle(&self) {
        match self.feed.snapshot().await {
            Ok(records) => self.route(records).await,
            Err(e) => error!(error = %e, "Feed fetch failed; retrying next interval"),
        }

        self.sweep_idle().await;

        let workers = self.registry.count();
        match self.store.unresolved_count().await {
            Ok(open_delays) => info!(workers, open_delays, "Cycle complete"),
            Err(e) => warn!(workers, error = %e, "Cycle complete; open-delay gauge unavailable"),
        }
    }

    async fn route(&self, records: Vec<RawPosition>) {
        let total = records.len();
        let mut malformed = 0usize;
        let mut latest: HashMap<String, VehiclePosition> = HashMap::new();

        for raw in records {
            if !is_tram_line(&raw.line, self.cfg.max_tram_line) {
                continue;
            }
            let vehicle_id = raw.vehicle_id.clone();
            match raw.into_position() {
                Some(pos) => {
                    // One position per vehicle per cycle: keep the newest.
                    match latest.entry(pos.vehicle_id.clone()) {
                        std::collections::hash_map::Entry::Occupied(mut e) => {
                            if pos.observed_at > e.get().observed_at {
                                e.insert(pos);
                            }
                        }
                        std::collections::hash_map::Entry::Vacant(e) => {
                            e.insert(pos);
                        }
                    }
                }
                None => {
                    malformed += 1;
                    warn!(vehicle_id = %vehicle_id, "Malformed position record skipped");
                }
            }
        }

        debug!(
            total,
            routed = latest.len(),
            malformed,
            "Snapshot validated"
        );

        for (vehicle_id, pos) in latest {
            self.deliver(&vehicle_id, pos).await;
        }
    }

    async fn deliver(&self, vehicle_id: &str, pos: VehiclePosition) {
        let tx = match self.registry.lookup(vehicle_id) {
            Some(tx) => tx,
            None => {
                debug!(vehicle_id = %vehicle_id, line = %pos.line, "First sight; starting worker");
                let tx = VehicleWorker::spawn(
                    vehicle_id.to_string(),
                    self.cfg.clone(),
                    self.store.clone(),
                    self.spatial.clone(),
                );
                self.registry.register(vehicle_id, tx.clone());
                tx
            }
        };

        // try_send keeps one slow worker from stalling the whole cycle; a
        // dropped position is re-observed on the next poll anyway.
        match tx.try_send(WorkerMsg::Position(pos)) {
            Ok(()) => self.registry.touch(vehicle_id),
            Err(TrySendError::Full(_)) => {
                warn!(vehicle_id = %vehicle_id, "Worker mailbox full; position dropped");
            }
            Err(TrySendError::Closed(_)) => {
                // The worker died; drop the stale handle so the next poll
                // re-creates it with empty history.
                warn!(vehicle_id = %vehicle_id, "Worker gone; removing stale handle");
                self.registry.remove(vehicle_id);
            }
        }
    }

    async fn sweep_idle(&self) {
        let timeout = Duration::from_millis(self.cfg.worker_idle_timeout_ms);
        for (vehicle_id, tx) in self.registry.evict_idle(timeout) {
            info!(vehicle_id = %vehicle_id, "Evicting idle worker");
            let _ = tx.send(WorkerMsg::Shutdown).await;
        }
    }

    /// Clean shutdown: every worker resolves in-flight state before exiting.
    pub async fn shutdown(&self) {
        for (vehicle_id, tx) in self.registry.drain() {
            debug!(vehicle_id = %vehicle_id, "Shutting down worker");
            let _ = tx.send(WorkerMsg::Shutdown).await;
            // The receiver closes once the worker has finished its
            // resolve-then-destroy sequence.
            tx.closed().await;
        }
    }
}
