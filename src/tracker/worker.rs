//! One lightweight task per tracked vehicle.
//!
//! The worker is the sole consumer of its mailbox, so positions are
//! processed strictly in arrival order. It owns the vehicle's ephemeral
//! history, drives the delay detector, and executes the detector's effects
//! against the event store. The merge grace window is realized as a receive
//! deadline on the mailbox.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info, trace};

use crate::config::TrackerConfig;
use crate::geo;
use crate::model::{NewDelayEvent, VehiclePosition};
use crate::spatial::SpatialIndex;
use crate::store::EventStore;
use crate::tracker::detector::{DelayDetector, Effect, Resolution};

#[derive(Debug)]
pub enum WorkerMsg {
    Position(VehiclePosition),
    Shutdown,
}

pub struct VehicleWorker {
    vehicle_id: String,
    cfg: Arc<TrackerConfig>,
    store: Arc<dyn EventStore>,
    spatial: Arc<dyn SpatialIndex>,
    history: VecDeque<VehiclePosition>,
    detector: DelayDetector,
    grace_deadline: Option<Instant>,
    rx: mpsc::Receiver<WorkerMsg>,
}

impl VehicleWorker {
    /// Spawns the worker task and returns its mailbox sender.
    pub fn spawn(
        vehicle_id: String,
        cfg: Arc<TrackerConfig>,
        store: Arc<dyn EventStore>,
        spatial: Arc<dyn SpatialIndex>,
    ) -> mpsc::Sender<WorkerMsg> {
        let (tx, rx) = mpsc::channel(cfg.mailbox_capacity);

        let span = tracing::info_span!("vehicle_worker", vehicle_id = %vehicle_id);
        let worker = VehicleWorker {
            detector: DelayDetector::new(vehicle_id.clone(), cfg.as_ref().clone()),
            vehicle_id,
            cfg,
            store,
            spatial,
            history: VecDeque::new(),
            grace_deadline: None,
            rx,
        };
        tokio::spawn(worker.run().instrument(span));

        tx
    }

    async fn run(mut self) {
        loop {
            let msg = match self.grace_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        self.grace_deadline = None;
                        let effects = self.detector.on_grace_expired();
                        self.apply(effects).await;
                        continue;
                    }
                },
                None => self.rx.recv().await,
            };

            match msg {
                Some(WorkerMsg::Position(pos)) => self.handle_position(pos).await,
                Some(WorkerMsg::Shutdown) | None => break,
            }
        }

        // Eviction contract: resolve any in-flight candidate before the
        // ephemeral state is discarded.
        let effects = self.detector.on_evict();
        self.apply(effects).await;
        debug!("Worker stopped");
    }

    async fn handle_position(&mut self, pos: VehiclePosition) {
        if let Some(newest) = self.history.front() {
            if pos.observed_at <= newest.observed_at {
                trace!(observed_at = %pos.observed_at, "Stale or duplicate report; ignored");
                return;
            }
        }

        let speed = self
            .history
            .front()
            .and_then(|prev| geo::speed_kmh(&pos, prev));
        let flags = self.spatial.classify_point(pos.lat, pos.lon);

        self.history.push_front(pos.clone());
        self.history.truncate(self.cfg.history_cap);

        let effects = self.detector.on_position(&pos, speed, flags);
        self.apply(effects).await;
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ArmGraceTimer => {
                    self.grace_deadline = Some(
                        Instant::now()
                            + Duration::from_secs(self.cfg.merge_grace_period_s as u64),
                    );
                }
                Effect::DisarmGraceTimer => {
                    self.grace_deadline = None;
                }
                Effect::OpenEvent(attrs) => self.open_event(attrs).await,
                Effect::Resolve(resolution) => self.resolve(resolution).await,
            }
        }
    }

    /// The candidate crossed its persistence threshold: make it durable,
    /// adopting an orphaned unresolved event from a previous incarnation of
    /// this vehicle's worker if one exists.
    async fn open_event(&mut self, attrs: NewDelayEvent) {
        match self.store.find_unresolved(&self.vehicle_id).await {
            Ok(Some(orphan)) => {
                info!(event_id = orphan.id, "Adopted orphaned unresolved event");
                self.detector.attach_event(orphan.id);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "find_unresolved failed; creating a fresh event");
            }
        }

        match self.store.create(attrs).await {
            Ok(event) => {
                info!(
                    event_id = event.id,
                    classification = ?event.classification,
                    at_stop = event.at_stop,
                    "Delay event opened"
                );
                self.detector.attach_event(event.id);
            }
            Err(e) => error!(error = %e, "Failed to create delay event"),
        }
    }

    async fn resolve(&mut self, r: Resolution) {
        if let Some(id) = r.event_id {
            match self.store.resolve(id, r.resolved_at).await {
                Ok(event) => info!(
                    event_id = event.id,
                    duration_s = event.duration_seconds,
                    multi_cycle = event.multi_cycle,
                    "Delay event resolved"
                ),
                Err(e) => error!(error = %e, event_id = id, "Failed to resolve delay event"),
            }
        } else if r.classification.persists() {
            // The threshold was only crossed between observations (a gap in
            // the feed): create and close in one pass.
            let attrs = NewDelayEvent {
                vehicle_id: self.vehicle_id.clone(),
                line: r.line.clone(),
                lat: r.lat,
                lon: r.lon,
                started_at: r.started_at,
                classification: r.classification,
                at_stop: r.at_stop,
                near_intersection: r.near_intersection,
            };
            match self.store.create(attrs).await {
                Ok(event) => match self.store.resolve(event.id, r.resolved_at).await {
                    Ok(event) => info!(
                        event_id = event.id,
                        duration_s = event.duration_seconds,
                        "Delay event persisted at resolution"
                    ),
                    Err(e) => {
                        error!(error = %e, event_id = event.id, "Failed to resolve delay event")
                    }
                },
                Err(e) => error!(error = %e, "Failed to persist delay event"),
            }
        } else {
            debug!(
                classification = ?r.classification,
                duration_s = r.duration_seconds,
                "Stop below persistence threshold; discarded"
            );
        }
    }
}
