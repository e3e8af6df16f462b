//! Per-vehicle delay-detection state machine.
//!
//! Pure logic, no I/O: the surrounding worker feeds in positions with a
//! computed speed and proximity flags, and executes the returned effects
//! against the event store. Phases:
//!
//! - `Idle` — vehicle moving (or unseen), no candidate.
//! - `Stopped` — an open candidate is accumulating stopped time.
//! - `Grace` — the vehicle resumed movement but the candidate is held for
//!   the merge window in case a nearby re-stop continues the same
//!   interruption.

use chrono::{DateTime, Utc};

use crate::config::TrackerConfig;
use crate::geo::haversine_m;
use crate::model::{Classification, NewDelayEvent, VehiclePosition};
use crate::spatial::ProximityFlags;
use crate::tracker::classify;

/// The in-progress stop candidate awaiting resolution.
#[derive(Debug, Clone)]
struct Candidate {
    started_at: DateTime<Utc>,
    last_observed: DateTime<Utc>,
    lat: f64,
    lon: f64,
    line: String,
    at_stop: bool,
    near_intersection: bool,
    /// Set once the candidate crosses the persistence threshold and an
    /// unresolved event exists in the store.
    event_id: Option<u64>,
}

#[derive(Debug, Clone)]
enum Phase {
    Idle,
    Stopped(Candidate),
    Grace {
        candidate: Candidate,
        resumed_at: DateTime<Utc>,
    },
}

/// Terminal outcome for one candidate.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub started_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub classification: Classification,
    pub lat: f64,
    pub lon: f64,
    pub line: String,
    pub at_stop: bool,
    pub near_intersection: bool,
    /// The already-persisted event to close, when the candidate crossed the
    /// threshold while still open.
    pub event_id: Option<u64>,
}

/// Side effects for the worker to execute, in order.
#[derive(Debug, Clone)]
pub enum Effect {
    /// The candidate crossed the persistence threshold: create an unresolved
    /// event and hand its id back via [`DelayDetector::attach_event`].
    OpenEvent(NewDelayEvent),
    /// Close out a candidate; persistence is gated on the classification.
    Resolve(Resolution),
    /// Arm the merge grace timer.
    ArmGraceTimer,
    /// Disarm the merge grace timer.
    DisarmGraceTimer,
}

pub struct DelayDetector {
    vehicle_id: String,
    cfg: TrackerConfig,
    phase: Phase,
}

impl DelayDetector {
    pub fn new(vehicle_id: impl Into<String>, cfg: TrackerConfig) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            cfg,
            phase: Phase::Idle,
        }
    }

    /// Records the store id of the event opened for the current candidate.
    pub fn attach_event(&mut self, event_id: u64) {
        match &mut self.phase {
            Phase::Stopped(c) | Phase::Grace { candidate: c, .. } => {
                c.event_id = Some(event_id);
            }
            Phase::Idle => {}
        }
    }

    /// Feeds one position. `speed_kmh` is `None` when speed is undefined
    /// (fewer than two history entries or equal timestamps): no stop
    /// decision is made that tick.
    pub fn on_position(
        &mut self,
        pos: &VehiclePosition,
        speed_kmh: Option<f64>,
        flags: ProximityFlags,
    ) -> Vec<Effect> {
        let Some(speed) = speed_kmh else {
            return Vec::new();
        };

        if speed < self.cfg.speed_threshold_kmh {
            self.on_stopped(pos, flags)
        } else {
            self.on_moving(pos)
        }
    }

    /// The grace timer fired without a qualifying re-stop: the held
    /// candidate resolves at the moment the vehicle first resumed movement.
    pub fn on_grace_expired(&mut self) -> Vec<Effect> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Grace {
                candidate,
                resumed_at,
            } => vec![Effect::Resolve(self.resolution(candidate, resumed_at))],
            other => {
                // Spurious wakeup; nothing was held.
                self.phase = other;
                Vec::new()
            }
        }
    }

    /// Eviction or shutdown: any in-flight candidate resolves now, using the
    /// last evidence we have of the vehicle.
    pub fn on_evict(&mut self) -> Vec<Effect> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => Vec::new(),
            Phase::Stopped(candidate) => {
                let resolved_at = candidate.last_observed;
                vec![Effect::Resolve(self.resolution(candidate, resolved_at))]
            }
            Phase::Grace {
                candidate,
                resumed_at,
            } => vec![
                Effect::DisarmGraceTimer,
                Effect::Resolve(self.resolution(candidate, resumed_at)),
            ],
        }
    }

    fn on_stopped(&mut self, pos: &VehiclePosition, flags: ProximityFlags) -> Vec<Effect> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                self.phase = Phase::Stopped(Candidate {
                    started_at: pos.observed_at,
                    last_observed: pos.observed_at,
                    lat: pos.lat,
                    lon: pos.lon,
                    line: pos.line.clone(),
                    at_stop: flags.at_stop,
                    near_intersection: flags.near_intersection,
                    event_id: None,
                });
                Vec::new()
            }
            Phase::Stopped(mut candidate) => {
                candidate.last_observed = pos.observed_at;
                let effects = self.threshold_effects(&candidate, pos.observed_at);
                self.phase = Phase::Stopped(candidate);
                effects
            }
            Phase::Grace {
                mut candidate,
                resumed_at,
            } => {
                let gap_s = (pos.observed_at - resumed_at).num_seconds();
                let dist_m = haversine_m(candidate.lat, candidate.lon, pos.lat, pos.lon);

                if gap_s <= self.cfg.merge_grace_period_s && dist_m <= self.cfg.merge_distance_m {
                    // Same interruption: fold the re-stop into the held
                    // candidate, keeping its original start.
                    candidate.last_observed = pos.observed_at;
                    let mut effects = vec![Effect::DisarmGraceTimer];
                    effects.extend(self.threshold_effects(&candidate, pos.observed_at));
                    self.phase = Phase::Stopped(candidate);
                    effects
                } else {
                    // Independent stop: close the held candidate at the
                    // resumption time and start fresh here.
                    let resolution = self.resolution(candidate, resumed_at);
                    self.phase = Phase::Stopped(Candidate {
                        started_at: pos.observed_at,
                        last_observed: pos.observed_at,
                        lat: pos.lat,
                        lon: pos.lon,
                        line: pos.line.clone(),
                        at_stop: flags.at_stop,
                        near_intersection: flags.near_intersection,
                        event_id: None,
                    });
                    vec![Effect::DisarmGraceTimer, Effect::Resolve(resolution)]
                }
            }
        }
    }

    fn on_moving(&mut self, pos: &VehiclePosition) -> Vec<Effect> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => Vec::new(),
            Phase::Stopped(candidate) => {
                self.phase = Phase::Grace {
                    candidate,
                    resumed_at: pos.observed_at,
                };
                vec![Effect::ArmGraceTimer]
            }
            Phase::Grace {
                candidate,
                resumed_at,
            } => {
                if (pos.observed_at - resumed_at).num_seconds() > self.cfg.merge_grace_period_s {
                    // Still moving and the window has passed in feed time;
                    // no need to wait for the wall-clock timer.
                    vec![
                        Effect::DisarmGraceTimer,
                        Effect::Resolve(self.resolution(candidate, resumed_at)),
                    ]
                } else {
                    self.phase = Phase::Grace {
                        candidate,
                        resumed_at,
                    };
                    Vec::new()
                }
            }
        }
    }

    /// An [`Effect::OpenEvent`] once the stopped time crosses the
    /// persistence threshold for the candidate's platform flag.
    fn threshold_effects(&self, candidate: &Candidate, now: DateTime<Utc>) -> Vec<Effect> {
        if candidate.event_id.is_some() {
            return Vec::new();
        }
        let elapsed = (now - candidate.started_at).num_seconds();
        if elapsed < self.cfg.persist_threshold_s(candidate.at_stop) {
            return Vec::new();
        }

        vec![Effect::OpenEvent(NewDelayEvent {
            vehicle_id: self.vehicle_id.clone(),
            line: candidate.line.clone(),
            lat: candidate.lat,
            lon: candidate.lon,
            started_at: candidate.started_at,
            // Once past the threshold the terminal class is fixed by the
            // platform flag; duration can only grow from here.
            classification: if candidate.at_stop {
                Classification::Blockage
            } else {
                Classification::Delay
            },
            at_stop: candidate.at_stop,
            near_intersection: candidate.near_intersection,
        })]
    }

    fn resolution(&self, candidate: Candidate, resolved_at: DateTime<Utc>) -> Resolution {
        let duration = (resolved_at - candidate.started_at).num_seconds();
        Resolution {
            started_at: candidate.started_at,
            resolved_at,
            duration_seconds: duration,
            classification: classify::classify_with(
                duration,
                candidate.at_stop,
                self.cfg.normal_dwell_max_s,
                self.cfg.delay_min_duration_s,
            ),
            lat: candidate.lat,
            lon: candidate.lon,
            line: candidate.line,
            at_stop: candidate.at_stop,
            near_intersection: candidate.near_intersection,
            event_id: candidate.event_id,
        }
    }
}
