//! Stop classification rules.
//!
//! Thresholds live in [`TrackerConfig`](crate::config::TrackerConfig); these
//! functions take them as plain arguments so they stay pure and total.

use crate::model::Classification;

/// Classifies a finished stop from its duration and platform flag.
///
/// | at_stop | duration        | result       | persisted |
/// |---------|-----------------|--------------|-----------|
/// | yes     | < dwell max     | normal_dwell | no        |
/// | yes     | >= dwell max    | blockage     | yes       |
/// | no      | < delay min     | brief_stop   | no        |
/// | no      | >= delay min    | delay        | yes       |
pub fn classify_with(
    duration_s: i64,
    at_stop: bool,
    normal_dwell_max_s: i64,
    delay_min_duration_s: i64,
) -> Classification {
    if at_stop {
        if duration_s >= normal_dwell_max_s {
            Classification::Blockage
        } else {
            Classification::NormalDwell
        }
    } else if duration_s >= delay_min_duration_s {
        Classification::Delay
    } else {
        Classification::BriefStop
    }
}

/// [`classify_with`] at the default 180 s / 30 s thresholds.
pub fn classify(duration_s: i64, at_stop: bool) -> Classification {
    classify_with(duration_s, at_stop, 180, 30)
}

/// Whether a stop plausibly spanned more than one signal cycle.
///
/// True iff the stop ran strictly longer than `threshold_s` and was either
/// near a signal-controlled crossing or away from any platform. A long stop
/// purely at a platform with no intersection nearby is an operational issue,
/// not a signal-priority one, and is not flagged.
pub fn multi_cycle_with(
    duration_s: i64,
    at_stop: bool,
    near_intersection: bool,
    threshold_s: i64,
) -> bool {
    duration_s > threshold_s && (near_intersection || !at_stop)
}

/// [`multi_cycle_with`] at the default 120 s threshold.
pub fn multi_cycle(duration_s: i64, at_stop: bool, near_intersection: bool) -> bool {
    multi_cycle_with(duration_s, at_stop, near_intersection, 120)
}
