//! Economic cost collaborator.
//!
//! The formula itself is owned elsewhere; the aggregator only needs a pure
//! function from delay volume to an estimated cost, so it is modeled as a
//! trait with a simple default.

pub trait CostModel: Send + Sync {
    /// Estimated economic cost of `event_count` delays totalling
    /// `total_duration_s` stopped seconds.
    fn delay_cost(&self, event_count: u64, total_duration_s: i64) -> f64;
}

/// Riders-aboard times value-of-time estimate.
pub struct DefaultCostModel {
    pub riders_per_vehicle: f64,
    pub value_of_time_per_hour: f64,
}

impl Default for DefaultCostModel {
    fn default() -> Self {
        Self {
            riders_per_vehicle: 60.0,
            value_of_time_per_hour: 45.0,
        }
    }
}

impl CostModel for DefaultCostModel {
    fn delay_cost(&self, _event_count: u64, total_duration_s: i64) -> f64 {
        let delay_hours = total_duration_s as f64 / 3600.0;
        self.riders_per_vehicle * delay_hours * self.value_of_time_per_hour
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cost_scales_linearly_with_duration() {
        let model = DefaultCostModel::default();
        let one_hour = model.delay_cost(1, 3600);
        let two_hours = model.delay_cost(1, 7200);

        assert_eq!(one_hour, 60.0 * 45.0);
        assert_eq!(two_hours, 2.0 * one_hour);
    }

    #[test]
    fn test_zero_duration_costs_nothing() {
        let model = DefaultCostModel::default();
        assert_eq!(model.delay_cost(3, 0), 0.0);
    }
}
