pub mod cost;
pub mod hourly;

pub use cost::{CostModel, DefaultCostModel};
pub use hourly::{AggregateSummary, HourlyAggregator, hour_bucket};
