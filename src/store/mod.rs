pub mod event;
pub mod rollup;

pub use event::{EventStore, EventStoreError, MemoryEventStore};
pub use rollup::{
    DailyLineStat, HourlyIntersectionStat, HourlyPattern, LineHourSlice, MemoryRollupStore,
    PatternSlice, RollupStore, RollupStoreError,
};
