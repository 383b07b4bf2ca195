// Statistics: reservoir sampling, histograms, HLL distinct counts,
// correlations, and the immutable snapshot lifecycle.

pub mod collector;
pub mod histogram;
pub mod hll;
pub mod sample;

pub use collector::{
    ColumnStats, IndexStats, StatsCollector, StatsSnapshot, DEFAULT_SAMPLE_SIZE,
};
pub use histogram::{numeric_rank, Bucket, Histogram, DEFAULT_BUCKETS};
pub use hll::HyperLogLog;
pub use sample::Reservoir;
