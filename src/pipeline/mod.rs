pub mod latest;
pub mod stats;

pub use latest::LatestFrame;
pub use stats::{AcquisitionStats, StatsSnapshot};
