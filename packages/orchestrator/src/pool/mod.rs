pub mod manager;

pub use manager::{PoolManager, PoolMetrics, RunnerRequest};
