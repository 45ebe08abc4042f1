// Core primitives shared by every workflow built on this crate

pub mod barrier;
pub mod config;
pub mod errors;
pub mod limits;
pub mod slot;

// Re-export commonly used types
pub use barrier::{Arrival, JoinBarrier, Release};
pub use config::{Dispatch, FlowConfig};
pub use errors::{FlowError, Result};
pub use limits::{PoolLimits, PoolTracker, PoolUsageStats};
pub use slot::ResultSlot;
