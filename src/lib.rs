// Core primitives: join barrier, result slot, configuration, errors
pub mod core;

// Task submission facility
pub mod executor;

// The underwriting workflow built from the primitives
pub mod underwriting;

// Re-exports for convenience
pub use self::core::errors::{FlowError, Result};
pub use self::core::{Arrival, Dispatch, FlowConfig, JoinBarrier, PoolLimits, Release, ResultSlot};
pub use executor::{ExecutionFacility, Work, WorkerPool};
pub use underwriting::{
    Coverage, Orchestrator, OrchestratorStats, Person, SimulatedServices, UnderwritingServices,
};
