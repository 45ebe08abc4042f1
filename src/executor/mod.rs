//! Execution facility consumed by the orchestrator.
//!
//! The orchestrator never spawns on its own; every unit of work goes
//! through an [`ExecutionFacility`] handed to it at construction.

pub mod pool;

pub use pool::WorkerPool;

use crate::core::errors::Result;
use futures::future::BoxFuture;

/// A zero-argument unit of asynchronous work
pub type Work = BoxFuture<'static, ()>;

/// Accepts units of work and runs them asynchronously.
///
/// Implementations must run every accepted unit; a unit that cannot be
/// accepted is reported through the returned error, never dropped.
pub trait ExecutionFacility: Send + Sync {
    fn submit(&self, work: Work) -> Result<()>;
}
