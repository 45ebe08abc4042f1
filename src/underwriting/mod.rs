pub mod events;
pub mod invocation;
pub mod model;
pub mod orchestrator;
pub mod services;
pub mod simulated;

pub use events::{BufferingEventSink, EventSink, FlowEvent, FlowEventEnvelope, LoggingEventSink};
pub use invocation::{InvocationState, OrchestratorStats, Step};
pub use model::{Assets, Coverage, CreditScore, HealthHistory, HealthScore, Liabilities, Person};
pub use orchestrator::{Orchestrator, CREDIT_INPUTS_JOIN, SCORES_JOIN};
pub use services::UnderwritingServices;
pub use simulated::SimulatedServices;
