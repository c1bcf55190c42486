//! The fulfillment pipeline: a pure transition table, a stage executor that
//! talks to the collaborators, a driver that commits each stage to the job
//! store, and the concurrent service callers use.

mod executor;
mod orchestrator;
mod service;
mod transitions;

pub use executor::{JobContext, StageExecutor};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use service::FulfillmentService;
pub use transitions::{apply, plan, Policy, StageRun, Step};
