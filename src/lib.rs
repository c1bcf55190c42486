//! Photo-to-puzzle fulfillment: takes a customer photo through consent,
//! style transformation, quality gating, upscaling and print export, with
//! every stage recorded on a durable job.

pub mod artifacts;
pub mod backend;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod quality;
pub mod store;
pub mod style;

#[cfg(test)]
mod testing;

pub use config::Configuration;
pub use error::AppError;
pub use pipeline::{FulfillmentService, Orchestrator};
pub use store::{Job, JobId, JobRequest, JobStatus, JobSummary};
