//! Build/Deploy queue, the single worker, the phase pipeline and the
//! Deployment Executor.

pub mod env_file;
pub mod executor;
pub mod log;
pub mod pipeline;
pub mod queue;
pub mod worker;

#[cfg(test)]
pub mod testing;

pub use executor::{Artifact, DeploymentExecutor};
pub use log::LogSink;
pub use pipeline::{PhaseContext, Pipeline};
pub use queue::{BuildQueue, CancelOutcome};
pub use worker::BuildWorker;
