//! The research pipeline.
//!
//! Three fixed stages (Research, Verify, Report) share one
//! [`state::PipelineState`], driven by the [`orchestrator::Orchestrator`].

pub mod orchestrator;
pub mod research;
pub mod retry;
pub mod stage;
pub mod state;
pub mod verify;

#[cfg(test)]
pub(crate) mod test_support;

pub use orchestrator::{Orchestrator, RunOutcome, RunSettings};
pub use state::{PipelineState, RunStatus, StageName, StageOutcome, StageState};
