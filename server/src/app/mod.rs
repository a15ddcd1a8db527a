pub mod orchestrator;
mod state;

pub use orchestrator::{Orchestrator, OrchestratorDeps, OrchestratorHandle, StartError};
pub use state::{AppState, ExternalStatus, FailureKind, Phase, StartFailure};
