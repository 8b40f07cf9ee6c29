//! Orchestrator module - scenario-driven multi-agent market simulation
//!
//! A scenario is a list of steps. For each step the engine resolves the
//! participants, posts the opening context, and hands the step to the turn
//! scheduler, which runs rounds of strictly sequential agent turns until the
//! step's completion predicate holds or its round limit is reached.
//!
//! # Example
//!
//! ```rust,ignore
//! use finsim::orchestrator::{presets, Orchestrator};
//!
//! let orchestrator = Orchestrator::builder()
//!     .agent(central_bank)
//!     .agent(commercial_bank)
//!     .build()?;
//! let result = orchestrator.run(&presets::load("rate_decision")?).await?;
//! ```

pub mod cancel;
pub mod engine;
pub mod predicate;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod selection;

// Re-exports
pub use cancel::{cancellation, CancelHandle, CancellationSignal};
pub use engine::{FailureCause, RunStatus, ScenarioEngine, ScenarioRun};
pub use predicate::{CompletionPredicate, CustomPredicate};
pub use runner::{Orchestrator, OrchestratorBuilder, RunResult};
pub use scenario::{presets, ScenarioDefinition, ScenarioStep};
pub use scheduler::{StepCompletion, StepReport, TurnScheduler};
pub use selection::{RelevanceSelector, RoundRobin, SpeakerSelector};
