//! # FinSim
//!
//! Turn-based orchestration of multi-agent financial market simulations.
//!
//! Autonomous agents (central banks, commercial banks, exchanges, investors,
//! regulators) take turns inside scripted scenarios. Every utterance lands
//! on a totally ordered message bus, and state changes the agents propose
//! are validated and applied to a versioned market state store.
//!
//! ## Features
//!
//! - **Deterministic turns**: one agent at a time, each seeing everything said before it
//! - **Auditable state**: every applied delta points back to the utterance that proposed it
//! - **Scenarios as data**: steps and completion predicates load from YAML
//! - **Bounded failure**: timeouts and malformed replies are retried, then skipped
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use finsim::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let central_bank = AgentHandle::new(
//!         "central_bank",
//!         Role::Regulator,
//!         Arc::new(FnAgent::new(|_ctx: &AgentContext| {
//!             Ok(AgentReply::say("Raising the policy rate by 25bp.").with_delta("interest_rate", 0.0225))
//!         })),
//!     )
//!     .with_capability("rate_setting");
//!
//!     let orchestrator = Orchestrator::builder().agent(central_bank).build()?;
//!     let result = orchestrator.run(&presets::load("rate_decision")?).await?;
//!     println!("{:?}", result.status);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod completion;
pub mod config;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod state;
pub mod telemetry;
pub mod transcript;
pub mod types;

// Re-exports for convenience
pub use agent::{
    AgentContext, AgentHandle, AgentRegistry, AgentReply, FnAgent, MarketAgent, ParticipantSpec, ScriptStep,
    ScriptedAgent,
};
pub use completion::{CompletionAgent, CompletionBackend};
pub use config::{OrchestratorConfig, SelectionPolicy};
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use orchestrator::{
    cancellation, presets, CompletionPredicate, Orchestrator, RunResult, RunStatus, ScenarioDefinition, ScenarioStep,
    StepCompletion, StepReport,
};
pub use state::{FieldSpec, MarketStateStore, StateDelta, StateSchema, StateSnapshot, StateValue};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use transcript::{MessageBus, TranscriptFilter, Utterance, UtteranceKind};
pub use types::{AgentId, Role, RunId, SequenceNo, StateVersion, StepId};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::agent::{AgentContext, AgentHandle, AgentReply, FnAgent, MarketAgent, ScriptedAgent};
    pub use crate::config::OrchestratorConfig;
    pub use crate::error::{Error, Result};
    pub use crate::orchestrator::{presets, CompletionPredicate, Orchestrator, ScenarioDefinition, ScenarioStep};
    pub use crate::state::StateValue;
    pub use crate::types::*;
}
