//! Orchestrator entry point and run results

use crate::agent::{AgentHandle, AgentRegistry};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::orchestrator::cancel::CancellationSignal;
use crate::orchestrator::engine::{FailureCause, RunStatus, ScenarioEngine, ScenarioRun};
use crate::orchestrator::scenario::ScenarioDefinition;
use crate::orchestrator::scheduler::{StepReport, TurnScheduler};
use crate::orchestrator::selection::SpeakerSelector;
use crate::state::{AppliedDelta, MarketStateStore, StateDelta, StateSchema, StateSnapshot};
use crate::transcript::Utterance;
use crate::types::{AgentId, RunId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Everything a finished run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Run identifier
    pub run_id: RunId,
    /// Scenario that ran
    pub scenario_id: String,
    /// Terminal status
    pub status: RunStatus,
    /// Failure cause when `status` is `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    /// Reports of the steps that finished
    pub steps: Vec<StepReport>,
    /// Full transcript
    pub transcript: Vec<Utterance>,
    /// Market state at the end of the run
    pub final_state: StateSnapshot,
    /// Applied deltas in order
    pub applied_deltas: Vec<AppliedDelta>,
    /// Wall-clock duration
    pub total_time_ms: u64,
}

impl RunResult {
    /// Whether every step finished
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Agent speech by `agent`
    pub fn utterances_by<'a>(&'a self, agent: &'a AgentId) -> impl Iterator<Item = &'a Utterance> + 'a {
        self.transcript
            .iter()
            .filter(move |u| &u.speaker_id == agent && u.kind.is_speech())
    }

    /// Turn a failed run into its error, keeping completed and aborted runs
    pub fn into_result(self) -> Result<Self> {
        match (&self.status, &self.failure) {
            (RunStatus::Failed, Some(cause)) => Err(Error::step_unrecoverable(
                cause.step_id.clone(),
                cause.message.clone(),
            )),
            _ => Ok(self),
        }
    }

    /// Pretty JSON rendering for audit
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the JSON rendering to `path`
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_json_pretty()?)?;
        Ok(())
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    registry: AgentRegistry,
    pending: Vec<AgentHandle>,
    schema: StateSchema,
    initial_state: StateDelta,
    config: OrchestratorConfig,
    selector: Option<Arc<dyn SpeakerSelector>>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        let (schema, initial_state) = StateSchema::market_defaults();
        Self {
            registry: AgentRegistry::new(),
            pending: Vec::new(),
            schema,
            initial_state,
            config: OrchestratorConfig::default(),
            selector: None,
        }
    }
}

impl OrchestratorBuilder {
    /// Register an agent
    pub fn agent(mut self, handle: AgentHandle) -> Self {
        self.pending.push(handle);
        self
    }

    /// Use an already populated registry
    pub fn registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the state schema and its initial values
    pub fn state(mut self, schema: StateSchema, initial_state: StateDelta) -> Self {
        self.schema = schema;
        self.initial_state = initial_state;
        self
    }

    /// Set the configuration
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the configured selection policy
    pub fn selector(mut self, selector: Arc<dyn SpeakerSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        // Reject a bad seed now rather than on every run
        MarketStateStore::new(self.schema.clone(), self.initial_state.clone())?;

        let mut registry = self.registry;
        for handle in self.pending {
            registry.register(handle)?;
        }

        let mut scheduler = TurnScheduler::new(&self.config);
        if let Some(selector) = self.selector {
            scheduler = scheduler.with_selector(selector);
        }

        Ok(Orchestrator {
            registry,
            schema: self.schema,
            initial_state: self.initial_state,
            config: self.config,
            engine: ScenarioEngine::new(scheduler),
        })
    }
}

/// Runs scenarios against a fixed set of agents and a seeded market state
#[derive(Debug, Clone)]
pub struct Orchestrator {
    registry: AgentRegistry,
    schema: StateSchema,
    initial_state: StateDelta,
    config: OrchestratorConfig,
    engine: ScenarioEngine,
}

impl Orchestrator {
    /// Start building an orchestrator
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Registered agents
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Active configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a scenario to a terminal state
    pub async fn run(&self, scenario: &ScenarioDefinition) -> Result<RunResult> {
        self.run_with_cancel(scenario, CancellationSignal::never()).await
    }

    /// Run a scenario, observing `cancel` before each step and between rounds.
    ///
    /// Invalid scenarios are rejected before the run starts; everything that
    /// happens once it has started is reported in the result.
    pub async fn run_with_cancel(&self, scenario: &ScenarioDefinition, cancel: CancellationSignal) -> Result<RunResult> {
        scenario.validate()?;
        let start = Instant::now();

        let store = MarketStateStore::new(self.schema.clone(), self.initial_state.clone())?;
        let mut ledger = Ledger::new(store);
        let mut run = ScenarioRun::new(scenario);

        tracing::info!(
            run_id = %run.run_id,
            scenario = %scenario.id,
            steps = scenario.steps.len(),
            selector = self.engine.scheduler().selector_name(),
            "Starting scenario run"
        );
        let span = tracing::info_span!("run", run_id = %run.run_id, scenario = %scenario.id);
        self.engine
            .drive(&mut run, &self.registry, &mut ledger, &cancel)
            .instrument(span)
            .await?;

        let (store, bus) = ledger.into_parts();
        let result = RunResult {
            run_id: run.run_id,
            scenario_id: run.scenario_id.clone(),
            status: run.status(),
            failure: run.failure().cloned(),
            steps: run.step_reports().to_vec(),
            final_state: store.snapshot(),
            applied_deltas: store.history().to_vec(),
            transcript: bus.into_transcript(),
            total_time_ms: start.elapsed().as_millis() as u64,
        };
        tracing::info!(
            run_id = %result.run_id,
            status = ?result.status,
            utterances = result.transcript.len(),
            state_version = result.final_state.version,
            "Scenario run finished"
        );
        Ok(result)
    }

    /// Run independent scenarios concurrently; each gets its own state and transcript
    pub async fn run_batch(&self, scenarios: &[ScenarioDefinition]) -> Vec<Result<RunResult>> {
        futures::future::join_all(scenarios.iter().map(|s| self.run(s))).await
    }

    /// Load a scenario file and run it
    pub async fn run_file(&self, path: impl AsRef<Path>) -> Result<RunResult> {
        let scenario = ScenarioDefinition::from_file(path)?;
        self.run(&scenario).await
    }
}
