//! Scenario engine
//!
//! Drives a scenario's steps in order through the turn scheduler and keeps
//! the run's lifecycle: `pending -> running -> completed | failed | aborted`.
//! Terminal states are final.

use crate::agent::AgentRegistry;
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::orchestrator::cancel::CancellationSignal;
use crate::orchestrator::scenario::{ScenarioDefinition, ScenarioStep};
use crate::orchestrator::scheduler::{StepReport, TurnScheduler};
use crate::transcript::NewUtterance;
use crate::types::{RunId, StepId};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not started
    Pending,
    /// Steps are executing
    Running,
    /// Every step finished
    Completed,
    /// A step failed unrecoverably
    Failed,
    /// Cancelled from outside
    Aborted,
}

impl RunStatus {
    /// Whether no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted)
    }
}

/// Why a run failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    /// Step that failed
    pub step_id: StepId,
    /// Error description
    pub message: String,
}

/// State of one scenario execution
#[derive(Debug, Clone)]
pub struct ScenarioRun {
    /// Run identifier
    pub run_id: RunId,
    /// Scenario being run
    pub scenario_id: String,
    steps: Vec<ScenarioStep>,
    current_step_index: usize,
    status: RunStatus,
    step_reports: Vec<StepReport>,
    failure: Option<FailureCause>,
}

impl ScenarioRun {
    /// Create a pending run
    pub fn new(scenario: &ScenarioDefinition) -> Self {
        Self {
            run_id: RunId::new(),
            scenario_id: scenario.id.clone(),
            steps: scenario.steps.clone(),
            current_step_index: 0,
            status: RunStatus::Pending,
            step_reports: Vec::new(),
            failure: None,
        }
    }

    /// Current lifecycle state
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Index of the step being (or about to be) run
    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    /// The step being (or about to be) run
    pub fn current_step(&self) -> Option<&ScenarioStep> {
        self.steps.get(self.current_step_index)
    }

    /// Reports of completed steps, in order
    pub fn step_reports(&self) -> &[StepReport] {
        &self.step_reports
    }

    /// Failure cause, if the run failed
    pub fn failure(&self) -> Option<&FailureCause> {
        self.failure.as_ref()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::RunFinalized(format!("{:?}", self.status).to_lowercase()));
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        self.ensure_open()?;
        if self.status != RunStatus::Running {
            return Err(Error::other(format!("run {} has not been started", self.run_id)));
        }
        Ok(())
    }

    /// `pending -> running`
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.status == RunStatus::Running {
            return Err(Error::other(format!("run {} is already running", self.run_id)));
        }
        self.status = RunStatus::Running;
        Ok(())
    }

    /// Record a finished step and move on; completes the run after the last step.
    /// Only a running run can advance.
    pub fn advance(&mut self, report: StepReport) -> Result<()> {
        self.ensure_running()?;
        self.step_reports.push(report);
        self.current_step_index += 1;
        if self.current_step_index >= self.steps.len() {
            self.status = RunStatus::Completed;
        }
        Ok(())
    }

    /// `running -> failed`
    pub fn fail(&mut self, step_id: StepId, message: impl Into<String>) -> Result<()> {
        self.ensure_running()?;
        self.failure = Some(FailureCause {
            step_id,
            message: message.into(),
        });
        self.status = RunStatus::Failed;
        Ok(())
    }

    /// `pending | running -> aborted`
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.status = RunStatus::Aborted;
        Ok(())
    }
}

/// Runs scenarios step by step
#[derive(Debug, Clone)]
pub struct ScenarioEngine {
    scheduler: TurnScheduler,
}

impl ScenarioEngine {
    /// Create an engine around a scheduler
    pub fn new(scheduler: TurnScheduler) -> Self {
        Self { scheduler }
    }

    /// The scheduler used for steps
    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    /// Drive `run` to a terminal state. Errors are folded into the run status;
    /// only lifecycle misuse (driving a finished run) is returned.
    pub async fn drive(
        &self,
        run: &mut ScenarioRun,
        registry: &AgentRegistry,
        ledger: &mut Ledger,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        run.start()?;

        while let Some(step) = run.current_step().cloned() {
            if cancel.is_cancelled() {
                tracing::info!(run_id = %run.run_id, step = %step.step_id, "Run cancelled before step");
                return run.abort();
            }

            let span = tracing::info_span!("step", run_id = %run.run_id, step = %step.step_id);
            let outcome = self.run_one(&step, registry, ledger, cancel).instrument(span).await;

            match outcome {
                Ok(report) => {
                    tracing::info!(
                        step = %report.step_id,
                        completion = ?report.completion,
                        rounds = report.rounds_run,
                        "Step finished"
                    );
                    run.advance(report)?;
                }
                Err(Error::Cancelled) => {
                    tracing::info!(run_id = %run.run_id, step = %step.step_id, "Run cancelled between rounds");
                    return run.abort();
                }
                Err(e) => {
                    tracing::error!(run_id = %run.run_id, step = %step.step_id, error = %e, "Step failed");
                    return run.fail(step.step_id.clone(), e.to_string());
                }
            }
        }

        Ok(())
    }

    async fn run_one(
        &self,
        step: &ScenarioStep,
        registry: &AgentRegistry,
        ledger: &mut Ledger,
        cancel: &CancellationSignal,
    ) -> Result<StepReport> {
        let participants = registry.resolve(&step.step_id, &step.participants)?;
        let step_start = ledger.append(NewUtterance::system(
            step.step_id.clone(),
            0,
            step.opening_context.clone(),
        ));
        self.scheduler
            .run_step(step, &participants, ledger, cancel, step_start)
            .await
    }
}
