//! Turn scheduler
//!
//! Runs the rounds of one scenario step. In each round every participant
//! takes at most one turn, in the order the selector picks from those still
//! waiting. Turns never overlap: an agent's utterance and the delta it
//! proposes are committed before the next agent is asked, so every agent
//! sees everything said before it.
//!
//! The completion predicate is evaluated after every turn. When it holds, the
//! participants still queued in the round are recorded as not run and the
//! step ends. Reaching the round limit ends the step as well and is reported,
//! not raised.

use crate::agent::{AgentContext, AgentHandle, ParsedReply};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::orchestrator::cancel::CancellationSignal;
use crate::orchestrator::scenario::ScenarioStep;
use crate::orchestrator::selection::SpeakerSelector;
use crate::transcript::{MessageBus, NewUtterance, TranscriptFilter, UtteranceKind};
use crate::types::{AgentId, SequenceNo, StepId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCompletion {
    /// The completion predicate held
    CompletedByPredicate,
    /// The round limit was reached first
    CompletedByLimit,
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Step that ran
    pub step_id: StepId,
    /// Why it ended
    pub completion: StepCompletion,
    /// Rounds started
    pub rounds_run: u32,
    /// Turns that produced an utterance
    pub turns_taken: usize,
    /// Turns recorded as skipped
    pub skipped: usize,
    /// Participants still queued when the predicate held
    pub not_run: usize,
    /// First sequence number of the step (its opening utterance)
    pub first_sequence_no: SequenceNo,
    /// Last sequence number of the step
    pub last_sequence_no: SequenceNo,
}

enum TurnOutcome {
    Spoke,
    Skipped { unreachable: bool },
}

/// Runs the rounds of a step against the ledger
#[derive(Clone)]
pub struct TurnScheduler {
    selector: Arc<dyn SpeakerSelector>,
    agent_timeout: Duration,
    retry_budget: u32,
    context_window: usize,
    max_content_chars: usize,
    default_max_rounds: u32,
}

impl TurnScheduler {
    /// Create a scheduler from configuration, using the configured selection policy
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            selector: config.selection.selector(),
            agent_timeout: config.agent_timeout(),
            retry_budget: config.retry_budget,
            context_window: config.context_window,
            max_content_chars: config.max_content_chars,
            default_max_rounds: config.default_max_rounds,
        }
    }

    /// Replace the speaker selector
    pub fn with_selector(mut self, selector: Arc<dyn SpeakerSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Name of the active selector
    pub fn selector_name(&self) -> &str {
        self.selector.name()
    }

    /// Run a step whose opening utterance is `step_start`.
    ///
    /// Returns [`Error::Cancelled`] when cancellation is observed between rounds and
    /// [`Error::StepUnrecoverable`] when every participant has become unreachable.
    pub async fn run_step(
        &self,
        step: &ScenarioStep,
        participants: &[AgentHandle],
        ledger: &mut Ledger,
        cancel: &CancellationSignal,
        step_start: SequenceNo,
    ) -> Result<StepReport> {
        if participants.is_empty() {
            return Err(Error::step_unrecoverable(step.step_id.clone(), "no participants"));
        }

        let max_rounds = step.max_rounds.unwrap_or(self.default_max_rounds).max(1);
        let mut unreachable: BTreeSet<AgentId> = BTreeSet::new();
        let mut report = StepReport {
            step_id: step.step_id.clone(),
            completion: StepCompletion::CompletedByLimit,
            rounds_run: 0,
            turns_taken: 0,
            skipped: 0,
            not_run: 0,
            first_sequence_no: step_start,
            last_sequence_no: step_start,
        };

        for round_no in 1..=max_rounds {
            if round_no > 1 && cancel.is_cancelled() {
                tracing::info!(step = %step.step_id, round_no, "Cancellation observed between rounds");
                return Err(Error::Cancelled);
            }
            report.rounds_run = round_no;

            let mut remaining: Vec<&AgentHandle> = participants.iter().collect();
            while !remaining.is_empty() {
                let index = self.pick(&remaining, ledger.bus(), &step.step_id);
                let handle = remaining.remove(index);

                if unreachable.contains(&handle.id) {
                    ledger.append(
                        NewUtterance::agent(handle.id.clone(), step.step_id.clone(), round_no, "agent unreachable")
                            .with_kind(UtteranceKind::Skipped {
                                attempts: 0,
                                reason: "agent unreachable earlier in the step".to_string(),
                            }),
                    );
                    report.skipped += 1;
                } else {
                    match self.take_turn(step, handle, round_no, ledger).await {
                        TurnOutcome::Spoke => report.turns_taken += 1,
                        TurnOutcome::Skipped { unreachable: lost } => {
                            report.skipped += 1;
                            if lost {
                                unreachable.insert(handle.id.clone());
                            }
                        }
                    }
                }

                let snapshot = ledger.snapshot();
                if step
                    .completion_predicate
                    .evaluate(ledger.bus().since(step_start), &snapshot)
                {
                    for queued in remaining {
                        ledger.append(
                            NewUtterance::agent(queued.id.clone(), step.step_id.clone(), round_no, "not run")
                                .with_kind(UtteranceKind::NotRun),
                        );
                        report.not_run += 1;
                    }
                    report.completion = StepCompletion::CompletedByPredicate;
                    report.last_sequence_no = ledger.bus().last_sequence_no();
                    tracing::debug!(step = %step.step_id, round_no, "Completion predicate satisfied");
                    return Ok(report);
                }
            }

            if participants.iter().all(|h| unreachable.contains(&h.id)) {
                return Err(Error::step_unrecoverable(
                    step.step_id.clone(),
                    "every participant is unreachable",
                ));
            }
        }

        report.last_sequence_no = ledger.bus().last_sequence_no();
        tracing::debug!(step = %step.step_id, rounds = max_rounds, "Round limit reached");
        Ok(report)
    }

    fn pick(&self, remaining: &[&AgentHandle], bus: &MessageBus, step_id: &StepId) -> usize {
        let chosen = self.selector.select_next(remaining, bus);
        match chosen.as_ref().and_then(|id| remaining.iter().position(|h| &h.id == id)) {
            Some(index) => index,
            None => {
                tracing::warn!(
                    step = %step_id,
                    selector = self.selector.name(),
                    chosen = ?chosen,
                    "Selector chose an agent outside the round; using declared order"
                );
                0
            }
        }
    }

    fn context_for(
        &self,
        step: &ScenarioStep,
        handle: &AgentHandle,
        round_no: u32,
        attempt: u32,
        ledger: &Ledger,
    ) -> AgentContext {
        let bus = ledger.bus();
        AgentContext {
            agent_id: handle.id.clone(),
            role: handle.role,
            step_id: step.step_id.clone(),
            round_no,
            attempt,
            opening_context: step.opening_context.clone(),
            history: bus
                .context_window(bus.last_sequence_no(), self.context_window, TranscriptFilter::conversation())
                .chronological(),
            state: ledger.snapshot(),
        }
    }

    async fn take_turn(
        &self,
        step: &ScenarioStep,
        handle: &AgentHandle,
        round_no: u32,
        ledger: &mut Ledger,
    ) -> TurnOutcome {
        let max_attempts = self.retry_budget.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let ctx = self.context_for(step, handle, round_no, attempt, ledger);

            match self.attempt(handle, &ctx, ledger.bus()).await {
                Ok(reply) => {
                    self.record(step, handle, round_no, reply, ledger);
                    return TurnOutcome::Spoke;
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        agent = %handle.id,
                        step = %step.step_id,
                        attempt,
                        error = %e,
                        "Agent turn failed, retrying"
                    );
                }
                Err(e) => {
                    let unreachable = matches!(e, Error::AgentUnavailable { .. });
                    tracing::warn!(
                        agent = %handle.id,
                        step = %step.step_id,
                        attempts = attempt,
                        error = %e,
                        "Skipping agent turn"
                    );
                    ledger.append(
                        NewUtterance::agent(handle.id.clone(), step.step_id.clone(), round_no, "turn skipped")
                            .with_kind(UtteranceKind::Skipped {
                                attempts: attempt,
                                reason: e.to_string(),
                            }),
                    );
                    return TurnOutcome::Skipped { unreachable };
                }
            }
        }
    }

    async fn attempt(&self, handle: &AgentHandle, ctx: &AgentContext, bus: &MessageBus) -> Result<ParsedReply> {
        let reply = match tokio::time::timeout(self.agent_timeout, handle.act(ctx)).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(Error::AgentTimeout {
                    agent: handle.id.clone(),
                    timeout_ms: self.agent_timeout.as_millis() as u64,
                })
            }
        };

        let parsed = reply.parse(&handle.id, self.max_content_chars)?;
        if let Some(target) = parsed.corrects {
            match bus.get(target) {
                Some(u) if u.speaker_id == handle.id && u.kind.is_speech() => {}
                Some(_) => {
                    return Err(Error::malformed(
                        handle.id.clone(),
                        format!("#{} is not an utterance of this agent", target),
                    ))
                }
                None => {
                    return Err(Error::malformed(
                        handle.id.clone(),
                        format!("correction target #{} does not exist", target),
                    ))
                }
            }
        }
        Ok(parsed)
    }

    fn record(&self, step: &ScenarioStep, handle: &AgentHandle, round_no: u32, reply: ParsedReply, ledger: &mut Ledger) {
        let kind = match reply.corrects {
            Some(corrects) => UtteranceKind::Correction { corrects },
            None => UtteranceKind::Agent,
        };
        let delta = reply.proposed_state_delta;
        let origin = ledger.append(
            NewUtterance::agent(handle.id.clone(), step.step_id.clone(), round_no, reply.content)
                .with_delta(delta.clone())
                .with_kind(kind),
        );
        tracing::debug!(agent = %handle.id, step = %step.step_id, round_no, sequence_no = origin, "Recorded utterance");

        if let Some(delta) = delta {
            // Rejections are already on the bus; the turn still counts.
            if let Err(e) = ledger.commit_delta(origin, &delta) {
                if !e.is_delta_rejection() {
                    tracing::error!(agent = %handle.id, origin, error = %e, "Could not commit state delta");
                }
            }
        }
    }
}

impl std::fmt::Debug for TurnScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnScheduler")
            .field("selector", &self.selector.name())
            .field("agent_timeout", &self.agent_timeout)
            .field("retry_budget", &self.retry_budget)
            .field("default_max_rounds", &self.default_max_rounds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentReply, ScriptStep, ScriptedAgent};
    use crate::orchestrator::cancel::cancellation;
    use crate::orchestrator::predicate::CompletionPredicate;
    use crate::state::{FieldSpec, MarketStateStore, StateSchema, StateValue};
    use crate::types::Role;

    fn ledger() -> Ledger {
        let schema = StateSchema::new().field("rate", FieldSpec::number().with_range(0.0, 1.0));
        let initial = [("rate".to_string(), StateValue::Number(0.02))].into_iter().collect();
        Ledger::new(MarketStateStore::new(schema, initial).unwrap())
    }

    fn open(ledger: &mut Ledger, step: &ScenarioStep) -> SequenceNo {
        ledger.append(NewUtterance::system(step.step_id.clone(), 0, step.opening_context.clone()))
    }

    fn scripted(id: &str, script: Vec<ScriptStep>) -> (AgentHandle, Arc<ScriptedAgent>) {
        let agent = Arc::new(ScriptedAgent::new(script));
        (AgentHandle::new(id, Role::Participant, agent.clone()), agent)
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default().with_agent_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_correction_must_target_own_utterance() {
        let (a, _) = scripted("a", vec![ScriptStep::Reply(AgentReply::say("first"))]);
        let (b, b_agent) = scripted(
            "b",
            vec![
                ScriptStep::Reply(AgentReply::say("fixing a").correcting(2)),
                ScriptStep::Reply(AgentReply::say("fixing myself").correcting(3)),
            ],
        );
        let step = ScenarioStep::new("s", "open").with_agents(["a", "b"]).with_max_rounds(1);
        let mut ledger = ledger();
        let start = open(&mut ledger, &step);

        let scheduler = TurnScheduler::new(&config());
        let report = scheduler
            .run_step(&step, &[a, b], &mut ledger, &CancellationSignal::never(), start)
            .await
            .unwrap();

        // first attempt targets a's utterance (#2) and is retried; the retry may not
        // target itself either, since #3 does not exist yet
        assert_eq!(b_agent.calls(), 2);
        assert_eq!(report.skipped, 1);
        assert!(matches!(
            ledger.bus().get(3).unwrap().kind,
            UtteranceKind::Skipped { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_rejected_delta_keeps_turn() {
        let (a, _) = scripted(
            "a",
            vec![ScriptStep::Reply(AgentReply::say("rate to 300%").with_delta("rate", 3.0))],
        );
        let step = ScenarioStep::new("s", "open")
            .with_agents(["a"])
            .with_max_rounds(1)
            .until(CompletionPredicate::state_changed("rate"));
        let mut ledger = ledger();
        let start = open(&mut ledger, &step);

        let report = TurnScheduler::new(&config())
            .run_step(&step, &[a], &mut ledger, &CancellationSignal::never(), start)
            .await
            .unwrap();

        assert_eq!(report.completion, StepCompletion::CompletedByLimit);
        assert_eq!(report.turns_taken, 1);
        assert_eq!(ledger.store().version(), 0);
        assert!(matches!(
            ledger.bus().get(3).unwrap().kind,
            UtteranceKind::DeltaRejected { origin: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_not_invoked_again() {
        let (a, a_agent) = scripted("a", vec![ScriptStep::Unavailable("connection refused".into())]);
        let (b, _) = scripted("b", vec![ScriptStep::Reply(AgentReply::say("still here"))]);
        let step = ScenarioStep::new("s", "open").with_agents(["a", "b"]).with_max_rounds(3);
        let mut ledger = ledger();
        let start = open(&mut ledger, &step);

        let report = TurnScheduler::new(&config().with_retry_budget(3))
            .run_step(&step, &[a, b], &mut ledger, &CancellationSignal::never(), start)
            .await
            .unwrap();

        assert_eq!(a_agent.calls(), 1);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.turns_taken, 3);
    }

    #[tokio::test]
    async fn test_all_unreachable_fails_step() {
        let (a, _) = scripted("a", vec![ScriptStep::Unavailable("down".into())]);
        let step = ScenarioStep::new("s", "open").with_agents(["a"]).with_max_rounds(2);
        let mut ledger = ledger();
        let start = open(&mut ledger, &step);

        let err = TurnScheduler::new(&config())
            .run_step(&step, &[a], &mut ledger, &CancellationSignal::never(), start)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StepUnrecoverable { .. }));
    }

    #[tokio::test]
    async fn test_cancel_between_rounds() {
        let (a, a_agent) = scripted("a", vec![ScriptStep::Reply(AgentReply::say("hi"))]);
        let step = ScenarioStep::new("s", "open").with_agents(["a"]).with_max_rounds(5);
        let mut ledger = ledger();
        let start = open(&mut ledger, &step);
        let (handle, signal) = cancellation();
        handle.cancel();

        let err = TurnScheduler::new(&config())
            .run_step(&step, &[a], &mut ledger, &signal, start)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        // the first round always runs once the step has opened
        assert_eq!(a_agent.calls(), 1);
    }

    struct Rogue;

    impl SpeakerSelector for Rogue {
        fn select_next(&self, _remaining: &[&AgentHandle], _bus: &MessageBus) -> Option<AgentId> {
            Some(AgentId::new("intruder"))
        }

        fn name(&self) -> &str {
            "rogue"
        }
    }

    #[tokio::test]
    async fn test_invalid_selection_falls_back_to_declared_order() {
        let (a, _) = scripted("a", vec![ScriptStep::Reply(AgentReply::say("a speaks"))]);
        let (b, _) = scripted("b", vec![ScriptStep::Reply(AgentReply::say("b speaks"))]);
        let step = ScenarioStep::new("s", "open").with_agents(["a", "b"]).with_max_rounds(1);
        let mut ledger = ledger();
        let start = open(&mut ledger, &step);

        let scheduler = TurnScheduler::new(&config()).with_selector(Arc::new(Rogue));
        assert_eq!(scheduler.selector_name(), "rogue");
        scheduler
            .run_step(&step, &[a, b], &mut ledger, &CancellationSignal::never(), start)
            .await
            .unwrap();

        let speakers: Vec<_> = ledger.bus().since(2).iter().map(|u| u.speaker_id.as_str()).collect();
        assert_eq!(speakers, vec!["a", "b"]);
    }
}
