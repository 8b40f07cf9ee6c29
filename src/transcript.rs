//! Message bus and transcript
//!
//! Append-only, totally ordered log of everything that happens in a run:
//! agent speech, opening prompts, state changes, rejected deltas, skipped and
//! not-run turns. `sequence_no` is assigned here and nowhere else.

use crate::state::StateDelta;
use crate::types::{AgentId, SequenceNo, StateVersion, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an utterance records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UtteranceKind {
    /// An agent's contribution
    Agent,
    /// A correction of an earlier utterance by the same speaker
    Correction {
        /// Sequence number of the corrected utterance
        corrects: SequenceNo,
    },
    /// Synthetic orchestrator message (a step's opening context)
    System,
    /// A proposed delta was applied
    StateChange {
        /// Utterance that proposed the delta
        origin: SequenceNo,
        /// Store version after the delta
        version: StateVersion,
    },
    /// A proposed delta was rejected; the proposing utterance stays valid
    DeltaRejected {
        /// Utterance that proposed the delta
        origin: SequenceNo,
        /// Why the store refused it
        reason: String,
    },
    /// Turn recorded as a no-op after retries were exhausted or the agent was unreachable
    Skipped {
        /// Attempts made before giving up
        attempts: u32,
        /// Last failure
        reason: String,
    },
    /// Participant was still queued when the step completed
    NotRun,
}

impl UtteranceKind {
    /// Whether this is something an agent said
    pub fn is_speech(&self) -> bool {
        matches!(self, UtteranceKind::Agent | UtteranceKind::Correction { .. })
    }

    /// Whether this is turn bookkeeping (skipped or not-run) rather than conversation
    pub fn is_bookkeeping(&self) -> bool {
        matches!(self, UtteranceKind::Skipped { .. } | UtteranceKind::NotRun)
    }
}

/// One recorded event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    /// Position in the run's total order
    pub sequence_no: SequenceNo,
    /// Speaking agent, or `system`
    pub speaker_id: AgentId,
    /// Round within the step; 0 for the opening context
    pub round_no: u32,
    /// Step the utterance belongs to
    pub step_id: StepId,
    /// Text
    pub content: String,
    /// State change the speaker proposed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_state_delta: Option<StateDelta>,
    /// Kind of event
    pub kind: UtteranceKind,
    /// Wall-clock time of the append
    pub timestamp: DateTime<Utc>,
}

/// Utterance before the bus assigns its sequence number and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct NewUtterance {
    /// Speaking agent
    pub speaker_id: AgentId,
    /// Round within the step
    pub round_no: u32,
    /// Step the utterance belongs to
    pub step_id: StepId,
    /// Text
    pub content: String,
    /// Proposed state change
    pub proposed_state_delta: Option<StateDelta>,
    /// Kind of event
    pub kind: UtteranceKind,
}

impl NewUtterance {
    /// Agent speech
    pub fn agent(speaker_id: AgentId, step_id: StepId, round_no: u32, content: impl Into<String>) -> Self {
        Self {
            speaker_id,
            round_no,
            step_id,
            content: content.into(),
            proposed_state_delta: None,
            kind: UtteranceKind::Agent,
        }
    }

    /// Synthetic orchestrator message
    pub fn system(step_id: StepId, round_no: u32, content: impl Into<String>) -> Self {
        Self {
            speaker_id: AgentId::system(),
            round_no,
            step_id,
            content: content.into(),
            proposed_state_delta: None,
            kind: UtteranceKind::System,
        }
    }

    /// Attach a proposed delta
    pub fn with_delta(mut self, delta: Option<StateDelta>) -> Self {
        self.proposed_state_delta = delta;
        self
    }

    /// Set the kind
    pub fn with_kind(mut self, kind: UtteranceKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Selection of utterances for a context window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptFilter {
    /// Only utterances of this step
    pub step_id: Option<StepId>,
    /// Only utterances by this speaker
    pub speaker_id: Option<AgentId>,
    /// Drop skipped and not-run records
    pub exclude_bookkeeping: bool,
    /// Keep agent speech only
    pub speech_only: bool,
}

impl TranscriptFilter {
    /// Everything
    pub fn all() -> Self {
        Self::default()
    }

    /// The conversation as an agent should see it: no skip/not-run records
    pub fn conversation() -> Self {
        Self {
            exclude_bookkeeping: true,
            ..Self::default()
        }
    }

    /// Restrict to a step
    pub fn in_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    /// Restrict to a speaker
    pub fn by_speaker(mut self, speaker_id: AgentId) -> Self {
        self.speaker_id = Some(speaker_id);
        self
    }

    /// Restrict to agent speech
    pub fn speech(mut self) -> Self {
        self.speech_only = true;
        self
    }

    /// Whether `u` passes the filter
    pub fn matches(&self, u: &Utterance) -> bool {
        if let Some(step) = &self.step_id {
            if &u.step_id != step {
                return false;
            }
        }
        if let Some(speaker) = &self.speaker_id {
            if &u.speaker_id != speaker {
                return false;
            }
        }
        if self.exclude_bookkeeping && u.kind.is_bookkeeping() {
            return false;
        }
        if self.speech_only && !u.kind.is_speech() {
            return false;
        }
        true
    }
}

/// Lazy, finite, restartable view over the transcript, most recent first.
///
/// A clone continues from where the original is; [`ContextWindow::restart`]
/// goes back to the newest matching utterance.
#[derive(Debug, Clone)]
pub struct ContextWindow<'a> {
    window: &'a [Utterance],
    max_items: usize,
    remaining: std::iter::Rev<std::slice::Iter<'a, Utterance>>,
    filter: TranscriptFilter,
    left: usize,
}

impl<'a> Iterator for ContextWindow<'a> {
    type Item = &'a Utterance;

    fn next(&mut self) -> Option<Self::Item> {
        if self.left == 0 {
            return None;
        }
        let filter = &self.filter;
        let next = self.remaining.find(|u| filter.matches(u))?;
        self.left -= 1;
        Some(next)
    }
}

impl<'a> ContextWindow<'a> {
    /// Fresh window over the same utterances, bound and filter
    pub fn restart(&self) -> Self {
        Self {
            window: self.window,
            max_items: self.max_items,
            remaining: self.window.iter().rev(),
            filter: self.filter.clone(),
            left: self.max_items,
        }
    }

    /// Collect the whole window in chronological order, regardless of how far
    /// it has been consumed
    pub fn chronological(&self) -> Vec<Utterance> {
        let mut items: Vec<Utterance> = self.restart().cloned().collect();
        items.reverse();
        items
    }
}

/// Append-only message bus
#[derive(Debug, Clone, Default)]
pub struct MessageBus {
    utterances: Vec<Utterance>,
}

impl MessageBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an utterance, assigning the next sequence number
    pub fn append(&mut self, new: NewUtterance) -> SequenceNo {
        let sequence_no = self.next_sequence_no();
        self.utterances.push(Utterance {
            sequence_no,
            speaker_id: new.speaker_id,
            round_no: new.round_no,
            step_id: new.step_id,
            content: new.content,
            proposed_state_delta: new.proposed_state_delta,
            kind: new.kind,
            timestamp: Utc::now(),
        });
        sequence_no
    }

    /// Sequence number the next append will receive
    pub fn next_sequence_no(&self) -> SequenceNo {
        self.utterances.len() as SequenceNo + 1
    }

    /// Sequence number of the newest utterance, 0 when empty
    pub fn last_sequence_no(&self) -> SequenceNo {
        self.utterances.len() as SequenceNo
    }

    /// Up to `max_items` utterances with `sequence_no <= up_to_sequence_no` matching `filter`
    pub fn context_window(
        &self,
        up_to_sequence_no: SequenceNo,
        max_items: usize,
        filter: TranscriptFilter,
    ) -> ContextWindow<'_> {
        let end = (up_to_sequence_no as usize).min(self.utterances.len());
        let window = &self.utterances[..end];
        ContextWindow {
            window,
            max_items,
            remaining: window.iter().rev(),
            filter,
            left: max_items,
        }
    }

    /// Look up an utterance by sequence number
    pub fn get(&self, sequence_no: SequenceNo) -> Option<&Utterance> {
        if sequence_no == 0 {
            return None;
        }
        self.utterances.get(sequence_no as usize - 1)
    }

    /// All utterances with `sequence_no >= from`
    pub fn since(&self, from: SequenceNo) -> &[Utterance] {
        let start = (from.max(1) as usize - 1).min(self.utterances.len());
        &self.utterances[start..]
    }

    /// Whole transcript in order
    pub fn full_transcript(&self) -> &[Utterance] {
        &self.utterances
    }

    /// Number of utterances
    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    /// Whether nothing has been appended
    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    /// Consume the bus, returning the transcript
    pub fn into_transcript(self) -> Vec<Utterance> {
        self.utterances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn speak(bus: &mut MessageBus, who: &str, step: &str, text: &str) -> SequenceNo {
        bus.append(NewUtterance::agent(AgentId::new(who), StepId::new(step), 1, text))
    }

    #[test]
    fn test_append_assigns_sequence_numbers() {
        let mut bus = MessageBus::new();
        assert_eq!(bus.last_sequence_no(), 0);
        assert_eq!(speak(&mut bus, "a", "s1", "hello"), 1);
        assert_eq!(speak(&mut bus, "b", "s1", "hi"), 2);
        assert_eq!(bus.get(2).unwrap().speaker_id.as_str(), "b");
        assert!(bus.get(0).is_none());
        assert!(bus.get(3).is_none());
    }

    #[test]
    fn test_context_window_is_most_recent_first_and_bounded() {
        let mut bus = MessageBus::new();
        for i in 0..5 {
            speak(&mut bus, "a", "s1", &format!("m{}", i));
        }
        let seqs: Vec<_> = bus
            .context_window(4, 2, TranscriptFilter::all())
            .map(|u| u.sequence_no)
            .collect();
        assert_eq!(seqs, vec![4, 3]);
    }

    #[test]
    fn test_context_window_is_restartable() {
        let mut bus = MessageBus::new();
        for i in 0..3 {
            speak(&mut bus, "a", "s1", &format!("m{}", i));
        }
        let mut window = bus.context_window(10, 2, TranscriptFilter::all());
        assert_eq!(window.next().unwrap().sequence_no, 3);

        let rest: Vec<_> = window.clone().map(|u| u.sequence_no).collect();
        assert_eq!(rest, vec![2]);

        let again: Vec<_> = window.restart().map(|u| u.sequence_no).collect();
        assert_eq!(again, vec![3, 2]);
        let ordered: Vec<_> = window.chronological().iter().map(|u| u.sequence_no).collect();
        assert_eq!(ordered, vec![2, 3]);
        let drained: Vec<_> = window.map(|u| u.sequence_no).collect();
        assert_eq!(drained, vec![2]);
    }

    #[test]
    fn test_context_window_filters() {
        let mut bus = MessageBus::new();
        bus.append(NewUtterance::system(StepId::new("s1"), 0, "open"));
        speak(&mut bus, "a", "s1", "one");
        speak(&mut bus, "b", "s2", "two");
        bus.append(
            NewUtterance::agent(AgentId::new("c"), StepId::new("s2"), 1, "skipped")
                .with_kind(UtteranceKind::NotRun),
        );

        let step2: Vec<_> = bus
            .context_window(10, 10, TranscriptFilter::conversation().in_step(StepId::new("s2")))
            .map(|u| u.content.clone())
            .collect();
        assert_eq!(step2, vec!["two"]);

        let speech = bus
            .context_window(10, 10, TranscriptFilter::all().speech())
            .chronological();
        assert_eq!(speech.len(), 2);
        assert_eq!(speech[0].content, "one");

        let by_a = bus
            .context_window(10, 10, TranscriptFilter::all().by_speaker(AgentId::new("a")))
            .count();
        assert_eq!(by_a, 1);
    }

    #[test]
    fn test_since_slices_transcript() {
        let mut bus = MessageBus::new();
        for i in 0..4 {
            speak(&mut bus, "a", "s1", &format!("m{}", i));
        }
        assert_eq!(bus.since(3).len(), 2);
        assert_eq!(bus.since(0).len(), 4);
        assert!(bus.since(9).is_empty());
    }

    proptest! {
        #[test]
        fn prop_sequence_numbers_are_gapless(count in 0usize..100) {
            let mut bus = MessageBus::new();
            for i in 0..count {
                speak(&mut bus, "a", "s", &i.to_string());
            }
            for (i, u) in bus.full_transcript().iter().enumerate() {
                prop_assert_eq!(u.sequence_no, i as u64 + 1);
            }
        }
    }
}
