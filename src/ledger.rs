//! Single-writer pairing of the market state store and the message bus
//!
//! Every state mutation goes through [`Ledger::commit_delta`] so that each
//! applied delta is followed by a `state_change` event and each rejected delta
//! by a `delta_rejected` event on the bus.

use crate::error::Result;
use crate::state::{MarketStateStore, StateDelta, StateSnapshot};
use crate::transcript::{MessageBus, NewUtterance, UtteranceKind};
use crate::types::{SequenceNo, StateVersion};

/// State store and message bus owned together by one run
#[derive(Debug, Clone)]
pub struct Ledger {
    store: MarketStateStore,
    bus: MessageBus,
}

impl Ledger {
    /// Create a ledger around a seeded store and an empty bus
    pub fn new(store: MarketStateStore) -> Self {
        Self {
            store,
            bus: MessageBus::new(),
        }
    }

    /// Read access to the store
    pub fn store(&self) -> &MarketStateStore {
        &self.store
    }

    /// Read access to the bus
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Current state snapshot
    pub fn snapshot(&self) -> StateSnapshot {
        self.store.snapshot()
    }

    /// Append a non-state event or utterance
    pub fn append(&mut self, utterance: NewUtterance) -> SequenceNo {
        self.bus.append(utterance)
    }

    /// Apply the delta proposed by utterance `origin` and record the outcome on the bus.
    ///
    /// Rejections are returned as errors after the `delta_rejected` event is appended;
    /// they never invalidate the proposing utterance.
    pub fn commit_delta(&mut self, origin: SequenceNo, delta: &StateDelta) -> Result<StateVersion> {
        let (speaker_id, step_id, round_no) = match self.bus.get(origin) {
            Some(u) => (u.speaker_id.clone(), u.step_id.clone(), u.round_no),
            None => {
                return Err(crate::error::Error::other(format!(
                    "delta origin {} is not on the bus",
                    origin
                )))
            }
        };

        match self.store.apply(delta, origin) {
            Ok(version) => {
                let keys: Vec<&str> = delta.keys().map(String::as_str).collect();
                self.bus.append(NewUtterance {
                    speaker_id,
                    round_no,
                    step_id,
                    content: format!("state v{} updated: {}", version, keys.join(", ")),
                    proposed_state_delta: None,
                    kind: UtteranceKind::StateChange { origin, version },
                });
                tracing::debug!(origin, version, keys = ?keys, "Applied state delta");
                Ok(version)
            }
            Err(e) => {
                tracing::warn!(origin, error = %e, "Rejected state delta");
                self.bus.append(NewUtterance {
                    speaker_id,
                    round_no,
                    step_id,
                    content: format!("delta from #{} rejected", origin),
                    proposed_state_delta: None,
                    kind: UtteranceKind::DeltaRejected {
                        origin,
                        reason: e.to_string(),
                    },
                });
                Err(e)
            }
        }
    }

    /// Split into store and bus
    pub fn into_parts(self) -> (MarketStateStore, MessageBus) {
        (self.store, self.bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::state::{FieldSpec, StateSchema, StateValue};
    use crate::types::{AgentId, StepId};

    fn ledger() -> Ledger {
        let schema = StateSchema::new().field("rate", FieldSpec::number().with_range(0.0, 1.0));
        let initial = [("rate".to_string(), StateValue::Number(0.02))].into_iter().collect();
        Ledger::new(MarketStateStore::new(schema, initial).unwrap())
    }

    fn rate(v: f64) -> StateDelta {
        [("rate".to_string(), StateValue::Number(v))].into_iter().collect()
    }

    #[test]
    fn test_commit_appends_state_change_event() {
        let mut ledger = ledger();
        let origin = ledger.append(
            NewUtterance::agent(AgentId::new("cb"), StepId::new("s"), 1, "hike").with_delta(Some(rate(0.05))),
        );

        let version = ledger.commit_delta(origin, &rate(0.05)).unwrap();
        assert_eq!(version, 1);

        let event = ledger.bus().get(2).unwrap();
        assert_eq!(event.kind, UtteranceKind::StateChange { origin: 1, version: 1 });
        assert_eq!(event.speaker_id.as_str(), "cb");
    }

    #[test]
    fn test_rejection_appends_event_and_keeps_utterance() {
        let mut ledger = ledger();
        let origin = ledger.append(
            NewUtterance::agent(AgentId::new("cb"), StepId::new("s"), 1, "hike").with_delta(Some(rate(5.0))),
        );

        let err = ledger.commit_delta(origin, &rate(5.0)).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(ledger.bus().len(), 2);
        assert!(matches!(
            ledger.bus().get(2).unwrap().kind,
            UtteranceKind::DeltaRejected { origin: 1, .. }
        ));
        assert_eq!(ledger.bus().get(1).unwrap().kind, UtteranceKind::Agent);
        assert_eq!(ledger.store().version(), 0);
    }

    #[test]
    fn test_unknown_origin_is_refused() {
        let mut ledger = ledger();
        assert!(ledger.commit_delta(4, &rate(0.1)).is_err());
        assert!(ledger.bus().is_empty());
    }
}
