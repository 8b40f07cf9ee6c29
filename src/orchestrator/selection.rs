//! Speaker selection within a round
//!
//! A selector only picks among the participants that have not yet taken a
//! turn in the current round. The scheduler enforces that its choice is one
//! of them.

use crate::agent::AgentHandle;
use crate::config::SelectionPolicy;
use crate::transcript::{MessageBus, TranscriptFilter};
use crate::types::AgentId;
use std::sync::Arc;

/// Chooses the next speaker from the participants remaining in a round
pub trait SpeakerSelector: Send + Sync {
    /// Pick one of `remaining` (non-empty, in declared order)
    fn select_next(&self, remaining: &[&AgentHandle], bus: &MessageBus) -> Option<AgentId>;

    /// Selector name for logging
    fn name(&self) -> &str;
}

/// Declared participant order
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl SpeakerSelector for RoundRobin {
    fn select_next(&self, remaining: &[&AgentHandle], _bus: &MessageBus) -> Option<AgentId> {
        remaining.first().map(|h| h.id.clone())
    }

    fn name(&self) -> &str {
        "round_robin"
    }
}

/// Picks the participant whose capability tags and role are mentioned most in
/// recent speech; ties go to declared order
#[derive(Debug, Clone, Copy)]
pub struct RelevanceSelector {
    lookback: usize,
}

impl Default for RelevanceSelector {
    fn default() -> Self {
        Self { lookback: 5 }
    }
}

impl RelevanceSelector {
    /// Create a selector that reads the last `lookback` speech utterances
    pub fn new(lookback: usize) -> Self {
        Self { lookback: lookback.max(1) }
    }

    fn score(handle: &AgentHandle, recent: &str) -> usize {
        let mut score = 0;
        for tag in handle.capabilities.iter().filter(|t| !t.is_empty()) {
            let needle = tag.to_lowercase().replace('_', " ");
            score += recent.matches(&needle).count();
            if needle != tag.to_lowercase() {
                score += recent.matches(&tag.to_lowercase()).count();
            }
        }
        score += recent.matches(handle.role.as_str()).count();
        score += recent.matches(&handle.id.as_str().to_lowercase()).count();
        score
    }
}

impl SpeakerSelector for RelevanceSelector {
    fn select_next(&self, remaining: &[&AgentHandle], bus: &MessageBus) -> Option<AgentId> {
        let recent = bus
            .context_window(bus.last_sequence_no(), self.lookback, TranscriptFilter::all().speech())
            .map(|u| u.content.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n");

        let mut best: Option<(&AgentHandle, usize)> = None;
        for handle in remaining {
            let score = Self::score(handle, &recent);
            match best {
                Some((_, top)) if top >= score => {}
                _ => best = Some((handle, score)),
            }
        }
        best.map(|(h, _)| h.id.clone())
    }

    fn name(&self) -> &str {
        "relevance"
    }
}

impl SelectionPolicy {
    /// Selector implementing this policy
    pub fn selector(&self) -> Arc<dyn SpeakerSelector> {
        match self {
            SelectionPolicy::RoundRobin => Arc::new(RoundRobin),
            SelectionPolicy::Relevance => Arc::new(RelevanceSelector::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedAgent;
    use crate::transcript::NewUtterance;
    use crate::types::{Role, StepId};

    fn handle(id: &str, role: Role, caps: &[&str]) -> AgentHandle {
        AgentHandle::new(id, role, Arc::new(ScriptedAgent::repeating("ok"))).with_capabilities(caps.iter().copied())
    }

    #[test]
    fn test_round_robin_takes_first() {
        let a = handle("a", Role::Participant, &[]);
        let b = handle("b", Role::Participant, &[]);
        let bus = MessageBus::new();
        assert_eq!(RoundRobin.select_next(&[&b, &a], &bus), Some(AgentId::new("b")));
        assert_eq!(RoundRobin.select_next(&[], &bus), None);
    }

    #[test]
    fn test_relevance_prefers_mentioned_capability() {
        let bank = handle("bank", Role::Institution, &["lending"]);
        let exchange = handle("exchange", Role::Infrastructure, &["trading_halt"]);
        let mut bus = MessageBus::new();
        bus.append(NewUtterance::agent(
            AgentId::new("regulator"),
            StepId::new("s"),
            1,
            "Volatility is extreme, we may need a trading halt.",
        ));

        let selector = RelevanceSelector::default();
        assert_eq!(selector.select_next(&[&bank, &exchange], &bus), Some(AgentId::new("exchange")));
    }

    #[test]
    fn test_relevance_ties_follow_declared_order() {
        let a = handle("a", Role::Participant, &["x"]);
        let b = handle("b", Role::Participant, &["y"]);
        let bus = MessageBus::new();
        assert_eq!(
            RelevanceSelector::default().select_next(&[&a, &b], &bus),
            Some(AgentId::new("a"))
        );
    }

    #[test]
    fn test_policy_maps_to_selector() {
        assert_eq!(SelectionPolicy::RoundRobin.selector().name(), "round_robin");
        assert_eq!(SelectionPolicy::Relevance.selector().name(), "relevance");
    }
}
