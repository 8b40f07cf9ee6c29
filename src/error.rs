//! Error types for the FinSim orchestrator

use crate::types::{AgentId, StepId};
use thiserror::Error;

/// Result type alias for FinSim operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the FinSim orchestrator
#[derive(Debug, Error)]
pub enum Error {
    /// Agent did not answer within the turn deadline
    #[error("Agent {agent} timed out after {timeout_ms} ms")]
    AgentTimeout {
        /// Agent that was asked
        agent: AgentId,
        /// Deadline that passed
        timeout_ms: u64,
    },

    /// Agent reply could not be turned into an utterance
    #[error("Malformed output from agent {agent}: {reason}")]
    AgentMalformedOutput {
        /// Agent that replied
        agent: AgentId,
        /// What was wrong with the reply
        reason: String,
    },

    /// Agent is permanently unreachable (never retried)
    #[error("Agent {agent} unavailable: {reason}")]
    AgentUnavailable {
        /// Agent that could not be reached
        agent: AgentId,
        /// Reported cause
        reason: String,
    },

    /// Transient agent failure
    #[error("Agent error: {0}")]
    Agent(String),

    /// Delta originates from context older than an already applied delta
    #[error("State conflict: origin sequence {origin} is not after last applied origin {last_applied}")]
    Conflict {
        /// Sequence number of the proposing utterance
        origin: u64,
        /// Origin of the most recently applied delta
        last_applied: u64,
    },

    /// Delta key unknown to the schema or value failed its type check
    #[error("State validation failed for `{key}`: {reason}")]
    Validation {
        /// Offending key
        key: String,
        /// Why it was rejected
        reason: String,
    },

    /// State key not present in the store
    #[error("State key not found: {0}")]
    StateKeyNotFound(String),

    /// Step cannot make progress
    #[error("Step {step} cannot make progress: {reason}")]
    StepUnrecoverable {
        /// Step that failed
        step: StepId,
        /// Why it cannot continue
        reason: String,
    },

    /// Cooperative cancellation was observed
    #[error("Cancellation requested")]
    Cancelled,

    /// Attempted to mutate a run that already reached a terminal status
    #[error("Run already finalized with status {0}")]
    RunFinalized(String),

    /// Scenario definition is invalid
    #[error("Scenario error: {0}")]
    Scenario(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an agent error
    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }

    /// Create a malformed output error
    pub fn malformed(agent: AgentId, reason: impl Into<String>) -> Self {
        Self::AgentMalformedOutput {
            agent,
            reason: reason.into(),
        }
    }

    /// Create an unavailable agent error
    pub fn unavailable(agent: AgentId, reason: impl Into<String>) -> Self {
        Self::AgentUnavailable {
            agent,
            reason: reason.into(),
        }
    }

    /// Create a state validation error
    pub fn validation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a step unrecoverable error
    pub fn step_unrecoverable(step: StepId, reason: impl Into<String>) -> Self {
        Self::StepUnrecoverable {
            step,
            reason: reason.into(),
        }
    }

    /// Create a scenario error
    pub fn scenario(msg: impl Into<String>) -> Self {
        Self::Scenario(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether a failed turn attempt should be retried within the retry budget
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AgentTimeout { .. } | Self::AgentMalformedOutput { .. } | Self::Agent(_)
        )
    }

    /// Whether the error is a per-delta rejection that never fails a turn
    pub fn is_delta_rejection(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let agent = AgentId::new("bank");
        assert!(Error::AgentTimeout { agent: agent.clone(), timeout_ms: 10 }.is_retryable());
        assert!(Error::malformed(agent.clone(), "empty").is_retryable());
        assert!(Error::agent("flaky").is_retryable());
        assert!(!Error::unavailable(agent, "gone").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_delta_rejection_classification() {
        assert!(Error::Conflict { origin: 1, last_applied: 2 }.is_delta_rejection());
        assert!(Error::validation("rate", "out of range").is_delta_rejection());
        assert!(!Error::StateKeyNotFound("rate".into()).is_delta_rejection());
    }
}
