//! Step completion predicates
//!
//! A predicate is a pure function of the step's transcript slice and the
//! current market state. Built-in variants are plain data and round-trip
//! through YAML in single-key map form (`state_changed: {key: rate}`);
//! [`CompletionPredicate::Custom`] wraps a closure for scenarios assembled
//! in code.

use crate::error::{Error, Result};
use crate::state::{StateSnapshot, StateValue};
use crate::transcript::{Utterance, UtteranceKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use serde_yaml::with::singleton_map_recursive;
use std::sync::Arc;

fn default_marker() -> String {
    "TERMINATE".to_string()
}

/// Signature of a custom predicate
pub type PredicateFn = dyn Fn(&[Utterance], &StateSnapshot) -> bool + Send + Sync;

/// Named closure predicate
#[derive(Clone)]
pub struct CustomPredicate {
    /// Name shown in logs and debug output
    pub name: String,
    func: Arc<PredicateFn>,
}

impl CustomPredicate {
    /// Evaluate the closure
    pub fn call(&self, slice: &[Utterance], state: &StateSnapshot) -> bool {
        (self.func)(slice, state)
    }
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomPredicate").field("name", &self.name).finish()
    }
}

/// When a step is done
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPredicate {
    /// Never holds; the step runs to its round limit
    #[default]
    Never,
    /// Holds after the first turn
    Always,
    /// A delta touching `key` was applied during the step
    StateChanged {
        /// State key
        key: String,
    },
    /// Numeric state value is at least `value`
    StateAtLeast {
        /// State key
        key: String,
        /// Threshold
        value: f64,
    },
    /// Numeric state value is at most `value`
    StateAtMost {
        /// State key
        key: String,
        /// Threshold
        value: f64,
    },
    /// State value equals `value`
    StateEquals {
        /// State key
        key: String,
        /// Expected value
        value: StateValue,
    },
    /// Some agent utterance of the step contains `text` (case-insensitive)
    ContentContains {
        /// Needle
        text: String,
    },
    /// The latest agent utterance ends with the marker
    TerminationMarker {
        /// Marker text
        #[serde(default = "default_marker")]
        marker: String,
    },
    /// At least `count` agent utterances were made in the step
    AgentTurnsAtLeast {
        /// Minimum number of utterances
        count: usize,
    },
    /// Every inner predicate holds
    AllOf(Vec<CompletionPredicate>),
    /// At least one inner predicate holds
    AnyOf(Vec<CompletionPredicate>),
    /// Inner predicate does not hold
    Not(Box<CompletionPredicate>),
    /// Closure predicate
    #[serde(skip)]
    Custom(CustomPredicate),
}

impl CompletionPredicate {
    /// Wrap a closure
    pub fn custom<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Utterance], &StateSnapshot) -> bool + Send + Sync + 'static,
    {
        Self::Custom(CustomPredicate {
            name: name.into(),
            func: Arc::new(func),
        })
    }

    /// `state_changed` shorthand
    pub fn state_changed(key: impl Into<String>) -> Self {
        Self::StateChanged { key: key.into() }
    }

    /// Parse a predicate written in single-key map form
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(yaml))
            .map_err(|e| Error::Scenario(format!("Failed to parse predicate: {}", e)))
    }

    /// Write the predicate back in single-key map form. Fails on closures.
    pub fn to_yaml(&self) -> Result<String> {
        let value = singleton_map_recursive::serialize(self, serde_yaml::value::Serializer)
            .map_err(|e| Error::Scenario(format!("Failed to write predicate: {}", e)))?;
        serde_yaml::to_string(&value).map_err(|e| Error::Scenario(format!("Failed to write predicate: {}", e)))
    }

    /// Evaluate over the step's transcript slice and the current state
    pub fn evaluate(&self, slice: &[Utterance], state: &StateSnapshot) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::StateChanged { key } => slice.iter().any(|u| match u.kind {
                UtteranceKind::StateChange { origin, .. } => slice
                    .iter()
                    .find(|o| o.sequence_no == origin)
                    .and_then(|o| o.proposed_state_delta.as_ref())
                    .is_some_and(|d| d.contains_key(key)),
                _ => false,
            }),
            Self::StateAtLeast { key, value } => state.number(key).is_some_and(|v| v >= *value),
            Self::StateAtMost { key, value } => state.number(key).is_some_and(|v| v <= *value),
            Self::StateEquals { key, value } => state.get(key).is_some_and(|v| values_equal(v, value)),
            Self::ContentContains { text } => {
                let needle = text.to_lowercase();
                speech(slice).any(|u| u.content.to_lowercase().contains(&needle))
            }
            Self::TerminationMarker { marker } => speech(slice)
                .last()
                .is_some_and(|u| u.content.trim_end().ends_with(marker.as_str())),
            Self::AgentTurnsAtLeast { count } => speech(slice).count() >= *count,
            Self::AllOf(inner) => inner.iter().all(|p| p.evaluate(slice, state)),
            Self::AnyOf(inner) => inner.iter().any(|p| p.evaluate(slice, state)),
            Self::Not(inner) => !inner.evaluate(slice, state),
            Self::Custom(custom) => custom.call(slice, state),
        }
    }
}

fn speech(slice: &[Utterance]) -> impl Iterator<Item = &Utterance> {
    slice.iter().filter(|u| u.kind.is_speech())
}

fn values_equal(a: &StateValue, b: &StateValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}
