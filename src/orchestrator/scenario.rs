//! Scenario definitions parsed from YAML templates
//!
//! A scenario is a finite, ordered list of steps. Each step names its
//! participants (agent ids, `role:` or `capability:` filters), an opening
//! prompt, an optional round limit, and a completion predicate.

use crate::agent::ParticipantSpec;
use crate::error::{Error, Result};
use crate::orchestrator::predicate::CompletionPredicate;
use crate::types::StepId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One scripted phase of a scenario. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStep {
    /// Unique within the scenario
    pub step_id: StepId,
    /// Ordered participant list
    pub participants: Vec<ParticipantSpec>,
    /// Appended as a system utterance before the first round
    #[serde(default)]
    pub opening_context: String,
    /// Round limit; the orchestrator default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u32>,
    /// When the step is done
    #[serde(default, alias = "until", with = "serde_yaml::with::singleton_map_recursive")]
    pub completion_predicate: CompletionPredicate,
}

impl ScenarioStep {
    /// Create a step with no participants
    pub fn new(step_id: impl Into<StepId>, opening_context: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            participants: Vec::new(),
            opening_context: opening_context.into(),
            max_rounds: None,
            completion_predicate: CompletionPredicate::Never,
        }
    }

    /// Add a participant
    pub fn with_participant(mut self, participant: ParticipantSpec) -> Self {
        self.participants.push(participant);
        self
    }

    /// Add agents by id, in order
    pub fn with_agents<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.participants
            .extend(ids.into_iter().map(|id| ParticipantSpec::Agent(crate::types::AgentId::new(id))));
        self
    }

    /// Set the round limit
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    /// Set the completion predicate
    pub fn until(mut self, predicate: CompletionPredicate) -> Self {
        self.completion_predicate = predicate;
        self
    }
}

/// A named, ordered list of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    /// Scenario identifier
    pub id: String,
    /// Human-readable summary
    #[serde(default)]
    pub description: String,
    /// Steps, run in order
    pub steps: Vec<ScenarioStep>,
}

impl ScenarioDefinition {
    /// Create an empty scenario
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            steps: Vec::new(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a step
    pub fn with_step(mut self, step: ScenarioStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Load a scenario from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let scenario: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Scenario(format!("Failed to parse YAML: {}", e)))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load a scenario from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Scenario(format!("Failed to read file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Serialize to YAML. Fails on steps with custom predicates.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Scenario(format!("Failed to write YAML: {}", e)))
    }

    /// Check structural rules that do not depend on the registry
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::scenario("scenario id is empty"));
        }
        if self.steps.is_empty() {
            return Err(Error::scenario(format!("scenario `{}` has no steps", self.id)));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.step_id.as_str().trim().is_empty() {
                return Err(Error::scenario("step id is empty"));
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(Error::scenario(format!("duplicate step `{}`", step.step_id)));
            }
            if step.participants.is_empty() {
                return Err(Error::scenario(format!("step `{}` has no participants", step.step_id)));
            }
            if step.max_rounds == Some(0) {
                return Err(Error::scenario(format!("step `{}` has max_rounds 0", step.step_id)));
            }
        }
        Ok(())
    }
}

/// Bundled scenario templates
pub mod presets {
    use super::ScenarioDefinition;
    use crate::error::{Error, Result};

    const RATE_DECISION: &str = include_str!("../../templates/rate_decision.yaml");
    const IPO: &str = include_str!("../../templates/ipo.yaml");
    const RISK_EVENT: &str = include_str!("../../templates/risk_event.yaml");

    /// Names of the bundled templates
    pub const NAMES: [&str; 3] = ["rate_decision", "ipo", "risk_event"];

    /// Load a bundled template by name
    pub fn load(name: &str) -> Result<ScenarioDefinition> {
        let yaml = match name {
            "rate_decision" => RATE_DECISION,
            "ipo" => IPO,
            "risk_event" => RISK_EVENT,
            other => {
                return Err(Error::scenario(format!(
                    "unknown preset `{}` (available: {})",
                    other,
                    NAMES.join(", ")
                )))
            }
        };
        ScenarioDefinition::from_yaml(yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_parse_scenario_yaml() {
        let yaml = r#"
id: mini
steps:
  - step_id: decide
    participants: [central_bank, "role:institution"]
    opening_context: Inflation is above target.
    max_rounds: 2
    until:
      state_changed:
        key: interest_rate
"#;
        let scenario = ScenarioDefinition::from_yaml(yaml).unwrap();
        let step = &scenario.steps[0];
        assert_eq!(step.step_id.as_str(), "decide");
        assert_eq!(step.participants[1], ParticipantSpec::Role(Role::Institution));
        assert_eq!(step.max_rounds, Some(2));
        assert!(matches!(step.completion_predicate, CompletionPredicate::StateChanged { .. }));
    }

    #[test]
    fn test_validation_errors() {
        let no_steps = ScenarioDefinition::new("x");
        assert!(no_steps.validate().is_err());

        let dup = ScenarioDefinition::new("x")
            .with_step(ScenarioStep::new("a", "").with_agents(["p"]))
            .with_step(ScenarioStep::new("a", "").with_agents(["p"]));
        assert!(dup.validate().is_err());

        let empty = ScenarioDefinition::new("x").with_step(ScenarioStep::new("a", ""));
        assert!(empty.validate().is_err());

        let zero = ScenarioDefinition::new("x").with_step(ScenarioStep::new("a", "").with_agents(["p"]).with_max_rounds(0));
        assert!(zero.validate().is_err());

        assert!(ScenarioDefinition::from_yaml("id: x\nsteps: []").is_err());
    }

    #[test]
    fn test_presets_load() {
        for name in presets::NAMES {
            let scenario = presets::load(name).unwrap();
            assert_eq!(scenario.id, name);
            assert!(!scenario.steps.is_empty());
        }
        let rate = presets::load("rate_decision").unwrap();
        assert!(matches!(rate.steps[0].completion_predicate, CompletionPredicate::Never));
        assert!(matches!(rate.steps[1].completion_predicate, CompletionPredicate::StateChanged { .. }));
        assert!(matches!(rate.steps[2].completion_predicate, CompletionPredicate::AnyOf(_)));
        assert!(presets::load("bank_run").is_err());
    }

    #[test]
    fn test_yaml_roundtrip_of_builder_scenario() {
        let scenario = ScenarioDefinition::new("built")
            .with_step(ScenarioStep::new("s1", "open").with_agents(["a", "b"]).until(CompletionPredicate::Always))
            .with_step(ScenarioStep::new("s2", "react").with_agents(["b"]).until(CompletionPredicate::AnyOf(vec![
                CompletionPredicate::state_changed("interest_rate"),
                CompletionPredicate::AgentTurnsAtLeast { count: 4 },
            ])));
        let yaml = scenario.to_yaml().unwrap();
        assert!(yaml.contains("any_of:"));
        assert!(!yaml.contains('!'));

        let parsed = ScenarioDefinition::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.steps[0].participants.len(), 2);
        assert!(matches!(parsed.steps[0].completion_predicate, CompletionPredicate::Always));
        match &parsed.steps[1].completion_predicate {
            CompletionPredicate::AnyOf(inner) => {
                assert!(matches!(&inner[0], CompletionPredicate::StateChanged { key } if key == "interest_rate"));
                assert!(matches!(&inner[1], CompletionPredicate::AgentTurnsAtLeast { count: 4 }));
            }
            other => panic!("unexpected predicate: {:?}", other),
        }
    }
}
