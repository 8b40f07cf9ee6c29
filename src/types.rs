//! Core type definitions for the FinSim orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Position of an event in a run's transcript. Starts at 1.
pub type SequenceNo = u64;

/// Number of deltas applied to a market state since initialization
pub type StateVersion = u64;

/// Unique identifier for an agent
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Speaker id used for synthetic orchestrator utterances
    pub const SYSTEM: &'static str = "system";

    /// Create a new agent ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The speaker id of synthetic utterances
    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of a scenario step
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Create a new step ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Unique identifier for a scenario run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random run ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role category of a market entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Central banks, supervisors, treasuries
    #[serde(alias = "regulatory")]
    Regulator,
    /// Banks, funds, asset managers
    #[serde(alias = "financial_institution")]
    Institution,
    /// Exchanges, clearing houses, payment systems
    Infrastructure,
    /// Rating agencies, auditors, law firms
    #[serde(alias = "service")]
    Auxiliary,
    /// Corporations, investors, market makers
    Participant,
    /// IMF, World Bank, BIS
    International,
}

impl Role {
    /// All roles in declaration order
    pub const ALL: [Role; 6] = [
        Role::Regulator,
        Role::Institution,
        Role::Infrastructure,
        Role::Auxiliary,
        Role::Participant,
        Role::International,
    ];

    /// Canonical snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Regulator => "regulator",
            Role::Institution => "institution",
            Role::Infrastructure => "infrastructure",
            Role::Auxiliary => "auxiliary",
            Role::Participant => "participant",
            Role::International => "international",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regulator" | "regulatory" => Ok(Role::Regulator),
            "institution" | "financial_institution" => Ok(Role::Institution),
            "infrastructure" => Ok(Role::Infrastructure),
            "auxiliary" | "service" => Ok(Role::Auxiliary),
            "participant" => Ok(Role::Participant),
            "international" => Ok(Role::International),
            other => Err(format!(
                "unknown role `{}` (expected one of: {})",
                other,
                Role::ALL.map(|r| r.as_str()).join(", ")
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing_accepts_legacy_names() {
        assert_eq!("regulatory".parse::<Role>().unwrap(), Role::Regulator);
        assert_eq!("Service".parse::<Role>().unwrap(), Role::Auxiliary);
        assert_eq!("financial_institution".parse::<Role>().unwrap(), Role::Institution);
        let err = "hedge".parse::<Role>().unwrap_err();
        assert!(err.contains("regulator, institution"));
        assert!(err.ends_with("international"));
    }

    #[test]
    fn test_role_serde_aliases() {
        let role: Role = serde_json::from_str("\"regulatory\"").unwrap();
        assert_eq!(role, Role::Regulator);
        assert_eq!(serde_json::to_string(&Role::Auxiliary).unwrap(), "\"auxiliary\"");
    }

    #[test]
    fn test_agent_id_is_transparent() {
        let id = AgentId::new("central_bank");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"central_bank\"");
        assert_eq!(id.to_string(), "central_bank");
    }
}
