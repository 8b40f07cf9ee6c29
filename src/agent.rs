//! Agent handles, the `act` capability, and reply parsing
//!
//! The orchestrator never looks inside an agent. It hands over an
//! [`AgentContext`], awaits an [`AgentReply`], and turns that reply into an
//! utterance. How the reply is produced (rules, a remote model, a script) is
//! the agent implementation's business.

use crate::error::{Error, Result};
use crate::state::{StateDelta, StateSnapshot, StateValue};
use crate::transcript::Utterance;
use crate::types::{AgentId, Role, SequenceNo, StepId};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Everything an agent sees when it is asked to act
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Agent being asked
    pub agent_id: AgentId,
    /// Its role
    pub role: Role,
    /// Current step
    pub step_id: StepId,
    /// Current round (1-based)
    pub round_no: u32,
    /// Attempt number for this turn (1-based)
    pub attempt: u32,
    /// The step's opening prompt
    pub opening_context: String,
    /// Recent transcript, oldest first
    pub history: Vec<Utterance>,
    /// Market state when the turn started
    pub state: StateSnapshot,
}

/// What an agent hands back from `act`
#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    /// Already structured reply
    Message {
        /// Text of the utterance
        content: String,
        /// Proposed state change
        proposed_state_delta: Option<StateDelta>,
        /// Earlier utterance by the same agent that this one corrects
        corrects: Option<SequenceNo>,
    },
    /// Free text, parsed for `STATE_DELTA:` and `CORRECTS:` directive lines
    Raw(String),
}

impl AgentReply {
    /// Plain message
    pub fn say(content: impl Into<String>) -> Self {
        Self::Message {
            content: content.into(),
            proposed_state_delta: None,
            corrects: None,
        }
    }

    /// Free text reply
    pub fn raw(text: impl Into<String>) -> Self {
        Self::Raw(text.into())
    }

    /// Add one key to the proposed delta. No-op on raw replies.
    pub fn with_delta(mut self, key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        if let Self::Message {
            proposed_state_delta,
            ..
        } = &mut self
        {
            proposed_state_delta
                .get_or_insert_with(StateDelta::new)
                .insert(key.into(), value.into());
        }
        self
    }

    /// Mark the reply as a correction of an earlier utterance. No-op on raw replies.
    pub fn correcting(mut self, sequence_no: SequenceNo) -> Self {
        if let Self::Message { corrects, .. } = &mut self {
            *corrects = Some(sequence_no);
        }
        self
    }

    /// Validate the reply shape and extract its parts
    pub fn parse(self, agent: &AgentId, max_content_chars: usize) -> Result<ParsedReply> {
        let parsed = match self {
            Self::Message {
                content,
                proposed_state_delta,
                corrects,
            } => ParsedReply {
                content: content.trim().to_string(),
                proposed_state_delta,
                corrects,
            },
            Self::Raw(text) => parse_raw(agent, &text)?,
        };

        if parsed.content.is_empty() {
            return Err(Error::malformed(agent.clone(), "reply has no content"));
        }
        let chars = parsed.content.chars().count();
        if chars > max_content_chars {
            return Err(Error::malformed(
                agent.clone(),
                format!("reply is {} chars, limit is {}", chars, max_content_chars),
            ));
        }
        if matches!(&parsed.proposed_state_delta, Some(d) if d.is_empty()) {
            return Err(Error::malformed(agent.clone(), "proposed delta is empty"));
        }

        Ok(parsed)
    }
}

/// Reply after shape validation
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    /// Utterance text
    pub content: String,
    /// Proposed state change
    pub proposed_state_delta: Option<StateDelta>,
    /// Corrected utterance
    pub corrects: Option<SequenceNo>,
}

fn delta_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*STATE_DELTA:\s*(.*?)\s*$").expect("static regex"))
}

fn corrects_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*CORRECTS:\s*#?(\S*)\s*$").expect("static regex"))
}

fn parse_raw(agent: &AgentId, text: &str) -> Result<ParsedReply> {
    let mut content = Vec::new();
    let mut proposed_state_delta = None;
    let mut corrects = None;

    for line in text.lines() {
        if let Some(caps) = delta_line().captures(line) {
            if proposed_state_delta.is_some() {
                return Err(Error::malformed(agent.clone(), "more than one STATE_DELTA line"));
            }
            let delta: StateDelta = serde_json::from_str(&caps[1])
                .map_err(|e| Error::malformed(agent.clone(), format!("invalid STATE_DELTA: {}", e)))?;
            proposed_state_delta = Some(delta);
        } else if let Some(caps) = corrects_line().captures(line) {
            let seq = caps[1]
                .parse::<SequenceNo>()
                .map_err(|_| Error::malformed(agent.clone(), format!("invalid CORRECTS target `{}`", &caps[1])))?;
            corrects = Some(seq);
        } else {
            content.push(line);
        }
    }

    Ok(ParsedReply {
        content: content.join("\n").trim().to_string(),
        proposed_state_delta,
        corrects,
    })
}

/// The single capability the orchestrator calls into
#[async_trait]
pub trait MarketAgent: Send + Sync {
    /// Produce this agent's contribution for the current turn
    async fn act(&self, ctx: &AgentContext) -> Result<AgentReply>;

    /// Implementation name for logging
    fn kind(&self) -> &str {
        "custom"
    }
}

/// Typed reference to one participant
#[derive(Clone)]
pub struct AgentHandle {
    /// Unique id
    pub id: AgentId,
    /// Role category
    pub role: Role,
    /// Capability tags
    pub capabilities: BTreeSet<String>,
    agent: Arc<dyn MarketAgent>,
}

impl AgentHandle {
    /// Create a handle
    pub fn new(id: impl Into<AgentId>, role: Role, agent: Arc<dyn MarketAgent>) -> Self {
        Self {
            id: id.into(),
            role,
            capabilities: BTreeSet::new(),
            agent,
        }
    }

    /// Add a capability tag
    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }

    /// Add several capability tags
    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Whether the agent carries `tag`
    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }

    /// Invoke the agent
    pub async fn act(&self, ctx: &AgentContext) -> Result<AgentReply> {
        self.agent.act(ctx).await
    }

    /// Implementation name of the wrapped agent
    pub fn kind(&self) -> &str {
        self.agent.kind()
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("capabilities", &self.capabilities)
            .field("kind", &self.agent.kind())
            .finish()
    }
}

/// How a scenario step names its participants
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ParticipantSpec {
    /// A specific agent
    Agent(AgentId),
    /// Every agent with this role, in registration order
    Role(Role),
    /// Every agent carrying this capability tag, in registration order
    Capability(String),
}

impl FromStr for ParticipantSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(role) = s.strip_prefix("role:") {
            return Ok(Self::Role(role.parse()?));
        }
        if let Some(tag) = s.strip_prefix("capability:").or_else(|| s.strip_prefix("cap:")) {
            let tag = tag.trim();
            if tag.is_empty() {
                return Err("empty capability filter".to_string());
            }
            return Ok(Self::Capability(tag.to_string()));
        }
        if s.is_empty() {
            return Err("empty participant".to_string());
        }
        Ok(Self::Agent(AgentId::new(s)))
    }
}

impl TryFrom<String> for ParticipantSpec {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ParticipantSpec> for String {
    fn from(spec: ParticipantSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for ParticipantSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "{}", id),
            Self::Role(role) => write!(f, "role:{}", role),
            Self::Capability(tag) => write!(f, "capability:{}", tag),
        }
    }
}

/// Registered agents, in registration order
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    handles: Vec<AgentHandle>,
    index: HashMap<AgentId, usize>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent; ids must be unique and may not shadow the system speaker
    pub fn register(&mut self, handle: AgentHandle) -> Result<()> {
        if handle.id.as_str() == AgentId::SYSTEM {
            return Err(Error::config("agent id `system` is reserved"));
        }
        if self.index.contains_key(&handle.id) {
            return Err(Error::config(format!("agent `{}` registered twice", handle.id)));
        }
        self.index.insert(handle.id.clone(), self.handles.len());
        self.handles.push(handle);
        Ok(())
    }

    /// Look up an agent
    pub fn get(&self, id: &AgentId) -> Option<&AgentHandle> {
        self.index.get(id).map(|&i| &self.handles[i])
    }

    /// All agents in registration order
    pub fn iter(&self) -> impl Iterator<Item = &AgentHandle> {
        self.handles.iter()
    }

    /// Number of agents
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no agent is registered
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Resolve a step's participant list into ordered, de-duplicated handles
    pub fn resolve(&self, step_id: &StepId, specs: &[ParticipantSpec]) -> Result<Vec<AgentHandle>> {
        let mut seen = BTreeSet::new();
        let mut resolved = Vec::new();

        for spec in specs {
            let matched: Vec<&AgentHandle> = match spec {
                ParticipantSpec::Agent(id) => {
                    let handle = self.get(id).ok_or_else(|| {
                        Error::step_unrecoverable(step_id.clone(), format!("unknown agent `{}`", id))
                    })?;
                    vec![handle]
                }
                ParticipantSpec::Role(role) => self.handles.iter().filter(|h| h.role == *role).collect(),
                ParticipantSpec::Capability(tag) => {
                    self.handles.iter().filter(|h| h.has_capability(tag)).collect()
                }
            };

            if matched.is_empty() {
                tracing::warn!(step = %step_id, filter = %spec, "Participant filter matched no agents");
            }
            for handle in matched {
                if seen.insert(handle.id.clone()) {
                    resolved.push(handle.clone());
                }
            }
        }

        if resolved.is_empty() {
            return Err(Error::step_unrecoverable(
                step_id.clone(),
                "no participants resolved",
            ));
        }
        Ok(resolved)
    }
}

/// One scripted behaviour of a [`ScriptedAgent`]
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Return this reply
    Reply(AgentReply),
    /// Sleep, then return the reply (exercises turn deadlines)
    Delayed(Duration, AgentReply),
    /// Fail with a malformed-output error
    Malformed(String),
    /// Fail with a transient agent error
    Fail(String),
    /// Fail as permanently unreachable
    Unavailable(String),
}

/// Agent that plays a fixed script; the last step repeats once the script runs out
#[derive(Debug)]
pub struct ScriptedAgent {
    script: Vec<ScriptStep>,
    cursor: Mutex<usize>,
}

impl ScriptedAgent {
    /// Create a scripted agent. An empty script behaves as a single malformed step.
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            cursor: Mutex::new(0),
        }
    }

    /// Agent that always says `content`
    pub fn repeating(content: impl Into<String>) -> Self {
        Self::new(vec![ScriptStep::Reply(AgentReply::say(content))])
    }

    /// Agent that plays the given replies in order
    pub fn replies(replies: impl IntoIterator<Item = AgentReply>) -> Self {
        Self::new(replies.into_iter().map(ScriptStep::Reply).collect())
    }

    /// Number of times `act` has been called
    pub fn calls(&self) -> usize {
        *self.cursor.lock()
    }

    fn next_step(&self) -> ScriptStep {
        let mut cursor = self.cursor.lock();
        let step = self
            .script
            .get(*cursor)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or_else(|| ScriptStep::Malformed("empty script".to_string()));
        *cursor += 1;
        step
    }
}

#[async_trait]
impl MarketAgent for ScriptedAgent {
    async fn act(&self, ctx: &AgentContext) -> Result<AgentReply> {
        match self.next_step() {
            ScriptStep::Reply(reply) => Ok(reply),
            ScriptStep::Delayed(delay, reply) => {
                tokio::time::sleep(delay).await;
                Ok(reply)
            }
            ScriptStep::Malformed(reason) => Err(Error::malformed(ctx.agent_id.clone(), reason)),
            ScriptStep::Fail(reason) => Err(Error::agent(reason)),
            ScriptStep::Unavailable(reason) => Err(Error::unavailable(ctx.agent_id.clone(), reason)),
        }
    }

    fn kind(&self) -> &str {
        "scripted"
    }
}

/// Agent backed by a synchronous closure over the context
pub struct FnAgent<F> {
    func: F,
}

impl<F> FnAgent<F>
where
    F: Fn(&AgentContext) -> Result<AgentReply> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> MarketAgent for FnAgent<F>
where
    F: Fn(&AgentContext) -> Result<AgentReply> + Send + Sync,
{
    async fn act(&self, ctx: &AgentContext) -> Result<AgentReply> {
        (self.func)(ctx)
    }

    fn kind(&self) -> &str {
        "fn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, role: Role) -> AgentHandle {
        AgentHandle::new(id, role, Arc::new(ScriptedAgent::repeating("ok")))
    }

    fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry
            .register(agent("central_bank", Role::Regulator).with_capability("rate_setting"))
            .unwrap();
        registry.register(agent("commercial_bank", Role::Institution)).unwrap();
        registry.register(agent("securities_regulator", Role::Regulator)).unwrap();
        registry
            .register(agent("exchange", Role::Infrastructure).with_capabilities(["listing", "trading"]))
            .unwrap();
        registry
    }

    fn ids(handles: &[AgentHandle]) -> Vec<&str> {
        handles.iter().map(|h| h.id.as_str()).collect()
    }

    #[test]
    fn test_participant_spec_parsing() {
        assert_eq!(
            "role:regulator".parse::<ParticipantSpec>().unwrap(),
            ParticipantSpec::Role(Role::Regulator)
        );
        assert_eq!(
            "capability:listing".parse::<ParticipantSpec>().unwrap(),
            ParticipantSpec::Capability("listing".into())
        );
        assert_eq!(
            "exchange".parse::<ParticipantSpec>().unwrap(),
            ParticipantSpec::Agent(AgentId::new("exchange"))
        );
        assert!("role:pirate".parse::<ParticipantSpec>().is_err());
        assert!("cap:".parse::<ParticipantSpec>().is_err());
    }

    #[test]
    fn test_resolve_preserves_order_and_dedupes() {
        let registry = registry();
        let step = StepId::new("s");
        let specs = vec![
            ParticipantSpec::Agent(AgentId::new("exchange")),
            ParticipantSpec::Role(Role::Regulator),
            ParticipantSpec::Capability("rate_setting".into()),
        ];
        let resolved = registry.resolve(&step, &specs).unwrap();
        assert_eq!(ids(&resolved), vec!["exchange", "central_bank", "securities_regulator"]);
    }

    #[test]
    fn test_resolve_failures() {
        let registry = registry();
        let step = StepId::new("s");

        let err = registry
            .resolve(&step, &[ParticipantSpec::Role(Role::International)])
            .unwrap_err();
        assert!(matches!(err, Error::StepUnrecoverable { .. }));

        let err = registry
            .resolve(&step, &[ParticipantSpec::Agent(AgentId::new("ghost"))])
            .unwrap_err();
        assert!(matches!(err, Error::StepUnrecoverable { .. }));
    }

    #[test]
    fn test_register_rejects_duplicates_and_system() {
        let mut registry = registry();
        assert!(registry.register(agent("exchange", Role::Participant)).is_err());
        assert!(registry.register(agent("system", Role::Participant)).is_err());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_parse_structured_reply() {
        let id = AgentId::new("cb");
        let parsed = AgentReply::say("  Raising rates  ")
            .with_delta("rate", 0.05)
            .parse(&id, 100)
            .unwrap();
        assert_eq!(parsed.content, "Raising rates");
        assert_eq!(
            parsed.proposed_state_delta.unwrap().get("rate"),
            Some(&StateValue::Number(0.05))
        );
    }

    #[test]
    fn test_parse_raw_reply_with_directives() {
        let id = AgentId::new("cb");
        let text = "We hike by 25bp.\nSTATE_DELTA: {\"interest_rate\": 0.0225, \"trading_halted\": false}\nCORRECTS: #4";
        let parsed = AgentReply::raw(text).parse(&id, 1000).unwrap();
        assert_eq!(parsed.content, "We hike by 25bp.");
        assert_eq!(parsed.corrects, Some(4));
        let delta = parsed.proposed_state_delta.unwrap();
        assert_eq!(delta.get("trading_halted"), Some(&StateValue::Flag(false)));
    }

    #[test]
    fn test_parse_rejects_malformed_replies() {
        let id = AgentId::new("cb");
        let malformed = |reply: AgentReply| {
            matches!(reply.parse(&id, 20), Err(Error::AgentMalformedOutput { .. }))
        };
        assert!(malformed(AgentReply::say("   ")));
        assert!(malformed(AgentReply::raw("STATE_DELTA: {\"rate\": 0.1}")));
        assert!(malformed(AgentReply::raw("hello\nSTATE_DELTA: not json")));
        assert!(malformed(AgentReply::raw("hello\nSTATE_DELTA: [1, 2]")));
        assert!(malformed(AgentReply::raw("hello\nCORRECTS: last")));
        assert!(malformed(AgentReply::say("this reply is far too long for the limit")));
        assert!(malformed(AgentReply::Message {
            content: "x".into(),
            proposed_state_delta: Some(StateDelta::new()),
            corrects: None,
        }));
    }

    #[tokio::test]
    async fn test_scripted_agent_repeats_last_step() {
        let scripted = Arc::new(ScriptedAgent::replies([AgentReply::say("one"), AgentReply::say("two")]));
        let handle = AgentHandle::new("a", Role::Participant, scripted.clone());
        let ctx = AgentContext {
            agent_id: handle.id.clone(),
            role: handle.role,
            step_id: StepId::new("s"),
            round_no: 1,
            attempt: 1,
            opening_context: String::new(),
            history: Vec::new(),
            state: StateSnapshot {
                version: 0,
                values: Default::default(),
            },
        };
        assert_eq!(handle.act(&ctx).await.unwrap(), AgentReply::say("one"));
        assert_eq!(handle.act(&ctx).await.unwrap(), AgentReply::say("two"));
        assert_eq!(handle.act(&ctx).await.unwrap(), AgentReply::say("two"));
        assert_eq!(scripted.calls(), 3);
    }
}
