//! Adapter from a text-completion backend to a [`MarketAgent`]
//!
//! Model-backed agents (a hosted LLM, a local inference server) only need to
//! implement [`CompletionBackend`]. [`CompletionAgent`] renders the turn
//! context into a prompt and returns the raw completion for reply parsing.

use crate::agent::{AgentContext, AgentReply, MarketAgent};
use crate::error::Result;
use crate::transcript::UtteranceKind;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;

/// Unified trait for text-completion services
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Complete `prompt` under `system_prompt`
    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String>;

    /// Backend name for debugging/logging
    fn backend_type(&self) -> &str;
}

/// Agent that asks a completion backend for every turn
pub struct CompletionAgent {
    system_prompt: String,
    backend: Arc<dyn CompletionBackend>,
}

impl CompletionAgent {
    /// Create a completion agent
    pub fn new(system_prompt: impl Into<String>, backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            backend,
        }
    }

    /// Render the turn context as a prompt
    pub fn render_prompt(ctx: &AgentContext) -> String {
        let mut prompt = String::new();
        let _ = writeln!(
            prompt,
            "You are `{}` ({}). Step `{}`, round {}.",
            ctx.agent_id, ctx.role, ctx.step_id, ctx.round_no
        );
        let _ = writeln!(prompt, "\n## Situation\n{}", ctx.opening_context.trim());

        let _ = writeln!(prompt, "\n## Market state (version {})", ctx.state.version);
        for (key, value) in &ctx.state.values {
            let _ = writeln!(prompt, "- {}: {}", key, value);
        }

        if !ctx.history.is_empty() {
            let _ = writeln!(prompt, "\n## Recent transcript");
            for u in &ctx.history {
                let tag = match &u.kind {
                    UtteranceKind::System => "system",
                    UtteranceKind::StateChange { .. } => "state",
                    UtteranceKind::DeltaRejected { .. } => "rejected",
                    UtteranceKind::Correction { .. } => "correction",
                    _ => "said",
                };
                let _ = writeln!(prompt, "[#{} {} {}] {}", u.sequence_no, u.speaker_id, tag, u.content);
            }
        }

        let _ = writeln!(
            prompt,
            "\n## Instructions\nReply with your statement. To propose a market state change, add one line \
             `STATE_DELTA: {{\"key\": value}}`. To correct one of your earlier statements, add `CORRECTS: <number>`."
        );
        prompt
    }
}

#[async_trait]
impl MarketAgent for CompletionAgent {
    async fn act(&self, ctx: &AgentContext) -> Result<AgentReply> {
        let prompt = Self::render_prompt(ctx);
        tracing::debug!(
            agent = %ctx.agent_id,
            backend = self.backend.backend_type(),
            prompt_chars = prompt.len(),
            "Requesting completion"
        );
        let text = self.backend.complete(&self.system_prompt, &prompt).await?;
        Ok(AgentReply::raw(text))
    }

    fn kind(&self) -> &str {
        "completion"
    }
}
