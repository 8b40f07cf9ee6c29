//! Policy Rate Decision
//!
//! Runs the bundled `rate_decision` scenario with four rule-based agents:
//! - a central bank that sets the policy rate from inflation
//! - a commercial bank that adjusts lending conditions
//! - an exchange that reports trading conditions
//! - an investor that rebalances and closes the discussion
//!
//! Pass a path as the first argument to write the run as JSON.

use finsim::prelude::*;
use finsim::{init_tracing, TelemetryConfig};
use std::sync::Arc;

const INFLATION_TARGET: f64 = 0.02;

fn central_bank() -> AgentHandle {
    let agent = FnAgent::new(|ctx: &AgentContext| {
        let inflation = ctx.state.number("inflation_rate").unwrap_or(INFLATION_TARGET);
        let rate = ctx.state.number("interest_rate").unwrap_or(0.02);

        if ctx.step_id.as_str() != "decision" {
            return Ok(AgentReply::say(format!(
                "Inflation is {:.2}% against a {:.0}% target with the policy rate at {:.2}%.",
                inflation * 100.0,
                INFLATION_TARGET * 100.0,
                rate * 100.0
            )));
        }

        if inflation > INFLATION_TARGET {
            let change = ((inflation - INFLATION_TARGET) * 0.1).min(0.0025);
            let new_rate = rate + change;
            Ok(AgentReply::say(format!(
                "The committee raises the policy rate by {:.0}bp to {:.2}%.",
                change * 10_000.0,
                new_rate * 100.0
            ))
            .with_delta("interest_rate", new_rate))
        } else {
            Ok(AgentReply::say("The committee holds the policy rate."))
        }
    });
    AgentHandle::new("central_bank", Role::Regulator, Arc::new(agent)).with_capability("rate_setting")
}

fn commercial_bank() -> AgentHandle {
    let agent = FnAgent::new(|ctx: &AgentContext| {
        let liquidity = ctx.state.number("liquidity_factor").unwrap_or(1.0);
        Ok(AgentReply::say("We reprice new loans and tighten credit lines slightly.")
            .with_delta("liquidity_factor", (liquidity - 0.05).max(0.5)))
    });
    AgentHandle::new("commercial_bank", Role::Institution, Arc::new(agent)).with_capability("lending")
}

fn exchange() -> AgentHandle {
    let agent = FnAgent::new(|ctx: &AgentContext| {
        let volatility = ctx.state.number("market_volatility").unwrap_or(0.15);
        Ok(AgentReply::say(format!(
            "Order books are orderly; realized volatility at {:.1}%.",
            (volatility + 0.01) * 100.0
        ))
        .with_delta("market_volatility", volatility + 0.01))
    });
    AgentHandle::new("exchange", Role::Infrastructure, Arc::new(agent)).with_capabilities(["listing", "trading"])
}

fn investor() -> AgentHandle {
    let agent = FnAgent::new(|ctx: &AgentContext| {
        let sentiment = ctx.state.number("market_sentiment").unwrap_or(0.0);
        Ok(AgentReply::say("We shorten duration and trim equities. TERMINATE")
            .with_delta("market_sentiment", (sentiment - 0.1).max(-1.0)))
    });
    AgentHandle::new("investor", Role::Participant, Arc::new(agent))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&TelemetryConfig::default())?;

    let config = OrchestratorConfig::load(None)?;
    let orchestrator = Orchestrator::builder()
        .agent(central_bank())
        .agent(commercial_bank())
        .agent(exchange())
        .agent(investor())
        .config(config)
        .build()?;

    let scenario = presets::load("rate_decision")?;
    println!("\n{}", "=".repeat(72));
    println!("  {}: {}", scenario.id, scenario.description);
    println!("{}\n", "=".repeat(72));

    let result = orchestrator.run(&scenario).await?;

    for u in result.transcript.iter().filter(|u| !u.kind.is_bookkeeping()) {
        println!("#{:<3} [{} r{}] {}: {}", u.sequence_no, u.step_id, u.round_no, u.speaker_id, u.content);
    }

    println!("\nStatus: {:?} in {} ms", result.status, result.total_time_ms);
    for step in &result.steps {
        println!(
            "  {:<16} {:?} after {} round(s), {} turn(s), {} not run",
            step.step_id.as_str(), step.completion, step.rounds_run, step.turns_taken, step.not_run
        );
    }
    println!("\nFinal state (version {}):", result.final_state.version);
    for (key, value) in &result.final_state.values {
        println!("  {:<20} {}", key, value);
    }

    if let Some(path) = std::env::args().nth(1) {
        result.write_json(&path)?;
        println!("\nRun written to {}", path);
    }

    Ok(())
}
