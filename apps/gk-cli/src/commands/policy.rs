// policy.rs - Policy subcommands: validate, check.

use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Subcommand;
use gk_policy::{explain, Action, EvaluationContext, EvaluationTrace, PolicySet};
use serde_json::Value;

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Parse and validate a YAML policy file.
    Validate {
        /// Path to the policy file.
        file: PathBuf,
    },
    /// Dry-run a decision for one action and explain which rules matched.
    ///
    /// Rate-limit rules are evaluated without consuming any budget.
    Check {
        /// Path to the policy file.
        file: PathBuf,
        /// Tool name of the action.
        #[arg(long)]
        tool: String,
        /// Target resource (URI-like string).
        #[arg(long)]
        resource: Option<String>,
        /// Caller identity.
        #[arg(long)]
        caller: Option<String>,
        /// Parameter as key=value. Values that parse as JSON are used as
        /// JSON, anything else as a string. Repeatable.
        #[arg(long = "param")]
        params: Vec<String>,
    },
}

pub fn execute(cmd: &PolicyCommands) -> anyhow::Result<()> {
    match cmd {
        PolicyCommands::Validate { file } => {
            let set = PolicySet::load(file)
                .with_context(|| format!("policy file {} is invalid", file.display()))?;
            println!(
                "Policy '{}' is valid: {} rule(s), default {:?}.",
                set.name,
                set.rules.len(),
                set.default_effect
            );
        }

        PolicyCommands::Check {
            file,
            tool,
            resource,
            caller,
            params,
        } => {
            let set = PolicySet::load(file)
                .with_context(|| format!("failed to load policy file {}", file.display()))?;
            let action = build_action(tool, resource.as_deref(), caller.as_deref(), params)?;
            tracing::debug!(action_id = %action.action_id(), tool = %tool, "dry-run evaluation");
            let trace = explain(&action, &set, &EvaluationContext::unmetered(Utc::now()))
                .context("policy evaluation failed")?;
            print!("{}", render_trace(&trace));
        }
    }

    Ok(())
}

fn parse_param(raw: &str) -> anyhow::Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("parameter '{}' is not in key=value form", raw);
    };
    if key.is_empty() {
        bail!("parameter '{}' has an empty key", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn build_action(
    tool: &str,
    resource: Option<&str>,
    caller: Option<&str>,
    params: &[String],
) -> anyhow::Result<Action> {
    let mut builder = Action::builder(tool);
    if let Some(resource) = resource {
        builder = builder.resource(resource);
    }
    if let Some(caller) = caller {
        builder = builder.caller(caller);
    }
    for raw in params {
        let (key, value) = parse_param(raw)?;
        builder = builder.parameter(key, value);
    }
    Ok(builder.build())
}

fn render_trace(trace: &EvaluationTrace) -> String {
    let decision = &trace.decision;
    let mut out = format!(
        "Decision: {}\nRule:     {}\nReason:   {}\nChecked {} rule(s), {} matched.\n",
        decision.effect,
        decision.matched_rule_id.as_deref().unwrap_or("(default)"),
        decision.reason,
        trace.rules_checked,
        trace.candidates.len(),
    );
    if let Some(limit) = &decision.rate_limit {
        out.push_str(&format!(
            "Rate limit: {}/{} in {}s for caller '{}'\n",
            limit.observed, limit.limit, limit.window_secs, limit.key.caller_identity
        ));
    }
    if !trace.candidates.is_empty() {
        out.push_str(&format!(
            "\n{:<32} {:>8} {:>12} {:>6}\n",
            "RULE", "PRIORITY", "SPECIFICITY", "INDEX"
        ));
        out.push_str(&format!("{}\n", "-".repeat(61)));
        for c in &trace.candidates {
            out.push_str(&format!(
                "{:<32} {:>8} {:>12} {:>6}\n",
                c.rule_id, c.priority, c.specificity, c.index
            ));
        }
    }
    out
}
