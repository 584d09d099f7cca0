// config.rs - Config subcommands: validate.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Subcommand;
use gk_runtime::EngineConfig;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Load an engine config (YAML or TOML) and its policy, and check both.
    Validate {
        /// Path to the config file.
        file: PathBuf,
    },
}

pub fn execute(cmd: &ConfigCommands) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Validate { file } => println!("{}", summarize(file)?),
    }
    Ok(())
}

fn summarize(file: &Path) -> anyhow::Result<String> {
    let config = EngineConfig::load(file)
        .with_context(|| format!("failed to load config {}", file.display()))?;
    config
        .validate()
        .with_context(|| format!("config {} is invalid", file.display()))?;
    let set = config.policy_set()?;

    let trace = config
        .trace_path
        .as_ref()
        .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string());
    Ok(format!(
        "Config valid: policy '{}' v{} ({} rule(s)), {} attempt(s) at {} ms each, approval TTL {}s, trace {}.",
        set.name,
        set.version,
        set.rules.len(),
        config.retry.max_attempts,
        config.retry.attempt_timeout_ms,
        config.approval_ttl_secs,
        trace
    ))
}
