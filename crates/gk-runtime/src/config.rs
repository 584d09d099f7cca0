// config.rs - Engine configuration.
//
// EngineConfig is the single structured object an operator supplies: the
// policy set (inline or in its own YAML file), the retry policy, the
// approval TTL, and where to persist the trace. It is read from YAML or
// TOML depending on the file extension.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gk_policy::{PolicySet, PolicyStore};
use gk_trace::{JsonlSink, TraceRecorder};
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::interceptor::{Interceptor, DEFAULT_APPROVAL_TTL};
use crate::retry::RetryPolicy;

fn default_approval_ttl_secs() -> u64 {
    DEFAULT_APPROVAL_TTL.as_secs()
}

/// Everything needed to build an [`Interceptor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Inline policy set. Mutually exclusive with `policy_file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicySet>,

    /// YAML policy file, resolved relative to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_file: Option<PathBuf>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "default_approval_ttl_secs")]
    pub approval_ttl_secs: u64,

    /// Append-only JSONL trace file. In-memory only when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: None,
            policy_file: None,
            retry: RetryPolicy::default(),
            approval_ttl_secs: default_approval_ttl_secs(),
            trace_path: None,
        }
    }
}

impl EngineConfig {
    /// Load a config file. `.yaml`/`.yml` parse as YAML, `.toml` as TOML.
    /// A relative `policy_file` is resolved against the config's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| RuntimeError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let mut config = match extension.as_deref() {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            _ => return Err(RuntimeError::UnsupportedFormat(path.to_path_buf())),
        }
        .map_err(|e| match e {
            RuntimeError::ConfigParse { reason, .. } => RuntimeError::ConfigParse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;

        if let (Some(file), Some(dir)) = (config.policy_file.as_mut(), path.parent()) {
            if file.is_relative() {
                *file = dir.join(&*file);
            }
        }
        tracing::debug!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, RuntimeError> {
        serde_yaml::from_str(content).map_err(|e| RuntimeError::ConfigParse {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RuntimeError> {
        toml::from_str(content).map_err(|e| RuntimeError::ConfigParse {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })
    }

    pub fn approval_ttl(&self) -> Duration {
        Duration::from_secs(self.approval_ttl_secs)
    }

    /// The configured policy set, validated. A config with no policy at all
    /// yields an empty deny-all set.
    pub fn policy_set(&self) -> Result<PolicySet, RuntimeError> {
        let set = match (&self.policy, &self.policy_file) {
            (Some(_), Some(_)) => {
                return Err(RuntimeError::ConfigParse {
                    path: PathBuf::from("<config>"),
                    reason: "set either `policy` or `policy_file`, not both".into(),
                })
            }
            (Some(inline), None) => inline.clone(),
            (None, Some(file)) => PolicySet::load(file)?,
            (None, None) => PolicySet::deny_all("default"),
        };
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.retry.validate()?;
        if self.approval_ttl_secs == 0 {
            return Err(RuntimeError::ConfigParse {
                path: PathBuf::from("<config>"),
                reason: "approval_ttl_secs must be positive".into(),
            });
        }
        self.policy_set().map(|_| ())
    }

    /// Build an interceptor wired to this config's policy, retry policy,
    /// TTL and trace. Adapters built on it inherit the retry policy.
    pub fn build_interceptor(&self) -> Result<Interceptor, RuntimeError> {
        self.validate()?;
        let store = Arc::new(PolicyStore::new(self.policy_set()?)?);
        let recorder = match &self.trace_path {
            Some(path) => TraceRecorder::with_sink(JsonlSink::open(path)?),
            None => TraceRecorder::new(),
        };
        Ok(Interceptor::new(store)
            .with_recorder(Arc::new(recorder))
            .with_approval_ttl(self.approval_ttl())
            .with_default_retry(self.retry.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_policy::{DecisionEffect, Effect};
    use tempfile::tempdir;

    const YAML: &str = r#"
policy:
  name: email
  version: 2
  rules:
    - id: email-approval
      priority: 10
      match:
        tool: { exact: send_email }
      effect: { type: require_approval }
retry:
  max_attempts: 4
  initial_backoff_ms: 50
approval_ttl_secs: 60
"#;

    #[test]
    fn yaml_config_parses_with_defaults() {
        let config = EngineConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.approval_ttl(), Duration::from_secs(60));
        let set = config.policy_set().unwrap();
        assert_eq!(set.version, 2);
        assert_eq!(set.default_effect, Effect::Deny);
    }

    #[test]
    fn toml_config_parses() {
        let toml = r#"
approval_ttl_secs = 30

[retry]
max_attempts = 2

[policy]
name = "toml"
default_effect = { type = "allow" }
"#;
        let config = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.policy_set().unwrap().default_effect, Effect::Allow);
    }

    #[test]
    fn load_picks_format_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yml");
        std::fs::write(&path, YAML).unwrap();
        assert!(EngineConfig::load(&path).is_ok());

        let bad = dir.path().join("engine.ini");
        std::fs::write(&bad, YAML).unwrap();
        assert!(matches!(
            EngineConfig::load(&bad),
            Err(RuntimeError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn policy_file_resolves_next_to_config() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("policy.yaml"),
            "name: side\nversion: 5\nrules: []\n",
        )
        .unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "policy_file = \"policy.yaml\"\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.policy_set().unwrap().version, 5);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "retry: [not, a, map]\n").unwrap();
        match EngineConfig::load(&path) {
            Err(RuntimeError::ConfigParse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected ConfigParse, got {:?}", other),
        }
    }

    #[test]
    fn empty_config_denies_everything() {
        let gk = EngineConfig::default().build_interceptor().unwrap();
        let decision = gk
            .evaluate(&gk_policy::Action::builder("anything").build())
            .unwrap();
        assert_eq!(decision.effect, DecisionEffect::Deny);
    }

    #[test]
    fn built_interceptor_carries_configured_retry() {
        let config = EngineConfig::from_yaml_str(YAML).unwrap();
        let gk = config.build_interceptor().unwrap();
        assert_eq!(gk.default_retry(), &config.retry);
        assert_eq!(gk.default_retry().max_attempts, 4);
        assert_eq!(gk.default_retry().initial_backoff_ms, 50);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let config = EngineConfig {
            approval_ttl_secs: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
