// policy_set.rs - An ordered, versioned collection of rules.
//
// Rule order matters: when two matching rules tie on priority and
// specificity, the one listed first wins. The default effect applies when
// nothing matches and is Deny unless stated otherwise (fail closed).

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::rule::{Effect, PolicyRule};

fn default_effect() -> Effect {
    Effect::Deny
}

/// The complete policy an evaluation runs against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySet {
    #[serde(default)]
    pub name: String,
    /// Monotonic version; a reload must offer a higher version.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default = "default_effect")]
    pub default_effect: Effect,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: 0,
            rules: Vec::new(),
            default_effect: Effect::Deny,
        }
    }
}

impl PolicySet {
    /// An empty deny-everything policy set.
    pub fn deny_all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Append a rule and return self (builder pattern).
    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_default(mut self, effect: Effect) -> Self {
        self.default_effect = effect;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Look up a rule by id.
    pub fn rule(&self, id: &str) -> Option<&PolicyRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Check every rule and reject duplicate ids.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(PolicyError::DuplicateRule(rule.id.clone()));
            }
            rule.validate()?;
        }
        PolicyRule::new("<default>", Default::default(), self.default_effect.clone()).validate()
    }

    /// Parse and validate a policy set from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        let set: PolicySet =
            serde_yaml::from_str(yaml).map_err(|e| PolicyError::Parse(e.to_string()))?;
        set.validate()?;
        Ok(set)
    }

    /// Read, parse, and validate a YAML policy file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }
}
