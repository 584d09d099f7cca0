// store.rs - The active policy snapshot and its reload boundary.
//
// Evaluations take an `Arc<PolicySet>` snapshot and run against it to
// completion. A reload validates the new set first and then swaps the Arc,
// so in-flight evaluations finish against whichever snapshot they started
// with and new evaluations see the new set.

use std::sync::{Arc, PoisonError, RwLock};

use crate::error::PolicyError;
use crate::policy_set::PolicySet;

/// Holds the currently active policy set.
#[derive(Debug)]
pub struct PolicyStore {
    active: RwLock<Arc<PolicySet>>,
}

impl PolicyStore {
    /// Validate and install the initial policy set.
    pub fn new(initial: PolicySet) -> Result<Self, PolicyError> {
        initial.validate()?;
        tracing::info!(
            policy = %initial.name,
            version = initial.version,
            rules = initial.rules.len(),
            "policy loaded"
        );
        Ok(Self {
            active: RwLock::new(Arc::new(initial)),
        })
    }

    /// The policy set new evaluations should use.
    pub fn snapshot(&self) -> Arc<PolicySet> {
        Arc::clone(&self.active.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Validate `next` and make it the active set. Returns the replaced set.
    ///
    /// The new version must be strictly greater than the active one.
    pub fn replace(&self, next: PolicySet) -> Result<Arc<PolicySet>, PolicyError> {
        next.validate()?;
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if next.version <= active.version {
            return Err(PolicyError::StaleVersion {
                offered: next.version,
                active: active.version,
            });
        }
        tracing::info!(
            policy = %next.name,
            from_version = active.version,
            to_version = next.version,
            "policy reloaded"
        );
        Ok(std::mem::replace(&mut *active, Arc::new(next)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Effect, MatchPredicate, Matcher, PolicyRule};

    fn versioned(version: u64, effect: Effect) -> PolicySet {
        PolicySet::deny_all("store-test")
            .with_version(version)
            .with_rule(PolicyRule::new("all", MatchPredicate::default(), effect))
    }

    #[test]
    fn snapshot_survives_replace() {
        let store = PolicyStore::new(versioned(1, Effect::Allow)).unwrap();
        let before = store.snapshot();
        store.replace(versioned(2, Effect::Deny)).unwrap();
        // The old snapshot is untouched; new readers see version 2.
        assert_eq!(before.version, 1);
        assert_eq!(before.rules[0].effect, Effect::Allow);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn stale_version_is_rejected() {
        let store = PolicyStore::new(versioned(5, Effect::Allow)).unwrap();
        let err = store.replace(versioned(5, Effect::Deny)).unwrap_err();
        assert!(matches!(err, PolicyError::StaleVersion { offered: 5, active: 5 }));
        assert_eq!(store.snapshot().rules[0].effect, Effect::Allow);
    }

    #[test]
    fn invalid_replacement_keeps_active_set() {
        let store = PolicyStore::new(versioned(1, Effect::Allow)).unwrap();
        let broken = PolicySet::deny_all("broken").with_version(2).with_rule(PolicyRule::new(
            "bad",
            MatchPredicate {
                tool: Some(Matcher::Prefix(String::new())),
                ..Default::default()
            },
            Effect::Allow,
        ));
        assert!(store.replace(broken).is_err());
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn invalid_initial_set_is_rejected() {
        let bad = PolicySet::deny_all("bad").with_default(Effect::RateLimit {
            limit: 1,
            window_secs: 0,
        });
        assert!(PolicyStore::new(bad).is_err());
    }
}
