//! Rule persistence interface.
//!
//! The pipeline only reads rules; the REST layer is the only writer. Every
//! read returns owned values, so a caller holds a consistent snapshot that
//! later writes can't change underneath it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::RuleError;
use crate::rules::model::ForwardingRule;

/// CRUD store for forwarding rules, keyed by rule name.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All rules, ordered by name.
    async fn list_rules(&self) -> Result<Vec<ForwardingRule>, RuleError>;

    /// A single rule by name.
    async fn get_rule(&self, name: &str) -> Result<Option<ForwardingRule>, RuleError>;

    /// Every rule for a source channel, enabled or not, ordered by name.
    async fn rules_for_source(&self, source_channel_id: i64) -> Result<Vec<ForwardingRule>, RuleError>;

    /// Insert a new rule. Fails with `DuplicateName` if the name is taken.
    async fn create_rule(&self, rule: &ForwardingRule) -> Result<(), RuleError>;

    /// Replace an existing rule. Fails with `NotFound` if absent.
    async fn replace_rule(&self, rule: &ForwardingRule) -> Result<(), RuleError>;

    /// Delete a rule. Fails with `NotFound` if absent.
    async fn delete_rule(&self, name: &str) -> Result<(), RuleError>;

    /// Flip the enabled flag and return the updated rule.
    async fn set_enabled(&self, name: &str, is_enabled: bool) -> Result<ForwardingRule, RuleError>;
}

/// In-process rule store.
#[derive(Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<BTreeMap<String, ForwardingRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `rules` (later duplicates win).
    pub fn with_rules(rules: impl IntoIterator<Item = ForwardingRule>) -> Self {
        Self {
            rules: RwLock::new(
                rules
                    .into_iter()
                    .map(|r| (r.name().to_string(), r))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn list_rules(&self) -> Result<Vec<ForwardingRule>, RuleError> {
        Ok(self.rules.read().await.values().cloned().collect())
    }

    async fn get_rule(&self, name: &str) -> Result<Option<ForwardingRule>, RuleError> {
        Ok(self.rules.read().await.get(name).cloned())
    }

    async fn rules_for_source(&self, source_channel_id: i64) -> Result<Vec<ForwardingRule>, RuleError> {
        Ok(self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.source_channel_id() == source_channel_id)
            .cloned()
            .collect())
    }

    async fn create_rule(&self, rule: &ForwardingRule) -> Result<(), RuleError> {
        let mut rules = self.rules.write().await;
        if rules.contains_key(rule.name()) {
            return Err(RuleError::DuplicateName(rule.name().to_string()));
        }
        rules.insert(rule.name().to_string(), rule.clone());
        debug!(rule = %rule.name(), "Rule created");
        Ok(())
    }

    async fn replace_rule(&self, rule: &ForwardingRule) -> Result<(), RuleError> {
        let mut rules = self.rules.write().await;
        match rules.get_mut(rule.name()) {
            Some(existing) => {
                *existing = rule.clone();
                debug!(rule = %rule.name(), "Rule replaced");
                Ok(())
            }
            None => Err(RuleError::NotFound(rule.name().to_string())),
        }
    }

    async fn delete_rule(&self, name: &str) -> Result<(), RuleError> {
        match self.rules.write().await.remove(name) {
            Some(_) => Ok(()),
            None => Err(RuleError::NotFound(name.to_string())),
        }
    }

    async fn set_enabled(&self, name: &str, is_enabled: bool) -> Result<ForwardingRule, RuleError> {
        let mut rules = self.rules.write().await;
        let existing = rules
            .get_mut(name)
            .ok_or_else(|| RuleError::NotFound(name.to_string()))?;
        let updated = existing.with_enabled(is_enabled)?;
        *existing = updated.clone();
        Ok(updated)
    }
}
