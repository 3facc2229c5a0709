//! Selects the rules that apply to a source channel.

use std::sync::Arc;

use tracing::debug;

use crate::error::RuleError;
use crate::rules::model::ForwardingRule;
use crate::rules::store::RuleStore;

/// Looks up enabled rules for a source channel.
pub struct RuleMatcher {
    store: Arc<dyn RuleStore>,
}

impl RuleMatcher {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    /// Enabled rules whose source is `source_channel_id`, ordered by name.
    ///
    /// Disabled rules are dropped silently.
    pub async fn matching_rules(&self, source_channel_id: i64) -> Result<Vec<ForwardingRule>, RuleError> {
        let snapshot = self.store.rules_for_source(source_channel_id).await?;
        let total = snapshot.len();
        let rules = select_enabled(snapshot, source_channel_id);
        debug!(
            source_channel_id,
            matched = rules.len(),
            disabled = total - rules.len(),
            "Matched rules for source"
        );
        Ok(rules)
    }
}

/// Keep enabled rules for the source and sort them by name.
pub fn select_enabled(rules: Vec<ForwardingRule>, source_channel_id: i64) -> Vec<ForwardingRule> {
    let mut selected: Vec<ForwardingRule> = rules
        .into_iter()
        .filter(|r| r.is_enabled() && r.source_channel_id() == source_channel_id)
        .collect();
    selected.sort_by(|a, b| a.name().cmp(b.name()));
    selected
}
