//! The forwarding rule entity.

use std::collections::HashSet;

use crate::error::{ValidationError, ValidationErrors};
use crate::rules::options::{MessageEditOptions, MessageFilterOptions};

/// A named route from one source channel to one or more target channels.
///
/// Built only through [`ForwardingRule::new`], which enforces every
/// invariant. The enabled flag is the only thing that changes afterwards,
/// via [`ForwardingRule::with_enabled`]; any other change means building a
/// replacement rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    name: String,
    is_enabled: bool,
    source_channel_id: i64,
    target_channel_ids: Vec<i64>,
    edit_options: MessageEditOptions,
    filter_options: MessageFilterOptions,
}

impl ForwardingRule {
    pub fn new(
        name: impl Into<String>,
        is_enabled: bool,
        source_channel_id: i64,
        target_channel_ids: Vec<i64>,
        edit_options: MessageEditOptions,
        filter_options: MessageFilterOptions,
    ) -> Result<Self, ValidationErrors> {
        let name = name.into();
        let errors = validate_rule(&name, is_enabled, &target_channel_ids, &filter_options);
        errors.into_result(Self {
            name,
            is_enabled,
            source_channel_id,
            target_channel_ids,
            edit_options,
            filter_options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    pub fn source_channel_id(&self) -> i64 {
        self.source_channel_id
    }

    pub fn target_channel_ids(&self) -> &[i64] {
        &self.target_channel_ids
    }

    pub fn edit_options(&self) -> &MessageEditOptions {
        &self.edit_options
    }

    pub fn filter_options(&self) -> &MessageFilterOptions {
        &self.filter_options
    }

    /// Copy of this rule with a new enabled flag.
    ///
    /// Enabling a rule without targets is rejected.
    pub fn with_enabled(&self, is_enabled: bool) -> Result<Self, ValidationErrors> {
        if is_enabled && self.target_channel_ids.is_empty() {
            return Err(ValidationError::EmptyTargets.into());
        }
        Ok(Self {
            is_enabled,
            ..self.clone()
        })
    }
}

/// Collect every invariant violation of the rule-level fields.
pub(crate) fn validate_rule(
    name: &str,
    is_enabled: bool,
    target_channel_ids: &[i64],
    filter_options: &MessageFilterOptions,
) -> ValidationErrors {
    let mut errors = ValidationErrors::new();

    if name.trim().is_empty() {
        errors.push(ValidationError::EmptyRuleName);
    }

    if is_enabled && target_channel_ids.is_empty() {
        errors.push(ValidationError::EmptyTargets);
    }

    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for id in target_channel_ids {
        if !seen.insert(*id) && reported.insert(*id) {
            errors.push(ValidationError::DuplicateTarget(*id));
        }
    }

    if let Err(e) = filter_options.check_length_bounds() {
        errors.push(e);
    }

    errors
}
