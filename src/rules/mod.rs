//! Forwarding rules: the data model, its validation, and rule lookup.
//!
//! A rule names one source channel, an ordered list of target channels,
//! and the filter/edit options applied to each message on the way through.

pub mod codec;
pub mod draft;
pub mod matcher;
pub mod model;
pub mod options;
pub mod store;

pub use draft::RuleDraft;
pub use matcher::RuleMatcher;
pub use model::ForwardingRule;
pub use options::{
    MessageEditOptions, MessageFilterOptions, MessageKind, RegexOptions, TextMatch,
    TextReplacementRule,
};
pub use store::{InMemoryRuleStore, RuleStore};
