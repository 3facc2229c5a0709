//! Wire and storage shape of a forwarding rule.
//!
//! `RuleDraft` is what the REST API accepts and returns, and what the
//! persistence layer reassembles from table rows. Turning a draft into a
//! [`ForwardingRule`] runs every validation and reports all violations at once.

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::rules::model::{ForwardingRule, validate_rule};
use crate::rules::options::{
    MessageEditOptions, MessageFilterOptions, MessageKind, RegexOptions, TextMatch,
    TextReplacementRule,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDraft {
    pub rule_name: String,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    pub source_channel_id: i64,
    #[serde(default)]
    pub target_channel_ids: Vec<i64>,
    #[serde(default)]
    pub edit_options: EditOptionsDraft,
    #[serde(default)]
    pub filter_options: FilterOptionsDraft,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EditOptionsDraft {
    pub prepend_text: Option<String>,
    pub append_text: Option<String>,
    pub text_replacements: Vec<TextReplacementDraft>,
    pub remove_source_forward_header: bool,
    pub remove_links: bool,
    pub strip_formatting: bool,
    pub custom_footer: Option<String>,
    pub drop_author: bool,
    pub drop_media_captions: bool,
    pub no_forwards: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextReplacementDraft {
    pub find: String,
    #[serde(default)]
    pub replace_with: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub regex_options: RegexOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterOptionsDraft {
    pub allowed_message_types: Vec<String>,
    pub allowed_mime_types: Vec<String>,
    pub contains_text: Option<String>,
    pub contains_text_is_regex: bool,
    pub contains_text_regex_options: RegexOptions,
    pub allowed_sender_user_ids: Vec<i64>,
    pub blocked_sender_user_ids: Vec<i64>,
    pub ignore_edited_messages: bool,
    pub ignore_service_messages: bool,
    pub min_message_length: Option<usize>,
    pub max_message_length: Option<usize>,
}

impl RuleDraft {
    /// Validate and build the rule, collecting every violation.
    pub fn into_rule(self) -> Result<ForwardingRule, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let edit_options = self.edit_options.build(&mut errors);
        let filter_options = self.filter_options.build(&mut errors);

        for e in validate_rule(
            &self.rule_name,
            self.is_enabled,
            &self.target_channel_ids,
            &filter_options,
        )
        .0
        {
            errors.push(e);
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        ForwardingRule::new(
            self.rule_name,
            self.is_enabled,
            self.source_channel_id,
            self.target_channel_ids,
            edit_options,
            filter_options,
        )
    }
}

impl EditOptionsDraft {
    fn build(self, errors: &mut ValidationErrors) -> MessageEditOptions {
        let mut text_replacements = Vec::with_capacity(self.text_replacements.len());
        for (i, r) in self.text_replacements.into_iter().enumerate() {
            let field = format!("editOptions.textReplacements[{i}]");
            match TextReplacementRule::build(&field, r.find, r.replace_with, r.is_regex, r.regex_options) {
                Ok(rule) => text_replacements.push(rule),
                Err(e) => errors.push(e),
            }
        }

        MessageEditOptions {
            prepend_text: non_empty(self.prepend_text),
            append_text: non_empty(self.append_text),
            text_replacements,
            remove_source_forward_header: self.remove_source_forward_header,
            remove_links: self.remove_links,
            strip_formatting: self.strip_formatting,
            custom_footer: non_empty(self.custom_footer),
            drop_author: self.drop_author,
            drop_media_captions: self.drop_media_captions,
            no_forwards: self.no_forwards,
        }
    }
}

impl FilterOptionsDraft {
    fn build(self, errors: &mut ValidationErrors) -> MessageFilterOptions {
        let mut allowed_message_types = std::collections::BTreeSet::new();
        for raw in &self.allowed_message_types {
            match raw.parse::<MessageKind>() {
                Ok(kind) => {
                    allowed_message_types.insert(kind);
                }
                Err(e) => errors.push(e),
            }
        }

        let contains_text = match non_empty(self.contains_text) {
            Some(text) => {
                match TextMatch::new(text, self.contains_text_is_regex, self.contains_text_regex_options) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        errors.push(e);
                        None
                    }
                }
            }
            None => None,
        };

        MessageFilterOptions {
            allowed_message_types,
            allowed_mime_types: self
                .allowed_mime_types
                .into_iter()
                .map(|m| m.trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            contains_text,
            allowed_sender_user_ids: self.allowed_sender_user_ids.into_iter().collect(),
            blocked_sender_user_ids: self.blocked_sender_user_ids.into_iter().collect(),
            ignore_edited_messages: self.ignore_edited_messages,
            ignore_service_messages: self.ignore_service_messages,
            min_message_length: self.min_message_length,
            max_message_length: self.max_message_length,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

impl From<&ForwardingRule> for RuleDraft {
    fn from(rule: &ForwardingRule) -> Self {
        let edit = rule.edit_options();
        let filter = rule.filter_options();
        Self {
            rule_name: rule.name().to_string(),
            is_enabled: rule.is_enabled(),
            source_channel_id: rule.source_channel_id(),
            target_channel_ids: rule.target_channel_ids().to_vec(),
            edit_options: EditOptionsDraft {
                prepend_text: edit.prepend_text.clone(),
                append_text: edit.append_text.clone(),
                text_replacements: edit
                    .text_replacements
                    .iter()
                    .map(|r| TextReplacementDraft {
                        find: r.find().to_string(),
                        replace_with: r.replace_with().to_string(),
                        is_regex: r.is_regex(),
                        regex_options: r.regex_options(),
                    })
                    .collect(),
                remove_source_forward_header: edit.remove_source_forward_header,
                remove_links: edit.remove_links,
                strip_formatting: edit.strip_formatting,
                custom_footer: edit.custom_footer.clone(),
                drop_author: edit.drop_author,
                drop_media_captions: edit.drop_media_captions,
                no_forwards: edit.no_forwards,
            },
            filter_options: FilterOptionsDraft {
                allowed_message_types: filter
                    .allowed_message_types
                    .iter()
                    .map(|k| k.as_str().to_string())
                    .collect(),
                allowed_mime_types: filter.allowed_mime_types.iter().cloned().collect(),
                contains_text: filter.contains_text.as_ref().map(|m| m.text().to_string()),
                contains_text_is_regex: filter.contains_text.as_ref().is_some_and(|m| m.is_regex()),
                contains_text_regex_options: filter
                    .contains_text
                    .as_ref()
                    .map(|m| m.regex_options())
                    .unwrap_or_default(),
                allowed_sender_user_ids: filter.allowed_sender_user_ids.iter().copied().collect(),
                blocked_sender_user_ids: filter.blocked_sender_user_ids.iter().copied().collect(),
                ignore_edited_messages: filter.ignore_edited_messages,
                ignore_service_messages: filter.ignore_service_messages,
                min_message_length: filter.min_message_length,
                max_message_length: filter.max_message_length,
            },
        }
    }
}
