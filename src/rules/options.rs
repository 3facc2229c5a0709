//! Edit and filter option value objects attached to a forwarding rule.
//!
//! Both option types are immutable values: changes go through the `with_*`
//! methods, which consume the value and return an updated copy. Regex
//! patterns are compiled when the value is built, so a value that exists
//! always holds a valid pattern.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use regex::{NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ── Message kinds ───────────────────────────────────────────────────

/// The content kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Animation,
    Sticker,
    Other,
}

impl MessageKind {
    /// Every kind except plain text carries media.
    pub fn is_media(&self) -> bool {
        !matches!(self, Self::Text)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Animation => "animation",
            Self::Sticker => "sticker",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "photo" => Ok(Self::Photo),
            "video" => Ok(Self::Video),
            "document" => Ok(Self::Document),
            "audio" => Ok(Self::Audio),
            "voice" => Ok(Self::Voice),
            "animation" => Ok(Self::Animation),
            "sticker" => Ok(Self::Sticker),
            "other" => Ok(Self::Other),
            _ => Err(ValidationError::UnknownMessageKind(s.to_string())),
        }
    }
}

// ── Regex options ───────────────────────────────────────────────────

/// Flags applied when compiling a user-supplied pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegexOptions {
    pub case_insensitive: bool,
    pub multiline: bool,
    pub dot_matches_new_line: bool,
    pub ignore_whitespace: bool,
}

impl RegexOptions {
    const CASE_INSENSITIVE: i64 = 1;
    const MULTILINE: i64 = 2;
    const DOT_MATCHES_NEW_LINE: i64 = 4;
    const IGNORE_WHITESPACE: i64 = 8;

    pub fn case_insensitive() -> Self {
        Self {
            case_insensitive: true,
            ..Self::default()
        }
    }

    /// Bitmask form used by the persistence layer.
    pub fn to_bits(self) -> i64 {
        let mut bits = 0;
        if self.case_insensitive {
            bits |= Self::CASE_INSENSITIVE;
        }
        if self.multiline {
            bits |= Self::MULTILINE;
        }
        if self.dot_matches_new_line {
            bits |= Self::DOT_MATCHES_NEW_LINE;
        }
        if self.ignore_whitespace {
            bits |= Self::IGNORE_WHITESPACE;
        }
        bits
    }

    /// Unknown bits are ignored.
    pub fn from_bits(bits: i64) -> Self {
        Self {
            case_insensitive: bits & Self::CASE_INSENSITIVE != 0,
            multiline: bits & Self::MULTILINE != 0,
            dot_matches_new_line: bits & Self::DOT_MATCHES_NEW_LINE != 0,
            ignore_whitespace: bits & Self::IGNORE_WHITESPACE != 0,
        }
    }

    fn compile(self, pattern: &str) -> Result<Regex, regex::Error> {
        RegexBuilder::new(pattern)
            .case_insensitive(self.case_insensitive)
            .multi_line(self.multiline)
            .dot_matches_new_line(self.dot_matches_new_line)
            .ignore_whitespace(self.ignore_whitespace)
            .build()
    }
}

fn compile_pattern(field: &str, pattern: &str, options: RegexOptions) -> Result<Regex, ValidationError> {
    options
        .compile(pattern)
        .map_err(|e| ValidationError::InvalidPattern {
            field: field.to_string(),
            reason: e.to_string(),
        })
}

/// Matcher for `text`. Regexes honour every flag; a literal only honours
/// `case_insensitive` and needs no regex without it.
fn text_matcher(
    field: &str,
    text: &str,
    is_regex: bool,
    options: RegexOptions,
) -> Result<Option<Regex>, ValidationError> {
    if is_regex {
        compile_pattern(field, text, options).map(Some)
    } else if options.case_insensitive {
        compile_pattern(field, &regex::escape(text), RegexOptions::case_insensitive()).map(Some)
    } else {
        Ok(None)
    }
}

// ── Text replacement ────────────────────────────────────────────────

/// One find/replace step of the edit pipeline.
#[derive(Debug, Clone)]
pub struct TextReplacementRule {
    find: String,
    replace_with: String,
    is_regex: bool,
    regex_options: RegexOptions,
    regex: Option<Regex>,
}

impl TextReplacementRule {
    /// Build a replacement, compiling `find` when it is a regex.
    pub fn new(
        find: impl Into<String>,
        replace_with: impl Into<String>,
        is_regex: bool,
        regex_options: RegexOptions,
    ) -> Result<Self, ValidationError> {
        Self::build("textReplacement", find.into(), replace_with.into(), is_regex, regex_options)
    }

    /// Literal replace-all of `find` with `replace_with`.
    pub fn literal(find: impl Into<String>, replace_with: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(find, replace_with, false, RegexOptions::default())
    }

    pub(crate) fn build(
        field: &str,
        find: String,
        replace_with: String,
        is_regex: bool,
        regex_options: RegexOptions,
    ) -> Result<Self, ValidationError> {
        if find.is_empty() {
            return Err(ValidationError::EmptyFindText {
                field: field.to_string(),
            });
        }
        let regex = text_matcher(field, &find, is_regex, regex_options)?;
        Ok(Self {
            find,
            replace_with,
            is_regex,
            regex_options,
            regex,
        })
    }

    pub fn find(&self) -> &str {
        &self.find
    }

    pub fn replace_with(&self) -> &str {
        &self.replace_with
    }

    pub fn is_regex(&self) -> bool {
        self.is_regex
    }

    pub fn regex_options(&self) -> RegexOptions {
        self.regex_options
    }

    /// Replace every occurrence in `input`.
    pub fn apply(&self, input: &str) -> String {
        match &self.regex {
            Some(re) if self.is_regex => re.replace_all(input, self.replace_with.as_str()).into_owned(),
            Some(re) => re.replace_all(input, NoExpand(&self.replace_with)).into_owned(),
            None => input.replace(&self.find, &self.replace_with),
        }
    }
}

impl PartialEq for TextReplacementRule {
    fn eq(&self, other: &Self) -> bool {
        self.find == other.find
            && self.replace_with == other.replace_with
            && self.is_regex == other.is_regex
            && self.regex_options == other.regex_options
    }
}

impl Eq for TextReplacementRule {}

// ── Content match ───────────────────────────────────────────────────

/// "Message must contain" requirement of a filter.
#[derive(Debug, Clone)]
pub struct TextMatch {
    text: String,
    is_regex: bool,
    regex_options: RegexOptions,
    regex: Option<Regex>,
}

impl TextMatch {
    pub fn new(text: impl Into<String>, is_regex: bool, regex_options: RegexOptions) -> Result<Self, ValidationError> {
        let text = text.into();
        let regex = text_matcher("containsText", &text, is_regex, regex_options)?;
        Ok(Self {
            text,
            is_regex,
            regex_options,
            regex,
        })
    }

    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_regex: false,
            regex_options: RegexOptions::default(),
            regex: None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_regex(&self) -> bool {
        self.is_regex
    }

    pub fn regex_options(&self) -> RegexOptions {
        self.regex_options
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        match &self.regex {
            Some(re) => re.is_match(haystack),
            None => haystack.contains(&self.text),
        }
    }
}

impl PartialEq for TextMatch {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
            && self.is_regex == other.is_regex
            && self.regex_options == other.regex_options
    }
}

impl Eq for TextMatch {}

// ── Edit options ────────────────────────────────────────────────────

/// How a message is rewritten before it is sent to the targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageEditOptions {
    pub prepend_text: Option<String>,
    pub append_text: Option<String>,
    pub text_replacements: Vec<TextReplacementRule>,
    pub remove_source_forward_header: bool,
    pub remove_links: bool,
    pub strip_formatting: bool,
    pub custom_footer: Option<String>,
    pub drop_author: bool,
    pub drop_media_captions: bool,
    pub no_forwards: bool,
}

impl MessageEditOptions {
    pub fn with_prepend_text(self, text: impl Into<String>) -> Self {
        Self {
            prepend_text: Some(text.into()),
            ..self
        }
    }

    pub fn with_append_text(self, text: impl Into<String>) -> Self {
        Self {
            append_text: Some(text.into()),
            ..self
        }
    }

    pub fn with_custom_footer(self, footer: impl Into<String>) -> Self {
        Self {
            custom_footer: Some(footer.into()),
            ..self
        }
    }

    /// Replace the whole replacement list.
    pub fn with_text_replacements(self, text_replacements: Vec<TextReplacementRule>) -> Self {
        Self {
            text_replacements,
            ..self
        }
    }

    /// Append one replacement at the end of the list.
    pub fn with_replacement(mut self, replacement: TextReplacementRule) -> Self {
        self.text_replacements.push(replacement);
        self
    }

    pub fn with_remove_source_forward_header(self, remove_source_forward_header: bool) -> Self {
        Self {
            remove_source_forward_header,
            ..self
        }
    }

    pub fn with_remove_links(self, remove_links: bool) -> Self {
        Self { remove_links, ..self }
    }

    pub fn with_strip_formatting(self, strip_formatting: bool) -> Self {
        Self {
            strip_formatting,
            ..self
        }
    }

    pub fn with_drop_author(self, drop_author: bool) -> Self {
        Self { drop_author, ..self }
    }

    pub fn with_drop_media_captions(self, drop_media_captions: bool) -> Self {
        Self {
            drop_media_captions,
            ..self
        }
    }

    pub fn with_no_forwards(self, no_forwards: bool) -> Self {
        Self { no_forwards, ..self }
    }
}

// ── Filter options ──────────────────────────────────────────────────

/// Eligibility criteria a message must meet for a rule to forward it.
///
/// Empty sets mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilterOptions {
    pub allowed_message_types: BTreeSet<MessageKind>,
    pub allowed_mime_types: BTreeSet<String>,
    pub contains_text: Option<TextMatch>,
    pub allowed_sender_user_ids: BTreeSet<i64>,
    pub blocked_sender_user_ids: BTreeSet<i64>,
    pub ignore_edited_messages: bool,
    pub ignore_service_messages: bool,
    pub min_message_length: Option<usize>,
    pub max_message_length: Option<usize>,
}

impl MessageFilterOptions {
    pub fn with_allowed_message_types(self, kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        Self {
            allowed_message_types: kinds.into_iter().collect(),
            ..self
        }
    }

    pub fn with_allowed_mime_types<S: Into<String>>(self, mime_types: impl IntoIterator<Item = S>) -> Self {
        Self {
            allowed_mime_types: mime_types
                .into_iter()
                .map(|m| m.into().trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            ..self
        }
    }

    pub fn with_contains_text(self, contains_text: TextMatch) -> Self {
        Self {
            contains_text: Some(contains_text),
            ..self
        }
    }

    pub fn with_allowed_senders(self, user_ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            allowed_sender_user_ids: user_ids.into_iter().collect(),
            ..self
        }
    }

    pub fn with_blocked_senders(self, user_ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            blocked_sender_user_ids: user_ids.into_iter().collect(),
            ..self
        }
    }

    pub fn with_ignore_edited_messages(self, ignore_edited_messages: bool) -> Self {
        Self {
            ignore_edited_messages,
            ..self
        }
    }

    pub fn with_ignore_service_messages(self, ignore_service_messages: bool) -> Self {
        Self {
            ignore_service_messages,
            ..self
        }
    }

    pub fn with_min_length(self, min: usize) -> Self {
        Self {
            min_message_length: Some(min),
            ..self
        }
    }

    pub fn with_max_length(self, max: usize) -> Self {
        Self {
            max_message_length: Some(max),
            ..self
        }
    }

    /// Min ≤ Max when both bounds are set.
    pub(crate) fn check_length_bounds(&self) -> Result<(), ValidationError> {
        match (self.min_message_length, self.max_message_length) {
            (Some(min), Some(max)) if min > max => Err(ValidationError::LengthBounds { min, max }),
            _ => Ok(()),
        }
    }
}
