//! Shared types for the forwarding pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::rules::options::{MessageEditOptions, MessageKind};

// ── Message view ────────────────────────────────────────────────────

/// A message as observed on a source channel.
///
/// Transports convert their native format into this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub channel_id: i64,
    pub message_id: i64,
    /// Plain text body (caption for media).
    pub text: String,
    /// Rich-text rendering of `text` as HTML, when the message carries styling.
    pub html: Option<String>,
    pub kind: MessageKind,
    pub mime_type: Option<String>,
    /// Author user id. `None` for anonymous channel posts.
    pub sender_id: Option<i64>,
    pub is_edited: bool,
    pub is_service_message: bool,
    pub received_at: DateTime<Utc>,
}

impl MessageView {
    /// A plain text message.
    pub fn text(channel_id: i64, message_id: i64, text: impl Into<String>) -> Self {
        Self {
            channel_id,
            message_id,
            text: text.into(),
            html: None,
            kind: MessageKind::Text,
            mime_type: None,
            sender_id: None,
            is_edited: false,
            is_service_message: false,
            received_at: Utc::now(),
        }
    }

    /// A media message with an optional caption.
    pub fn media(
        channel_id: i64,
        message_id: i64,
        kind: MessageKind,
        mime_type: Option<&str>,
        caption: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            mime_type: mime_type.map(String::from),
            ..Self::text(channel_id, message_id, caption)
        }
    }

    pub fn with_sender(self, sender_id: i64) -> Self {
        Self {
            sender_id: Some(sender_id),
            ..self
        }
    }

    pub fn with_html(self, html: impl Into<String>) -> Self {
        Self {
            html: Some(html.into()),
            ..self
        }
    }

    pub fn edited(self) -> Self {
        Self {
            is_edited: true,
            ..self
        }
    }

    pub fn service(self) -> Self {
        Self {
            is_service_message: true,
            ..self
        }
    }

    /// Length used by the length filter, in characters.
    pub fn text_length(&self) -> usize {
        self.text.chars().count()
    }
}

// ── Edited output ───────────────────────────────────────────────────

/// Markup of an outgoing body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextFormat {
    #[default]
    Plain,
    Html,
}

/// Send-time flags the editor passes through untouched.
///
/// Each flag is independent; none takes priority over another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFlags {
    pub remove_source_forward_header: bool,
    pub drop_author: bool,
    pub drop_media_captions: bool,
    pub no_forwards: bool,
}

impl From<&MessageEditOptions> for DeliveryFlags {
    fn from(opts: &MessageEditOptions) -> Self {
        Self {
            remove_source_forward_header: opts.remove_source_forward_header,
            drop_author: opts.drop_author,
            drop_media_captions: opts.drop_media_captions,
            no_forwards: opts.no_forwards,
        }
    }
}

/// Result of the edit pipeline for one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditedMessage {
    pub text: String,
    pub format: TextFormat,
    /// Whether the body differs from the source message body.
    pub modified: bool,
    pub flags: DeliveryFlags,
}

/// Everything a transport needs to deliver one copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub source_channel_id: i64,
    pub source_message_id: i64,
    pub kind: MessageKind,
    pub text: String,
    pub format: TextFormat,
    pub modified: bool,
    pub flags: DeliveryFlags,
}

impl OutgoingMessage {
    pub fn new(source: &MessageView, edited: EditedMessage) -> Self {
        Self {
            source_channel_id: source.channel_id,
            source_message_id: source.message_id,
            kind: source.kind,
            text: edited.text,
            format: edited.format,
            modified: edited.modified,
            flags: edited.flags,
        }
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Why a rule did not dispatch a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ServiceMessage,
    EditedMessage,
    TypeNotAllowed,
    MimeNotAllowed,
    SenderBlocked,
    SenderNotAllowed,
    LengthOutOfRange,
    ContentMismatch,
    /// Already delivered within the dedup window.
    AlreadyDelivered,
    /// Another invocation is delivering the same message for this rule.
    InFlight,
}

impl SkipReason {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ServiceMessage => "service_message",
            Self::EditedMessage => "edited_message",
            Self::TypeNotAllowed => "type_not_allowed",
            Self::MimeNotAllowed => "mime_not_allowed",
            Self::SenderBlocked => "sender_blocked",
            Self::SenderNotAllowed => "sender_not_allowed",
            Self::LengthOutOfRange => "length_out_of_range",
            Self::ContentMismatch => "content_mismatch",
            Self::AlreadyDelivered => "already_delivered",
            Self::InFlight => "in_flight",
        }
    }
}

/// Filter verdict for one message and rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Reject(SkipReason),
}

/// Delivery result for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub channel_id: i64,
    #[serde(flatten)]
    pub status: DeliveryStatus,
}

impl TargetOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered)
    }
}

/// What happened to one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RuleResult {
    Skipped { reason: SkipReason },
    Dispatched { targets: Vec<TargetOutcome> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule_name: String,
    #[serde(flatten)]
    pub result: RuleResult,
}

impl RuleOutcome {
    pub fn skipped_reason(&self) -> Option<SkipReason> {
        match self.result {
            RuleResult::Skipped { reason } => Some(reason),
            RuleResult::Dispatched { .. } => None,
        }
    }

    pub fn targets(&self) -> &[TargetOutcome] {
        match &self.result {
            RuleResult::Dispatched { targets } => targets,
            RuleResult::Skipped { .. } => &[],
        }
    }
}

/// Aggregate result of processing one source message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardOutcome {
    pub source_channel_id: i64,
    pub message_id: i64,
    pub rules: Vec<RuleOutcome>,
    pub completed_at: DateTime<Utc>,
}

impl ForwardOutcome {
    pub fn delivered_count(&self) -> usize {
        self.all_targets().filter(|t| t.is_delivered()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.all_targets().filter(|t| !t.is_delivered()).count()
    }

    pub fn rule(&self, name: &str) -> Option<&RuleOutcome> {
        self.rules.iter().find(|r| r.rule_name == name)
    }

    fn all_targets(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.rules.iter().flat_map(|r| r.targets().iter())
    }
}

// ── Transport trait ─────────────────────────────────────────────────

/// Chat transport. Pure I/O, no forwarding logic.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Transport name for logging (e.g. "telegram").
    fn name(&self) -> &str;

    /// Look up a message. `Ok(None)` when it does not exist.
    async fn fetch_message(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<Option<MessageView>, ChannelError>;

    /// Deliver one copy to `target_channel_id`.
    async fn send_message(
        &self,
        target_channel_id: i64,
        message: &OutgoingMessage,
    ) -> Result<(), ChannelError>;
}
