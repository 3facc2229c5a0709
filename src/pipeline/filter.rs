//! Message filter: decides whether a message is eligible for a rule.
//!
//! Checks run in a fixed order and stop at the first rejection:
//! service → edited → kind → mime → blocked sender → allowed sender →
//! length → content. The block list is consulted before the allow list, so
//! a sender on both lists is always rejected.

use tracing::debug;

use crate::pipeline::types::{FilterDecision, MessageView, SkipReason};
use crate::rules::options::MessageFilterOptions;

/// Evaluate `message` against `options`.
pub fn evaluate_filter(message: &MessageView, options: &MessageFilterOptions) -> FilterDecision {
    match first_rejection(message, options) {
        Some(reason) => {
            debug!(
                channel_id = message.channel_id,
                message_id = message.message_id,
                reason = reason.label(),
                "Message rejected by filter"
            );
            FilterDecision::Reject(reason)
        }
        None => FilterDecision::Allow,
    }
}

fn first_rejection(message: &MessageView, options: &MessageFilterOptions) -> Option<SkipReason> {
    if options.ignore_service_messages && message.is_service_message {
        return Some(SkipReason::ServiceMessage);
    }

    if options.ignore_edited_messages && message.is_edited {
        return Some(SkipReason::EditedMessage);
    }

    if !options.allowed_message_types.is_empty()
        && !options.allowed_message_types.contains(&message.kind)
    {
        return Some(SkipReason::TypeNotAllowed);
    }

    if message.kind.is_media() && !options.allowed_mime_types.is_empty() {
        let allowed = message
            .mime_type
            .as_deref()
            .map(|m| options.allowed_mime_types.contains(&m.trim().to_ascii_lowercase()))
            .unwrap_or(false);
        if !allowed {
            return Some(SkipReason::MimeNotAllowed);
        }
    }

    if let Some(sender) = message.sender_id
        && options.blocked_sender_user_ids.contains(&sender)
    {
        return Some(SkipReason::SenderBlocked);
    }

    if !options.allowed_sender_user_ids.is_empty() {
        let allowed = message
            .sender_id
            .is_some_and(|s| options.allowed_sender_user_ids.contains(&s));
        if !allowed {
            return Some(SkipReason::SenderNotAllowed);
        }
    }

    if options.min_message_length.is_some() || options.max_message_length.is_some() {
        let len = message.text_length();
        let too_short = options.min_message_length.is_some_and(|min| len < min);
        let too_long = options.max_message_length.is_some_and(|max| len > max);
        if too_short || too_long {
            return Some(SkipReason::LengthOutOfRange);
        }
    }

    if let Some(ref required) = options.contains_text
        && !required.is_match(&message.text)
    {
        return Some(SkipReason::ContentMismatch);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::options::{MessageKind, RegexOptions, TextMatch};

    fn text(body: &str) -> MessageView {
        MessageView::text(-100, 1, body).with_sender(7)
    }

    fn reject(msg: &MessageView, opts: &MessageFilterOptions) -> Option<SkipReason> {
        match evaluate_filter(msg, opts) {
            FilterDecision::Allow => None,
            FilterDecision::Reject(r) => Some(r),
        }
    }

    #[test]
    fn default_options_allow_everything() {
        let opts = MessageFilterOptions::default();
        assert_eq!(evaluate_filter(&text("hi"), &opts), FilterDecision::Allow);
        assert_eq!(evaluate_filter(&text("hi").service().edited(), &opts), FilterDecision::Allow);
        let photo = MessageView::media(-100, 2, MessageKind::Photo, None, "");
        assert_eq!(evaluate_filter(&photo, &opts), FilterDecision::Allow);
    }

    #[test]
    fn service_and_edited_messages() {
        let opts = MessageFilterOptions::default()
            .with_ignore_service_messages(true)
            .with_ignore_edited_messages(true);
        assert_eq!(reject(&text("x").service().edited(), &opts), Some(SkipReason::ServiceMessage));
        assert_eq!(reject(&text("x").edited(), &opts), Some(SkipReason::EditedMessage));
        assert_eq!(reject(&text("x"), &opts), None);
    }

    #[test]
    fn message_type_allow_list() {
        let opts = MessageFilterOptions::default().with_allowed_message_types([MessageKind::Photo]);
        assert_eq!(reject(&text("x"), &opts), Some(SkipReason::TypeNotAllowed));
        let photo = MessageView::media(-100, 2, MessageKind::Photo, Some("image/jpeg"), "cap");
        assert_eq!(reject(&photo, &opts), None);
    }

    #[test]
    fn mime_allow_list_only_applies_to_media() {
        let opts = MessageFilterOptions::default().with_allowed_mime_types(["application/pdf"]);
        assert_eq!(reject(&text("plain text"), &opts), None);

        let pdf = MessageView::media(-100, 2, MessageKind::Document, Some("Application/PDF"), "");
        assert_eq!(reject(&pdf, &opts), None);

        let zip = MessageView::media(-100, 3, MessageKind::Document, Some("application/zip"), "");
        assert_eq!(reject(&zip, &opts), Some(SkipReason::MimeNotAllowed));

        let unknown = MessageView::media(-100, 4, MessageKind::Photo, None, "");
        assert_eq!(reject(&unknown, &opts), Some(SkipReason::MimeNotAllowed));
    }

    #[test]
    fn mime_allow_list_ignores_case_on_both_sides() {
        let opts = MessageFilterOptions::default().with_allowed_mime_types(["Application/PDF"]);
        let pdf = MessageView::media(-100, 2, MessageKind::Document, Some("application/pdf"), "");
        assert_eq!(reject(&pdf, &opts), None);
    }

    #[test]
    fn block_list_wins_over_allow_list() {
        let opts = MessageFilterOptions::default()
            .with_allowed_senders([7])
            .with_blocked_senders([7]);
        assert_eq!(reject(&text("hello"), &opts), Some(SkipReason::SenderBlocked));
    }

    #[test]
    fn sender_allow_list() {
        let opts = MessageFilterOptions::default().with_allowed_senders([8]);
        assert_eq!(reject(&text("hello"), &opts), Some(SkipReason::SenderNotAllowed));
        assert_eq!(reject(&text("hello").with_sender(8), &opts), None);

        let anonymous = MessageView::text(-100, 1, "hello");
        assert_eq!(reject(&anonymous, &opts), Some(SkipReason::SenderNotAllowed));
    }

    #[test]
    fn blocked_list_ignores_anonymous_posts() {
        let opts = MessageFilterOptions::default().with_blocked_senders([7]);
        let anonymous = MessageView::text(-100, 1, "hello");
        assert_eq!(reject(&anonymous, &opts), None);
    }

    #[test]
    fn length_bounds_are_inclusive() {
        let opts = MessageFilterOptions::default().with_min_length(3).with_max_length(5);
        assert_eq!(reject(&text("ab"), &opts), Some(SkipReason::LengthOutOfRange));
        assert_eq!(reject(&text("abc"), &opts), None);
        assert_eq!(reject(&text("abcde"), &opts), None);
        assert_eq!(reject(&text("abcdef"), &opts), Some(SkipReason::LengthOutOfRange));
    }

    #[test]
    fn min_length_ten_rejects_five_char_text() {
        let opts = MessageFilterOptions::default().with_min_length(10);
        assert_eq!(reject(&text("hello"), &opts), Some(SkipReason::LengthOutOfRange));
    }

    #[test]
    fn content_match_literal_and_regex() {
        let literal = MessageFilterOptions::default().with_contains_text(TextMatch::literal("XAUUSD"));
        assert_eq!(reject(&text("long XAUUSD now"), &literal), None);
        assert_eq!(reject(&text("long EURUSD"), &literal), Some(SkipReason::ContentMismatch));

        let regex = MessageFilterOptions::default().with_contains_text(
            TextMatch::new(r"\b(tp|sl)\s*\d+", true, RegexOptions::case_insensitive()).unwrap(),
        );
        assert_eq!(reject(&text("TP 2050 reached"), &regex), None);
        assert_eq!(reject(&text("no levels"), &regex), Some(SkipReason::ContentMismatch));
    }

    #[test]
    fn checks_run_in_documented_order() {
        // Fails type, sender and length at once: type is reported first.
        let opts = MessageFilterOptions::default()
            .with_allowed_message_types([MessageKind::Video])
            .with_blocked_senders([7])
            .with_min_length(100);
        assert_eq!(reject(&text("short"), &opts), Some(SkipReason::TypeNotAllowed));

        // Fails sender and length: sender first.
        let opts = MessageFilterOptions::default().with_blocked_senders([7]).with_min_length(100);
        assert_eq!(reject(&text("short"), &opts), Some(SkipReason::SenderBlocked));

        // Fails length and content: length first.
        let opts = MessageFilterOptions::default()
            .with_min_length(100)
            .with_contains_text(TextMatch::literal("zzz"));
        assert_eq!(reject(&text("short"), &opts), Some(SkipReason::LengthOutOfRange));
    }
}
