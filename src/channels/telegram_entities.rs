//! Render Bot API message entities as Telegram-flavoured HTML.
//!
//! Entity offsets and lengths count UTF-16 code units. Entities nest but do
//! not partially overlap.

use crate::channels::telegram_types::MessageEntity;
use crate::pipeline::editor::escape_html;

/// Entity types that carry styling. Auto-detected ones (`url`, `mention`,
/// `hashtag`, …) are plain text and re-detected by Telegram on send.
fn is_styling(kind: &str) -> bool {
    matches!(
        kind,
        "bold"
            | "italic"
            | "underline"
            | "strikethrough"
            | "spoiler"
            | "code"
            | "pre"
            | "text_link"
            | "text_mention"
            | "blockquote"
            | "expandable_blockquote"
    )
}

/// Whether any entity changes how the text looks.
pub fn has_styling(entities: &[MessageEntity]) -> bool {
    entities.iter().any(|e| is_styling(&e.kind))
}

fn open_tag(entity: &MessageEntity) -> String {
    match entity.kind.as_str() {
        "bold" => "<b>".into(),
        "italic" => "<i>".into(),
        "underline" => "<u>".into(),
        "strikethrough" => "<s>".into(),
        "spoiler" => "<tg-spoiler>".into(),
        "code" => "<code>".into(),
        "pre" => match &entity.language {
            Some(lang) => format!("<pre><code class=\"language-{}\">", escape_html(lang)),
            None => "<pre>".into(),
        },
        "text_link" => format!(
            "<a href=\"{}\">",
            escape_html(entity.url.as_deref().unwrap_or_default())
        ),
        "text_mention" => match &entity.user {
            Some(user) => format!("<a href=\"tg://user?id={}\">", user.id),
            None => "<a>".into(),
        },
        "blockquote" => "<blockquote>".into(),
        "expandable_blockquote" => "<blockquote expandable>".into(),
        _ => String::new(),
    }
}

fn close_tag(entity: &MessageEntity) -> &'static str {
    match entity.kind.as_str() {
        "bold" => "</b>",
        "italic" => "</i>",
        "underline" => "</u>",
        "strikethrough" => "</s>",
        "spoiler" => "</tg-spoiler>",
        "code" => "</code>",
        "pre" if entity.language.is_some() => "</code></pre>",
        "pre" => "</pre>",
        "text_link" | "text_mention" => "</a>",
        "blockquote" | "expandable_blockquote" => "</blockquote>",
        _ => "",
    }
}

/// Render `text` with its styling entities as HTML. Text outside tags is escaped.
pub fn render_html(text: &str, entities: &[MessageEntity]) -> String {
    let units: Vec<u16> = text.encode_utf16().collect();
    let total = units.len();

    let mut styled: Vec<&MessageEntity> = entities
        .iter()
        .filter(|e| is_styling(&e.kind) && e.length > 0 && e.offset < total)
        .collect();
    // Outer entities first when they start together.
    styled.sort_by(|a, b| a.offset.cmp(&b.offset).then(b.length.cmp(&a.length)));

    let mut boundaries: Vec<usize> = styled
        .iter()
        .flat_map(|e| [e.offset, (e.offset + e.length).min(total)])
        .chain([0, total])
        .collect();
    boundaries.sort_unstable();
    boundaries.dedup();

    let mut out = String::with_capacity(text.len() + styled.len() * 8);
    let mut open: Vec<(&MessageEntity, usize)> = Vec::new();
    let mut next = styled.iter().peekable();

    for window in boundaries.windows(2) {
        let (start, end) = (window[0], window[1]);

        while let Some((entity, entity_end)) = open.last()
            && *entity_end <= start
        {
            out.push_str(close_tag(entity));
            open.pop();
        }
        while let Some(entity) = next.next_if(|e| e.offset == start) {
            out.push_str(&open_tag(entity));
            open.push((*entity, (entity.offset + entity.length).min(total)));
        }

        out.push_str(&escape_html(&String::from_utf16_lossy(&units[start..end])));
    }

    while let Some((entity, _)) = open.pop() {
        out.push_str(close_tag(entity));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(kind: &str, offset: usize, length: usize) -> MessageEntity {
        MessageEntity {
            kind: kind.into(),
            offset,
            length,
            url: None,
            user: None,
            language: None,
        }
    }

    #[test]
    fn plain_text_is_escaped() {
        assert_eq!(render_html("a < b & c", &[]), "a &lt; b &amp; c");
    }

    #[test]
    fn single_entity() {
        assert_eq!(render_html("hello world", &[entity("bold", 6, 5)]), "hello <b>world</b>");
    }

    #[test]
    fn nested_entities() {
        let html = render_html(
            "bold italic",
            &[entity("bold", 0, 11), entity("italic", 5, 6)],
        );
        assert_eq!(html, "<b>bold <i>italic</i></b>");
    }

    #[test]
    fn offsets_are_utf16() {
        // The emoji is two UTF-16 units.
        let html = render_html("😀 hi", &[entity("italic", 3, 2)]);
        assert_eq!(html, "😀 <i>hi</i>");
    }

    #[test]
    fn text_link_carries_url() {
        let mut link = entity("text_link", 0, 4);
        link.url = Some("https://example.com/?a=1&b=2".into());
        assert_eq!(
            render_html("site", &[link]),
            "<a href=\"https://example.com/?a=1&amp;b=2\">site</a>"
        );
    }

    #[test]
    fn pre_with_language() {
        let mut pre = entity("pre", 0, 6);
        pre.language = Some("rust".into());
        assert_eq!(
            render_html("fn x()", &[pre]),
            "<pre><code class=\"language-rust\">fn x()</code></pre>"
        );
    }

    #[test]
    fn auto_detected_entities_are_ignored() {
        let entities = [entity("url", 0, 11), entity("hashtag", 12, 4)];
        assert!(!has_styling(&entities));
        assert_eq!(render_html("example.com #tag", &entities), "example.com #tag");
    }

    #[test]
    fn entity_past_end_is_clamped() {
        assert_eq!(render_html("abc", &[entity("bold", 1, 10)]), "a<b>bc</b>");
    }
}
