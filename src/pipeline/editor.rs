//! Message editor: rewrites a message body for one rule.
//!
//! Steps run in a fixed order, each only when its option is set:
//! 1. strip formatting (edit the plain text instead of the HTML rendering)
//! 2. text replacements, first to last
//! 3. link removal
//! 4. prepend text
//! 5. append text
//! 6. custom footer, on its own line
//!
//! In an HTML body only the text between tags is edited, unescaped; tags
//! are kept as they are.
//!
//! Send-time flags (forward header, author, captions, no-forwards) are not
//! applied to the text; they ride along in [`DeliveryFlags`].

use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::types::{DeliveryFlags, EditedMessage, MessageView, TextFormat};
use crate::rules::options::MessageEditOptions;

/// Joins prepend/append text to the body.
const TEXT_SEPARATOR: &str = " ";

/// Puts the footer on its own line.
const FOOTER_SEPARATOR: &str = "\n";

/// A link plus the spaces or tabs on either side of it.
static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)([ \t]*)\b(?:https?://|www\.|t\.me/)[^\s<>"']+([ \t]*)"#).expect("URL pattern is valid")
});

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"));

static ANCHOR_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^</?a(?:\s|>)").expect("anchor pattern is valid"));

/// Run the edit pipeline over `message`.
pub fn edit_message(message: &MessageView, options: &MessageEditOptions) -> EditedMessage {
    let (original, original_format) = match message.html {
        Some(ref html) => (html.as_str(), TextFormat::Html),
        None => (message.text.as_str(), TextFormat::Plain),
    };

    // 1. Formatting
    let format = if options.strip_formatting {
        TextFormat::Plain
    } else {
        original_format
    };
    let mut segments = match format {
        TextFormat::Html => split_markup(original),
        TextFormat::Plain => vec![Segment::text(&message.text)],
    };

    // 2. Replacements, in list order. Markup is never touched.
    for replacement in &options.text_replacements {
        for segment in &mut segments {
            if let Segment::Text(text) = segment {
                let replaced = replacement.apply(&text.value);
                text.set(replaced);
            }
        }
    }

    // 3. Links
    if options.remove_links {
        remove_links(&mut segments);
    }

    let mut body = render(&segments, format);

    // 4–6. Decorations
    if let Some(ref prepend) = options.prepend_text {
        body = join_non_empty(&escape_for(prepend, format), TEXT_SEPARATOR, &body);
    }
    if let Some(ref append) = options.append_text {
        body = join_non_empty(&body, TEXT_SEPARATOR, &escape_for(append, format));
    }
    if let Some(ref footer) = options.custom_footer {
        body = join_non_empty(&body, FOOTER_SEPARATOR, &escape_for(footer, format));
    }

    let modified = format != original_format || body != original;

    EditedMessage {
        text: body,
        format,
        modified,
        flags: DeliveryFlags::from(options),
    }
}

/// A piece of the body: markup passes through, text is edited unescaped.
enum Segment<'a> {
    Markup(&'a str),
    Text(TextRun<'a>),
}

struct TextRun<'a> {
    /// Source form, reused verbatim when the run is left unedited.
    raw: &'a str,
    value: String,
    edited: bool,
}

impl<'a> Segment<'a> {
    fn text(raw: &'a str) -> Self {
        Self::Text(TextRun {
            raw,
            value: raw.to_string(),
            edited: false,
        })
    }
}

impl TextRun<'_> {
    fn set(&mut self, value: String) {
        if value != self.value {
            self.value = value;
            self.edited = true;
        }
    }
}

fn split_markup(html: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut last = 0;
    for tag in TAG_PATTERN.find_iter(html) {
        if tag.start() > last {
            segments.push(html_text(&html[last..tag.start()]));
        }
        segments.push(Segment::Markup(tag.as_str()));
        last = tag.end();
    }
    if last < html.len() {
        segments.push(html_text(&html[last..]));
    }
    segments
}

fn html_text(raw: &str) -> Segment<'_> {
    Segment::Text(TextRun {
        raw,
        value: unescape_html(raw),
        edited: false,
    })
}

fn render(segments: &[Segment<'_>], format: TextFormat) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Markup(tag) => out.push_str(tag),
            Segment::Text(run) if !run.edited => out.push_str(run.raw),
            Segment::Text(run) => out.push_str(&escape_for(&run.value, format)),
        }
    }
    out
}

/// Unwrap anchors to their label, then strip URLs from every text run.
fn remove_links(segments: &mut Vec<Segment<'_>>) {
    segments.retain(|s| !matches!(s, Segment::Markup(tag) if ANCHOR_TAG.is_match(tag)));

    for i in 0..segments.len() {
        let prev = segments[..i].iter().rev().find_map(|s| match s {
            Segment::Text(run) => run.value.chars().next_back(),
            Segment::Markup(_) => None,
        });
        let next = segments[i + 1..].iter().find_map(|s| match s {
            Segment::Text(run) => run.value.chars().next(),
            Segment::Markup(_) => None,
        });
        if let Segment::Text(run) = &mut segments[i] {
            let stripped = strip_urls(&run.value, prev, next);
            run.set(stripped);
        }
    }
}

/// Remove URLs from `text`. `prev` and `next` are the characters around it
/// in the whole body.
///
/// A removed link leaves at most one space behind, and none at a line start
/// or line end. Whitespace elsewhere is kept as is.
fn strip_urls(text: &str, prev: Option<char>, next: Option<char>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut matched = false;
    let mut at_start = false;
    for caps in URL_PATTERN.captures_iter(text) {
        let (Some(whole), Some(before), Some(after)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        matched = true;
        out.push_str(&text[last..whole.start()]);
        if whole.start() == 0 && prev.is_none() {
            at_start = true;
        }

        let left = out.chars().next_back().or(prev);
        let right = text[whole.end()..].chars().next().or(next);
        let line_edge = matches!(left, None | Some('\n')) || matches!(right, None | Some('\n'));
        let spaced = !before.as_str().is_empty() || !after.as_str().is_empty();
        let neighbour_space = matches!(left, Some(' ' | '\t')) || matches!(right, Some(' ' | '\t'));
        if spaced && !line_edge && !neighbour_space {
            out.push(' ');
        }
        last = whole.end();
    }
    if !matched {
        return text.to_string();
    }
    let at_end = last == text.len() && next.is_none();
    out.push_str(&text[last..]);

    let mut result = out.as_str();
    if at_start {
        result = result.trim_start();
    }
    if at_end {
        result = result.trim_end();
    }
    result.to_string()
}

fn join_non_empty(left: &str, separator: &str, right: &str) -> String {
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right.to_string(),
        (_, true) => left.to_string(),
        _ => format!("{left}{separator}{right}"),
    }
}

fn escape_for(text: &str, format: TextFormat) -> String {
    match format {
        TextFormat::Plain => text.to_string(),
        TextFormat::Html => escape_html(text),
    }
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Escape the characters Telegram's HTML parse mode treats as markup.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
