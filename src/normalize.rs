//! Content normalizer: raw message body → clean, bounded text plus links.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};

use crate::config::NormalizerConfig;
use crate::pipeline::types::{Link, NormalizedItem, RawMessage};
use crate::source::mime::extract_body;

/// Appended to text that was cut to fit the token budget.
pub const TRUNCATION_MARKER: &str = "\n\n[TRUNCATED - Content was too long]";

/// Rough chars-per-token ratio used for budgeting.
pub const CHARS_PER_TOKEN: usize = 4;

const TEXT_ELEMENTS: &str = "p, div, li, td, h1, h2, h3";
const HIDDEN_ELEMENTS: [&str; 3] = ["script", "style", "noscript"];
const PARAGRAPH_SEPARATOR: &str = "\n\n";

static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n[ \t]*\r?\n").expect("valid blank-line regex"));

/// Converts [`RawMessage`] bodies into [`NormalizedItem`]s. Never fails.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn normalize(&self, message: &RawMessage) -> NormalizedItem {
        let raw = extract_body(&message.body);

        let (text, links) = match catch_unwind(AssertUnwindSafe(|| extract_text_and_links(&raw)))
        {
            Ok(extracted) => extracted,
            Err(_) => {
                tracing::error!(id = %message.id, "HTML parser panicked, using empty body");
                (String::new(), Vec::new())
            }
        };
        let body = truncate(&text, self.config.max_tokens);

        tracing::debug!(
            id = %message.id,
            chars = body.chars().count(),
            links = links.len(),
            "Normalized message"
        );

        NormalizedItem {
            source_id: message.id.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            received_at: message.received_at,
            body,
            links,
        }
    }
}

/// Visible text and outbound links of a body, HTML or plain.
pub fn extract_text_and_links(raw: &str) -> (String, Vec<Link>) {
    let document = Html::parse_document(raw);
    if !has_markup(&document) {
        return (plain_paragraphs(raw), Vec::new());
    }

    let (Ok(text_sel), Ok(link_sel)) = (Selector::parse(TEXT_ELEMENTS), Selector::parse("a[href]"))
    else {
        return (String::new(), Vec::new());
    };

    let paragraphs: Vec<String> = document
        .select(&text_sel)
        .map(visible_text)
        .filter(|t| !t.is_empty())
        .collect();

    let links = document
        .select(&link_sel)
        .filter_map(|a| {
            let url = a.value().attr("href")?.trim();
            let text = visible_text(a);
            (url.starts_with("http") && !text.is_empty()).then(|| Link {
                text,
                url: url.to_string(),
            })
        })
        .collect();

    (paragraphs.join(PARAGRAPH_SEPARATOR), links)
}

/// True when the parse produced a real HTML element. Angle-bracketed addresses
/// in plain text (`<editor@example.com>`) parse as elements too, so only
/// known tag names count.
fn has_markup(document: &Html) -> bool {
    document.root_element().descendants().any(|node| {
        node.value()
            .as_element()
            .is_some_and(|e| is_html_element(e.name()))
    })
}

fn is_html_element(name: &str) -> bool {
    matches!(
        name,
        "a"
            | "article"
            | "b"
            | "blockquote"
            | "br"
            | "center"
            | "div"
            | "em"
            | "font"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "hr"
            | "i"
            | "img"
            | "li"
            | "meta"
            | "ol"
            | "p"
            | "pre"
            | "section"
            | "span"
            | "strong"
            | "style"
            | "table"
            | "td"
            | "th"
            | "title"
            | "tr"
            | "u"
            | "ul"
    )
}

/// Concatenation of trimmed text nodes, skipping hidden subtrees.
fn visible_text(element: ElementRef<'_>) -> String {
    element
        .descendants()
        .filter_map(|node| match node.value() {
            Node::Text(text) => Some((node, text)),
            _ => None,
        })
        .filter(|(node, _)| {
            !node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .is_some_and(|e| HIDDEN_ELEMENTS.contains(&e.name()))
            })
        })
        .map(|(_, text)| text.trim())
        .collect()
}

fn plain_paragraphs(raw: &str) -> String {
    BLANK_LINE
        .split(raw)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(PARAGRAPH_SEPARATOR)
}

/// Bound `text` to roughly `max_tokens` tokens.
///
/// Cuts at `max_tokens * 4` chars, backs off to the last blank line inside
/// the window, and appends [`TRUNCATION_MARKER`]. Already-truncated text that
/// fits is returned as-is.
pub fn truncate(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    let content = text.strip_suffix(TRUNCATION_MARKER).unwrap_or(text);
    if content.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut = content
        .char_indices()
        .nth(max_chars)
        .map_or(content.len(), |(i, _)| i);
    let window = &content[..cut];
    let kept = match window.rfind(PARAGRAPH_SEPARATOR) {
        Some(pos) if pos > 0 => &window[..pos],
        _ => window,
    };
    format!("{kept}{TRUNCATION_MARKER}")
}
