//! Digest compiler: summarized items → one self-contained HTML document.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use html_escape::{encode_double_quoted_attribute, encode_text};

use crate::pipeline::types::{Digest, SummarizedItem};

/// Links shown per section.
pub const MAX_LINKS: usize = 3;

/// Link display text is cut to this many chars.
pub const LINK_TEXT_CHARS: usize = 50;

const STYLE: &str = r#"
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Arial, sans-serif; line-height: 1.6; color: #333; background-color: #f5f5f5; margin: 0; padding: 20px; }
        .container { max-width: 600px; margin: 0 auto; background-color: white; border-radius: 8px; box-shadow: 0 2px 4px rgba(0,0,0,0.1); overflow: hidden; }
        .header { background: linear-gradient(135deg, #667eea 0%, #764ba2 100%); color: white; padding: 30px 20px; text-align: center; }
        .header h1 { margin: 0 0 5px 0; font-size: 28px; }
        .header p { margin: 0; opacity: 0.9; font-size: 14px; }
        .content { padding: 20px; }
        .newsletter { margin-bottom: 30px; border-left: 4px solid #667eea; padding-left: 20px; }
        .newsletter-source { font-weight: 600; color: #667eea; font-size: 16px; }
        .newsletter-subject { color: #555; font-size: 14px; margin-bottom: 8px; }
        .summary { margin: 12px 0; color: #444; font-size: 14px; line-height: 1.8; }
        .summary ul { margin: 8px 0; padding-left: 20px; }
        .summary li { margin-bottom: 8px; }
        .read-more { margin-top: 10px; }
        .read-more a { color: #667eea; text-decoration: none; font-size: 13px; font-weight: 500; }
        .footer { background-color: #f9f9f9; padding: 20px; text-align: center; font-size: 12px; color: #666; border-top: 1px solid #eee; }
"#;

/// Builds digests. Pure and infallible.
#[derive(Debug, Clone, Default)]
pub struct DigestCompiler;

impl DigestCompiler {
    pub fn new() -> Self {
        Self
    }

    pub fn compile(&self, items: &[SummarizedItem]) -> Digest {
        self.compile_at(items, Utc::now())
    }

    /// Compile with an explicit timestamp for the date stamp.
    pub fn compile_at(&self, items: &[SummarizedItem], generated_at: DateTime<Utc>) -> Digest {
        let mut sections = String::new();
        for item in items {
            render_section(&mut sections, item);
        }

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>{STYLE}    </style>
</head>
<body>
    <div class="container">
        <div class="header">
            <h1>📨 Your Daily Digest</h1>
            <p>{date}</p>
        </div>
        <div class="content">
{sections}        </div>
        <div class="footer">
            <p>Newsletter Distiller • Automated intelligence summary</p>
        </div>
    </div>
</body>
</html>"#,
            date = generated_at.format("%B %d, %Y"),
        );

        tracing::info!(sections = items.len(), "Digest compiled");

        Digest {
            html,
            generated_at,
            section_count: items.len(),
        }
    }
}

fn render_section(out: &mut String, item: &SummarizedItem) {
    let source = &item.item;
    // Writing into a String cannot fail.
    let _ = writeln!(out, r#"            <div class="newsletter">"#);
    let _ = writeln!(
        out,
        r#"                <div class="newsletter-source">{}</div>"#,
        encode_text(&source.sender)
    );
    if !source.subject.trim().is_empty() {
        let _ = writeln!(
            out,
            r#"                <div class="newsletter-subject">{}</div>"#,
            encode_text(&source.subject)
        );
    }

    let _ = writeln!(out, r#"                <div class="summary"><ul>"#);
    for bullet in item.bullets() {
        let _ = writeln!(out, "                    <li>{}</li>", encode_text(bullet));
    }
    let _ = writeln!(out, "                </ul></div>");

    if !source.links.is_empty() {
        let _ = writeln!(out, r#"                <div class="read-more">"#);
        for link in source.links.iter().take(MAX_LINKS) {
            let text: String = link.text.chars().take(LINK_TEXT_CHARS).collect();
            let _ = writeln!(
                out,
                r#"                    <a href="{}" target="_blank">→ {}</a><br>"#,
                encode_double_quoted_attribute(&link.url),
                encode_text(&text)
            );
        }
        let _ = writeln!(out, "                </div>");
    }
    let _ = writeln!(out, "            </div>");
}
