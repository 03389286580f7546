//! Summarization prompt and bullet parsing.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

/// System preamble for chat-style backends.
pub const SYSTEM_PREAMBLE: &str =
    "You are a professional research assistant specializing in synthesizing information.";

static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.)]\s+").expect("valid numbered-bullet regex"));

const BULLET_MARKERS: [char; 3] = ['-', '•', '*'];

/// How terse the bullets should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummaryStyle {
    /// One to two sentences per bullet.
    #[default]
    Neutral,
    /// One sentence per bullet.
    Concise,
}

impl FromStr for SummaryStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "neutral" => Ok(Self::Neutral),
            "concise" => Ok(Self::Concise),
            other => Err(format!(
                "unknown summary style '{other}' (expected 'neutral' or 'concise')"
            )),
        }
    }
}

/// Build the user prompt for one newsletter.
pub fn build_prompt(sender: &str, content: &str, style: SummaryStyle) -> String {
    let length = match style {
        SummaryStyle::Neutral => "1-2 sentences each",
        SummaryStyle::Concise => "a single short sentence each",
    };
    format!(
        "You are a professional research assistant. Below is a newsletter from {sender}.\n\
         \n\
         NEWSLETTER CONTENT:\n\
         {content}\n\
         \n\
         Please summarize the top 3 most important takeaways into concise bullet points ({length}).\n\
         Maintain a neutral, informative tone.\n\
         \n\
         Provide only the bullet points, starting each with a dash (-)."
    )
}

/// Strip one leading bullet or `N.`/`N)` marker from a trimmed line.
fn strip_marker(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix(BULLET_MARKERS)
        && (rest.is_empty() || rest.starts_with(char::is_whitespace))
    {
        return rest.trim();
    }
    match NUMBERED.find(line) {
        Some(m) => line[m.end()..].trim(),
        None => line,
    }
}

/// Non-blank lines of a backend response with bullet markers removed,
/// capped at three. Empty when nothing usable came back.
pub fn parse_bullets(response: &str) -> Vec<String> {
    response
        .lines()
        .map(|l| strip_marker(l.trim()))
        .filter(|l| !l.is_empty())
        .take(3)
        .map(str::to_string)
        .collect()
}
