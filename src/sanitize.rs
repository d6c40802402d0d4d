//! Cleanup policy for text coming back from the extraction service.
//!
//! Extracted documents carry markup, entity noise, and metadata headers
//! (`Author: ...`, `Content-Type: ...`) alongside the prose. [`sanitize`]
//! keeps the prose and bounds the size of what gets stored and indexed.
//!
//! The function is total and idempotent: feeding its output back in returns
//! the same string.

use std::sync::LazyLock;

use regex::Regex;

/// Longest body, in characters, kept after sanitizing.
pub const MAX_CHARS: usize = 100_000;

/// Line appended when the body was cut at [`MAX_CHARS`].
pub const TRUNCATION_MARKER: &str = "[truncated]";

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern"));

static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)&[#a-z0-9]+;").expect("entity pattern")
});

static METADATA_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z\s]+:").expect("metadata pattern"));

const LINK_SCHEMES: [&str; 3] = ["mailto:", "http:", "https:"];

/// Clean raw extracted text.
///
/// # Examples
///
/// ```
/// use sift::sanitize::sanitize;
///
/// let raw = "<p>Author: Jane</p>\n<p>Quarterly results &amp; outlook</p>";
/// assert_eq!(sanitize(raw), "Quarterly results outlook");
/// ```
pub fn sanitize(raw: &str) -> String {
    let text = strip_control(raw);
    let text = strip_markup(text);
    let text = collapse_whitespace(&text);
    let text = keep_prose_lines(&text);
    truncate(text)
}

fn is_stripped_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0B}'..='\u{1F}') && !c.is_whitespace()
}

fn strip_control(text: &str) -> String {
    text.chars().filter(|c| !is_stripped_control(*c)).collect()
}

/// Remove tags and entities until none are left. A single pass can expose a
/// new one, e.g. `&&x;amp;` becomes `&amp;`.
fn strip_markup(mut text: String) -> String {
    loop {
        let without_tags = TAG.replace_all(&text, "");
        let stripped = ENTITY.replace_all(&without_tags, "").into_owned();
        if stripped.len() == text.len() {
            return stripped;
        }
        text = stripped;
    }
}

/// Runs containing a line break become `\n`, other runs a single space.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run: Option<bool> = None;

    for c in text.chars() {
        if c.is_whitespace() {
            let breaks = c == '\n' || c == '\r';
            run = Some(run.unwrap_or(false) || breaks);
            continue;
        }
        if let Some(breaks) = run.take() {
            out.push(if breaks { '\n' } else { ' ' });
        }
        out.push(c);
    }

    out
}

fn keep_prose_lines(text: &str) -> String {
    text.split(['\n', ';'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !METADATA_LINE.is_match(line))
        .filter(|line| !LINK_SCHEMES.iter().any(|s| line.starts_with(s)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate(text: String) -> String {
    let marker_suffix = format!("\n{TRUNCATION_MARKER}");
    let (body, marked) = match text.strip_suffix(&marker_suffix) {
        Some(body) => (body, true),
        None => (text.as_str(), false),
    };

    match body.char_indices().nth(MAX_CHARS) {
        Some((cut, _)) => {
            let mut kept = body[..cut].trim_end().to_string();
            kept.push_str(&marker_suffix);
            kept
        }
        None if marked => text,
        None => body.to_string(),
    }
}
