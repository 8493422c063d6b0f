//! Formatting passes for post bodies, dates and titles.
//!
//! Each body pass is a function `&str -> String` applied in sequence.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;

/// Longest fallback title, in chars.
pub const FALLBACK_TITLE_CHARS: usize = 60;

/// Title used when a post has no text to derive one from.
pub const UNTITLED: &str = "Untitled post";

/// Shown in place of an unparsable, empty date.
pub const UNKNOWN_DATE: &str = "unknown date";

/// Naive date-time layouts seen in Telegram exports.
const DATETIME_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

/// Run the body formatting pipeline on a post's text.
pub(crate) fn format_body(text: &str) -> String {
    let mut result = text.replace("\r\n", "\n");

    result = escape_headings(&result);
    result = build_blocks(&result);

    result
}

// ---------------------------------------------------------------------------
// Pass 1: Escape leading `#` so post text never opens a document heading
// ---------------------------------------------------------------------------

fn escape_headings(text: &str) -> String {
    static HEADING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^(\s*)#").expect("valid regex"));

    HEADING_RE.replace_all(text, r"$1\#").to_string()
}

// ---------------------------------------------------------------------------
// Pass 2: Lines → paragraphs and list items
// ---------------------------------------------------------------------------

/// One formatted line of a post body.
enum Block {
    Item(String),
    Para(String),
}

/// `1)`..`9)` become ordered items, `•`, `- `, `* ` become bullets, other
/// lines become paragraphs. Consecutive items stay in one list.
fn build_blocks(text: &str) -> String {
    static NUMBERED_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([1-9])\)\s*(.*)$").expect("valid regex"));
    static BULLET_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(?:•|[-*]\s)\s*(.*)$").expect("valid regex"));

    let blocks: Vec<Block> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if let Some(caps) = NUMBERED_RE.captures(line) {
                Block::Item(format!("{}. {}", &caps[1], caps[2].trim()))
            } else if let Some(caps) = BULLET_RE.captures(line) {
                Block::Item(format!("- {}", caps[1].trim()))
            } else {
                Block::Para(line.to_string())
            }
        })
        .collect();

    let mut out = String::new();
    for (i, block) in blocks.iter().enumerate() {
        if i > 0 {
            let joined_list =
                matches!((&blocks[i - 1], block), (Block::Item(_), Block::Item(_)));
            out.push_str(if joined_list { "\n" } else { "\n\n" });
        }
        match block {
            Block::Item(s) | Block::Para(s) => out.push_str(s),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Render an export date as `YYYY-MM-DD HH:MM`, or keep it raw.
pub fn format_date(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return UNKNOWN_DATE.to_string();
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.naive_local().format("%Y-%m-%d %H:%M").to_string();
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return dt.format("%Y-%m-%d %H:%M").to_string();
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return d.format("%Y-%m-%d").to_string();
    }

    raw.to_string()
}

// ---------------------------------------------------------------------------
// Titles
// ---------------------------------------------------------------------------

/// Title derived from the first line of text, for posts without an AI title.
pub fn fallback_title(text: &str) -> String {
    let first_line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let line = single_line(first_line);

    if line.is_empty() {
        return UNTITLED.to_string();
    }

    match line.char_indices().nth(FALLBACK_TITLE_CHARS) {
        Some((idx, _)) => format!("{}…", line[..idx].trim_end()),
        None => line,
    }
}

/// Collapse all whitespace runs (including newlines) to single spaces.
pub(crate) fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Make a title safe inside `[...]` link text.
pub(crate) fn escape_link_text(title: &str) -> String {
    title.replace('[', "\\[").replace(']', "\\]")
}

/// Obsidian wikilink targets cannot contain `[`, `]`, `|` or `#`.
pub(crate) fn wikilink_target(title: &str) -> String {
    title
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | '|' | '#'))
        .collect::<String>()
        .trim()
        .to_string()
}
