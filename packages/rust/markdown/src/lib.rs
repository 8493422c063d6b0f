//! Deterministic Markdown rendering of enriched post records.
//!
//! [`render`] turns the ordered record set into one document: a statistics
//! section (posts per source in first-appearance order, plus totals), an
//! index linking to every post, and one section per post. Rendering is pure:
//! the same records and options always produce byte-identical output.

mod format;

use std::collections::{HashMap, HashSet};

use tgkb_shared::{EnrichmentStatus, LinkStyle, PostRecord, RenderConfig};
use tracing::{debug, instrument};

pub use format::{FALLBACK_TITLE_CHARS, UNKNOWN_DATE, UNTITLED, fallback_title, format_date};

use format::{escape_link_text, format_body, single_line, wikilink_target};

/// Marker rendered for posts without a permalink.
pub const NO_LINK: &str = "_no link_";

/// Default file name of the main document (target of TOC links).
pub const DEFAULT_DOCUMENT_FILE: &str = "all_posts.md";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Options for rendering.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// H1 of the document.
    pub document_title: String,
    pub link_style: LinkStyle,
    /// Shown under the H1 when set. Callers pass it in so rendering stays pure.
    pub generated_at: Option<String>,
    /// File name of the main document, used by [`render_toc`] links.
    pub document_file: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from(&RenderConfig::default())
    }
}

impl From<&RenderConfig> for RenderOptions {
    fn from(config: &RenderConfig) -> Self {
        Self {
            document_title: config.document_title.clone(),
            link_style: config.link_style,
            generated_at: None,
            document_file: DEFAULT_DOCUMENT_FILE.to_string(),
        }
    }
}

/// Counts shown in the statistics section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub total: usize,
    /// `(source, count)` in order of first appearance.
    pub per_source: Vec<(String, usize)>,
    /// Posts rendered with an AI-generated title.
    pub ai_titles: usize,
    /// Posts rendered with a title derived from their text.
    pub fallback_titles: usize,
}

/// Output of [`render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub markdown: String,
    pub stats: RenderStats,
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Compute per-source counts (first-appearance order) and title counts.
pub fn compute_stats(records: &[PostRecord]) -> RenderStats {
    let mut per_source: Vec<(String, usize)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut ai_titles = 0;

    for record in records {
        match index.get(record.source.as_str()) {
            Some(&i) => per_source[i].1 += 1,
            None => {
                index.insert(record.source.as_str(), per_source.len());
                per_source.push((record.source.clone(), 1));
            }
        }
        if ai_title(record).is_some() {
            ai_titles += 1;
        }
    }

    RenderStats {
        total: records.len(),
        per_source,
        ai_titles,
        fallback_titles: records.len() - ai_titles,
    }
}

/// Title shown for a record: the AI title when enrichment succeeded,
/// otherwise one derived from the text.
pub fn display_title(record: &PostRecord) -> String {
    ai_title(record).unwrap_or_else(|| fallback_title(&record.text))
}

fn ai_title(record: &PostRecord) -> Option<String> {
    if record.enrichment_status != EnrichmentStatus::Success {
        return None;
    }
    record
        .title
        .as_deref()
        .map(single_line)
        .filter(|t| !t.is_empty())
}

/// Anchor id of the `n`th (1-based) post section.
pub fn anchor_id(n: usize) -> String {
    format!("post-{n}")
}

/// Section heading of every record, in record order.
///
/// Wikilinks address a section by its heading text, so in that style each
/// heading is the link-safe form of its title, made unique with a ` (n)`
/// suffix. Anchor links address sections by id and keep the titles as is.
fn section_headings(records: &[PostRecord], style: LinkStyle) -> Vec<String> {
    let titles = records.iter().map(display_title);
    if style == LinkStyle::Anchor {
        return titles.collect();
    }

    let mut seen: HashSet<String> = HashSet::new();
    titles
        .map(|title| {
            let base = match wikilink_target(&title) {
                t if t.is_empty() => UNTITLED.to_string(),
                t => t,
            };
            let mut heading = base.clone();
            let mut n = 2;
            while !seen.insert(heading.clone()) {
                heading = format!("{base} ({n})");
                n += 1;
            }
            heading
        })
        .collect()
}

/// Render the full document.
#[instrument(skip_all, fields(records = records.len()))]
pub fn render(records: &[PostRecord], opts: &RenderOptions) -> RenderedDocument {
    let stats = compute_stats(records);
    let titles = section_headings(records, opts.link_style);
    let mut lines: Vec<String> = Vec::new();

    // Header
    lines.push(format!("# {}", single_line(&opts.document_title)));
    lines.push(String::new());
    if let Some(at) = &opts.generated_at {
        lines.push(format!("*Generated: {at}*"));
        lines.push(String::new());
    }

    // Statistics
    lines.push("## Statistics".into());
    lines.push(String::new());
    lines.push(format!("- **Total posts:** {}", stats.total));
    lines.push(format!("- **Sources:** {}", stats.per_source.len()));
    lines.push(format!("- **AI titles:** {}", stats.ai_titles));
    lines.push(format!("- **Fallback titles:** {}", stats.fallback_titles));
    lines.push(String::new());
    lines.push("### Posts per source".into());
    lines.push(String::new());
    for (source, count) in &stats.per_source {
        lines.push(format!("- {source}: {count}"));
    }
    lines.push(String::new());

    // Index
    lines.push("## Contents".into());
    lines.push(String::new());
    for (i, (record, title)) in records.iter().zip(&titles).enumerate() {
        let n = i + 1;
        let link = match opts.link_style {
            LinkStyle::Anchor => format!("[{}](#{})", escape_link_text(title), anchor_id(n)),
            LinkStyle::Wikilink => format!("[[#{title}]]"),
        };
        lines.push(format!(
            "{n}. {link} - {} ({})",
            format_date(&record.date),
            record.source
        ));
    }
    lines.push(String::new());
    lines.push("---".into());
    lines.push(String::new());

    // Posts
    for (i, (record, title)) in records.iter().zip(&titles).enumerate() {
        push_post(&mut lines, i + 1, record, title, opts.link_style);
    }

    let mut markdown = lines.join("\n");
    markdown.push('\n');

    debug!(
        total = stats.total,
        sources = stats.per_source.len(),
        bytes = markdown.len(),
        "document rendered"
    );

    RenderedDocument { markdown, stats }
}

fn push_post(lines: &mut Vec<String>, n: usize, record: &PostRecord, title: &str, style: LinkStyle) {
    if style == LinkStyle::Anchor {
        lines.push(format!("<a id=\"{}\"></a>", anchor_id(n)));
        lines.push(String::new());
    }
    lines.push(format!("### {title}"));
    lines.push(String::new());
    lines.push(format!("- **Date:** {}", format_date(&record.date)));
    lines.push(format!("- **Source:** {}", record.source));
    match record.link.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        Some(link) => lines.push(format!("- **Link:** <{link}>")),
        None => lines.push(format!("- **Link:** {NO_LINK}")),
    }
    lines.push(String::new());

    let body = format_body(&record.text);
    if !body.is_empty() {
        lines.push(body);
        lines.push(String::new());
    }

    lines.push("---".into());
    lines.push(String::new());
}

/// Render a standalone table of contents grouped by source (first-appearance
/// order), numbered within each source, linking into the main document.
pub fn render_toc(records: &[PostRecord], opts: &RenderOptions) -> String {
    let stats = compute_stats(records);
    let titles = section_headings(records, opts.link_style);
    let mut lines: Vec<String> = vec!["# Table of contents".into(), String::new()];
    let doc_stem = opts
        .document_file
        .strip_suffix(".md")
        .unwrap_or(&opts.document_file);

    for (source, _) in &stats.per_source {
        lines.push(format!("## {source}"));
        lines.push(String::new());

        let in_source = records
            .iter()
            .enumerate()
            .filter(|(_, r)| &r.source == source);
        for (k, (i, record)) in in_source.enumerate() {
            let title = &titles[i];
            let link = match opts.link_style {
                LinkStyle::Anchor => format!(
                    "[{}]({}#{})",
                    escape_link_text(title),
                    opts.document_file,
                    anchor_id(i + 1)
                ),
                LinkStyle::Wikilink => format!("[[{doc_stem}#{title}]]"),
            };
            lines.push(format!("{}. {link} - {}", k + 1, format_date(&record.date)));
        }
        lines.push(String::new());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
