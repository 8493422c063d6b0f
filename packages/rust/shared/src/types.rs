//! Core domain types: the post record contract and run reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version of the intermediate record format.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    RECORD_SCHEMA_VERSION
}

// ---------------------------------------------------------------------------
// PostRecord
// ---------------------------------------------------------------------------

/// Where a record is in the enrichment lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

impl EnrichmentStatus {
    /// Whether the record has finished enrichment, successfully or not.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// One normalized Telegram post. Serialized as one JSON line in the
/// intermediate files shared by the convert, analyze and render stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    /// Intermediate format version; absent in a line means version 1.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Originating channel (derived from the export file name). Never empty.
    pub source: String,
    /// 1-based data row within the source file.
    #[serde(default)]
    pub row: usize,
    /// Raw date string as exported; formatting happens at render time.
    pub date: String,
    /// Post body. May be empty.
    pub text: String,
    #[serde(default)]
    pub link: Option<String>,
    /// AI-generated title, set once enrichment succeeds.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub enrichment_status: EnrichmentStatus,
}

impl PostRecord {
    /// Build a fresh, not-yet-enriched record.
    pub fn new(
        source: impl Into<String>,
        row: usize,
        date: impl Into<String>,
        text: impl Into<String>,
        link: Option<String>,
    ) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            source: source.into(),
            row,
            date: date.into(),
            text: text.into(),
            link,
            title: None,
            enrichment_status: EnrichmentStatus::Pending,
        }
    }

    /// Mark the record as successfully enriched with `title`.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self.enrichment_status = EnrichmentStatus::Success;
        self
    }

    /// Mark the record as failed. Any stale title is cleared.
    pub fn into_failed(mut self) -> Self {
        self.title = None;
        self.enrichment_status = EnrichmentStatus::Failed;
        self
    }
}

// ---------------------------------------------------------------------------
// Run reporting
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-stage counters surfaced at the end of every completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Rows read from all inputs (including ones later skipped).
    pub total: usize,
    /// Rows that became records.
    pub normalized: usize,
    /// Rows dropped as malformed.
    pub skipped: usize,
    pub enrich_success: usize,
    pub enrich_failed: usize,
}

/// Checksum entry for a written output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputMeta {
    pub filename: String,
    pub sha256: String,
    pub size_bytes: usize,
}

/// The `run.json` report written next to the rendered document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub run_id: RunId,
    pub tool_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Candidate models in fallback order.
    pub models: Vec<String>,
    pub summary: RunSummary,
    #[serde(default)]
    pub outputs: Vec<OutputMeta>,
}
