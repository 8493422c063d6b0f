//! Pipeline orchestration: convert → analyze → render.
//!
//! Each stage can run standalone against the intermediate JSON Lines files,
//! or all three run back to back via [`run_pipeline`]. [`run`] is the
//! in-memory form used when the caller already holds the raw sources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use tgkb_ingest::RawSource;
use tgkb_markdown::{RenderOptions, RenderedDocument};
use tgkb_openrouter::EnrichmentFailure;
use tgkb_shared::{
    AppConfig, EnrichmentSettings, EnrichmentStatus, OutputMeta, PathsConfig, PostRecord,
    RECORD_SCHEMA_VERSION, Result, RunId, RunReport, RunSummary, TgkbError,
};

use crate::cancel::CancellationToken;
use crate::enrichment::Enricher;

/// Stage 1 output in the work dir.
pub const COMBINED_FILE: &str = "combined_posts.jsonl";
/// Stage 2 output in the work dir.
pub const ANALYZED_FILE: &str = "analyzed_posts.jsonl";
/// Main document in the output dir.
pub const DOCUMENT_FILE: &str = "all_posts.md";
/// Standalone table of contents in the output dir.
pub const TOC_FILE: &str = "table_of_contents.md";
/// Run report in the output dir.
pub const REPORT_FILE: &str = "run.json";

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called each time a record reaches a terminal status.
    fn record_enriched(&self, current: usize, total: usize, record: &PostRecord);
    /// Called when a stage or run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn record_enriched(&self, _current: usize, _total: usize, _record: &PostRecord) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize every row of every source, in source then row order.
///
/// Malformed rows are skipped with a warning and counted in the summary.
pub fn normalize_sources(sources: &[RawSource]) -> (Vec<PostRecord>, RunSummary) {
    let mut records = Vec::new();
    let mut summary = RunSummary::default();

    for source in sources {
        for (idx, row) in source.rows.iter().enumerate() {
            summary.total += 1;
            let normalized = row
                .as_ref()
                .map_err(|e| e.clone())
                .and_then(|raw| tgkb_ingest::normalize(raw, &source.name));

            match normalized {
                Ok(record) => records.push(record),
                Err(e) => {
                    summary.skipped += 1;
                    warn!(source = %source.name, row = idx + 1, error = %e, "skipping malformed row");
                }
            }
        }
    }

    summary.normalized = records.len();
    (records, summary)
}

/// Abort when there is nothing to work with.
fn ensure_records(summary: &RunSummary) -> Result<()> {
    if summary.total == 0 {
        return Err(TgkbError::validation("no input rows found"));
    }
    if summary.normalized == 0 {
        return Err(TgkbError::validation(format!(
            "none of {} input rows could be normalized",
            summary.total
        )));
    }
    Ok(())
}

/// Fill the enrichment counters from record statuses.
fn count_enrichment(summary: &mut RunSummary, records: &[PostRecord]) {
    summary.enrich_success = records
        .iter()
        .filter(|r| r.enrichment_status == EnrichmentStatus::Success)
        .count();
    summary.enrich_failed = records
        .iter()
        .filter(|r| r.enrichment_status == EnrichmentStatus::Failed)
        .count();
}

// ---------------------------------------------------------------------------
// Enrichment driver
// ---------------------------------------------------------------------------

/// How a batch of records is enriched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichOptions {
    /// Records in flight at once.
    pub concurrency: usize,
    /// Pause after each record before its slot takes the next one.
    pub request_interval: Duration,
    /// Only the first `limit` records are considered.
    pub limit: Option<usize>,
}

impl From<&EnrichmentSettings> for EnrichOptions {
    fn from(settings: &EnrichmentSettings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            request_interval: settings.request_interval(),
            limit: None,
        }
    }
}

/// Result of [`enrich_records`]: every input record, in input order.
#[derive(Debug, Clone)]
pub struct EnrichOutcome {
    pub records: Vec<PostRecord>,
    /// Records that reached a terminal status during this call.
    pub completed: usize,
    /// Records this call set out to enrich.
    pub requested: usize,
    pub cancelled: bool,
}

/// Enrich records, at most `concurrency` at a time.
///
/// Records already titled successfully are left alone, as is everything past
/// `limit`. Output order always equals input order. On cancellation the
/// unfinished records are returned unchanged (still `pending`). A rejected
/// API key stops every worker and fails the whole call with a config error.
#[instrument(skip_all, fields(records = records.len(), concurrency = opts.concurrency))]
pub async fn enrich_records(
    enricher: &Enricher,
    mut records: Vec<PostRecord>,
    opts: EnrichOptions,
    token: &CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<EnrichOutcome> {
    let window = opts.limit.unwrap_or(records.len()).min(records.len());
    let todo: Vec<usize> = (0..window)
        .filter(|&i| records[i].enrichment_status != EnrichmentStatus::Success)
        .collect();
    let requested = todo.len();

    info!(requested, skipped_done = window - requested, "enriching records");

    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let halt = CancellationToken::new();
    let mut tasks: JoinSet<(usize, TaskResult)> = JoinSet::new();
    let mut completed = 0usize;

    for idx in todo {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = halt.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => permit
                .map_err(|e| TgkbError::Enrichment(format!("worker pool closed: {e}")))?,
        };

        let enricher = enricher.clone();
        let record = records[idx].clone();
        let token = token.clone();
        let halt = halt.clone();
        let pause = opts.request_interval;

        tasks.spawn(async move {
            let enriched = tokio::select! {
                biased;
                _ = halt.cancelled() => Ok(None),
                enriched = enricher.enrich_cancellable(&record, &token) => enriched,
            };
            match &enriched {
                // Set before the permit is released so no queued record starts.
                Err(_) => halt.cancel(),
                Ok(Some(_)) if !pause.is_zero() => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = halt.cancelled() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Ok(_) => {}
            }
            drop(permit);
            (idx, enriched)
        });

        while let Some(joined) = tasks.try_join_next() {
            apply(joined, &mut records, &mut completed, requested, progress)?;
        }
    }

    while let Some(joined) = tasks.join_next().await {
        apply(joined, &mut records, &mut completed, requested, progress)?;
    }

    let cancelled = completed < requested && token.is_cancelled();
    if cancelled {
        warn!(completed, requested, "enrichment cancelled");
    }

    Ok(EnrichOutcome {
        records,
        completed,
        requested,
        cancelled,
    })
}

type TaskResult = std::result::Result<Option<PostRecord>, EnrichmentFailure>;

fn apply(
    joined: std::result::Result<(usize, TaskResult), tokio::task::JoinError>,
    records: &mut [PostRecord],
    completed: &mut usize,
    total: usize,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    let (idx, enriched) =
        joined.map_err(|e| TgkbError::Enrichment(format!("enrichment task failed: {e}")))?;
    match enriched {
        Ok(Some(record)) => {
            *completed += 1;
            progress.record_enriched(*completed, total, &record);
            records[idx] = record;
        }
        Ok(None) => {}
        Err(failure) => {
            return Err(TgkbError::config(format!(
                "OpenRouter {failure}; check the configured API key"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory run
// ---------------------------------------------------------------------------

/// Everything produced by one in-memory run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub records: Vec<PostRecord>,
    pub document: RenderedDocument,
    pub summary: RunSummary,
}

/// Normalize, enrich and render `sources` without touching the filesystem.
#[instrument(skip_all, fields(sources = sources.len()))]
pub async fn run(
    sources: &[RawSource],
    enricher: &Enricher,
    opts: EnrichOptions,
    render_opts: &RenderOptions,
    token: &CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<RunOutput> {
    progress.phase("Normalizing rows");
    let (mut records, mut summary) = normalize_sources(sources);
    ensure_records(&summary)?;
    if let Some(limit) = opts.limit {
        records.truncate(limit);
    }

    progress.phase("Generating titles");
    let outcome = enrich_records(enricher, records, opts, token, progress).await?;
    if outcome.cancelled {
        return Err(TgkbError::Cancelled {
            completed: outcome.completed,
            total: outcome.requested,
        });
    }

    count_enrichment(&mut summary, &outcome.records);

    progress.phase("Rendering Markdown");
    let document = tgkb_markdown::render(&outcome.records, render_opts);

    progress.done(&summary);
    Ok(RunOutput {
        records: outcome.records,
        document,
        summary,
    })
}

// ---------------------------------------------------------------------------
// File-based stages
// ---------------------------------------------------------------------------

/// Output of a file-based stage.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub summary: RunSummary,
    pub outputs: Vec<OutputMeta>,
}

fn combined_path(paths: &PathsConfig) -> PathBuf {
    paths.work_dir.join(COMBINED_FILE)
}

fn analyzed_path(paths: &PathsConfig) -> PathBuf {
    paths.work_dir.join(ANALYZED_FILE)
}

fn read_nonempty(path: &Path) -> Result<Vec<PostRecord>> {
    let records = tgkb_shared::read_records(path)?;
    if records.is_empty() {
        return Err(TgkbError::validation(format!(
            "{} contains no records",
            path.display()
        )));
    }
    Ok(records)
}

/// Stage 1: every CSV export in the input dir → `combined_posts.jsonl`.
#[instrument(skip_all, fields(input = %paths.input_dir.display()))]
pub fn convert_stage(paths: &PathsConfig, progress: &dyn ProgressReporter) -> Result<StageOutcome> {
    progress.phase("Reading channel exports");
    let sources = tgkb_ingest::load_dir(&paths.input_dir)?;

    progress.phase("Normalizing rows");
    let (records, summary) = normalize_sources(&sources);
    ensure_records(&summary)?;

    let output = tgkb_shared::write_records(&combined_path(paths), &records)?;
    info!(
        total = summary.total,
        normalized = summary.normalized,
        skipped = summary.skipped,
        file = %output.filename,
        "convert stage complete"
    );

    progress.done(&summary);
    Ok(StageOutcome {
        summary,
        outputs: vec![output],
    })
}

/// Copy successful titles from an earlier analyze run onto matching records.
fn carry_over(records: &mut [PostRecord], previous: Vec<PostRecord>) -> usize {
    let done: HashMap<(String, usize), PostRecord> = previous
        .into_iter()
        .filter(|r| r.enrichment_status == EnrichmentStatus::Success)
        .map(|r| ((r.source.clone(), r.row), r))
        .collect();

    let mut reused = 0;
    for record in records.iter_mut() {
        if let Some(prev) = done.get(&(record.source.clone(), record.row)) {
            if prev.text == record.text && prev.date == record.date {
                *record = prev.clone();
                reused += 1;
            }
        }
    }
    reused
}

/// Stage 2: `combined_posts.jsonl` → `analyzed_posts.jsonl`.
///
/// Titles from an existing `analyzed_posts.jsonl` are reused for unchanged
/// records. The output is written even when cancelled, so a later run
/// resumes where this one stopped.
#[instrument(skip_all, fields(limit = ?opts.limit))]
pub async fn analyze_stage(
    paths: &PathsConfig,
    enricher: &Enricher,
    opts: EnrichOptions,
    token: &CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<StageOutcome> {
    let mut records = read_nonempty(&combined_path(paths))?;

    let analyzed = analyzed_path(paths);
    if analyzed.exists() {
        match tgkb_shared::read_records(&analyzed) {
            Ok(previous) => {
                let reused = carry_over(&mut records, previous);
                info!(reused, "reusing titles from previous analyze run");
            }
            Err(e) => warn!(error = %e, "ignoring unreadable previous analyze output"),
        }
    }

    progress.phase("Generating titles");
    let outcome = enrich_records(enricher, records, opts, token, progress).await?;
    let output = tgkb_shared::write_records(&analyzed, &outcome.records)?;

    if outcome.cancelled {
        return Err(TgkbError::Cancelled {
            completed: outcome.completed,
            total: outcome.requested,
        });
    }

    let mut summary = RunSummary {
        total: outcome.records.len(),
        normalized: outcome.records.len(),
        ..RunSummary::default()
    };
    count_enrichment(&mut summary, &outcome.records);

    progress.done(&summary);
    Ok(StageOutcome {
        summary,
        outputs: vec![output],
    })
}

/// Render records and write the document and table of contents.
fn write_documents(
    paths: &PathsConfig,
    records: &[PostRecord],
    render_opts: &RenderOptions,
) -> Result<Vec<OutputMeta>> {
    if let Some(pending) = records
        .iter()
        .find(|r| !r.enrichment_status.is_terminal())
    {
        return Err(TgkbError::validation(format!(
            "record {}:{} has not been analyzed yet; run `tgkb analyze` first",
            pending.source, pending.row
        )));
    }

    let document = tgkb_markdown::render(records, render_opts);
    let toc = tgkb_markdown::render_toc(records, render_opts);

    let doc_meta =
        tgkb_shared::write_atomic(&paths.output_dir.join(&render_opts.document_file), &document.markdown)?;
    let toc_meta = tgkb_shared::write_atomic(&paths.output_dir.join(TOC_FILE), &toc)?;

    info!(
        posts = document.stats.total,
        sources = document.stats.per_source.len(),
        dir = %paths.output_dir.display(),
        "markdown written"
    );

    Ok(vec![doc_meta, toc_meta])
}

/// Stage 3: `analyzed_posts.jsonl` → `all_posts.md` + `table_of_contents.md`.
#[instrument(skip_all)]
pub fn render_stage(
    paths: &PathsConfig,
    render_opts: &RenderOptions,
    progress: &dyn ProgressReporter,
) -> Result<StageOutcome> {
    let records = read_nonempty(&analyzed_path(paths))?;

    progress.phase("Rendering Markdown");
    let outputs = write_documents(paths, &records, render_opts)?;

    let mut summary = RunSummary {
        total: records.len(),
        normalized: records.len(),
        ..RunSummary::default()
    };
    count_enrichment(&mut summary, &records);

    progress.done(&summary);
    Ok(StageOutcome { summary, outputs })
}

/// All three stages back to back, then `run.json` in the output dir.
///
/// With a limit, only the first `limit` records are enriched and rendered.
#[instrument(skip_all, fields(limit = ?opts.limit))]
pub async fn run_pipeline(
    config: &AppConfig,
    enricher: &Enricher,
    opts: EnrichOptions,
    render_opts: &RenderOptions,
    token: &CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<RunReport> {
    let started_at = Utc::now();
    let run_id = RunId::new();
    let paths = &config.paths;
    info!(%run_id, "starting pipeline run");

    let converted = convert_stage(paths, progress)?;
    let mut summary = converted.summary;
    let mut outputs = converted.outputs;

    let mut records = read_nonempty(&combined_path(paths))?;
    if let Some(limit) = opts.limit {
        records.truncate(limit);
    }

    progress.phase("Generating titles");
    let outcome = enrich_records(enricher, records, opts, token, progress).await?;
    outputs.push(tgkb_shared::write_records(&analyzed_path(paths), &outcome.records)?);

    if outcome.cancelled {
        return Err(TgkbError::Cancelled {
            completed: outcome.completed,
            total: outcome.requested,
        });
    }
    count_enrichment(&mut summary, &outcome.records);

    progress.phase("Rendering Markdown");
    outputs.extend(write_documents(paths, &outcome.records, render_opts)?);

    let report = RunReport {
        schema_version: RECORD_SCHEMA_VERSION,
        run_id,
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        started_at,
        finished_at: Utc::now(),
        models: enricher.models().to_vec(),
        summary,
        outputs,
    };

    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| TgkbError::parse(format!("failed to serialize run report: {e}")))?;
    tgkb_shared::write_atomic(&paths.output_dir.join(REPORT_FILE), &json)?;

    info!(
        run_id = %report.run_id,
        total = summary.total,
        skipped = summary.skipped,
        enrich_failed = summary.enrich_failed,
        "pipeline run complete"
    );

    progress.done(&summary);
    Ok(report)
}
