//! Core pipeline orchestration and domain logic for tgkb.
//!
//! This crate ties together export loading, title enrichment and Markdown
//! rendering into the convert → analyze → render stages and the end-to-end
//! run.

pub mod cancel;
pub mod enrichment;
pub mod pipeline;

pub use cancel::CancellationToken;
pub use enrichment::{Enricher, FallbackState, RetryPolicy};
pub use pipeline::{
    EnrichOptions, EnrichOutcome, ProgressReporter, RunOutput, SilentProgress, StageOutcome,
    analyze_stage, convert_stage, enrich_records, normalize_sources, render_stage, run,
    run_pipeline,
};
