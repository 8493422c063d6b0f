//! Shared types, error model, and configuration for tgkb.
//!
//! This crate is the foundation depended on by all other tgkb crates.
//! It provides:
//! - [`TgkbError`], the unified run-level error type
//! - The record contract ([`PostRecord`], [`EnrichmentStatus`]) and its
//!   JSON Lines reader/writer
//! - Run reporting ([`RunSummary`], [`RunReport`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod records;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, EnrichmentSettings, LinkStyle, OpenRouterConfig, PathsConfig, RenderConfig,
    api_key, config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{Result, TgkbError};
pub use records::{output_meta, parse_records, read_records, to_jsonl, write_atomic, write_records};
pub use types::{
    EnrichmentStatus, OutputMeta, PostRecord, RECORD_SCHEMA_VERSION, RunId, RunReport, RunSummary,
};
