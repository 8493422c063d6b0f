//! Channel export loading and normalization.
//!
//! Reads every `*.csv` export in a directory (sniffing encoding and
//! delimiter), turns each data row into a [`RawRow`], and normalizes rows into
//! [`tgkb_shared::PostRecord`]s. The source identifier of a row is the stem of
//! the file it came from.

mod detect;
mod normalize;

use std::path::{Path, PathBuf};

use tgkb_shared::{Result, TgkbError};
use tracing::{debug, info, instrument, warn};

pub use detect::{Decoded, decode, delimiter_name, sniff_delimiter};
pub use normalize::{
    DATE_COLUMNS, LINK_COLUMNS, NormalizationError, RawRow, TEXT_COLUMNS, clean_value, normalize,
};

/// File extension of channel exports.
const EXPORT_EXTENSION: &str = "csv";

/// Rows read from one export file, in file order.
#[derive(Debug, Clone)]
pub struct RawSource {
    /// Source identifier (file stem).
    pub name: String,
    /// File the rows were read from, if any.
    pub path: Option<PathBuf>,
    pub encoding: &'static str,
    pub delimiter: u8,
    /// Each data row, or the reason it could not be split into fields.
    pub rows: Vec<std::result::Result<RawRow, NormalizationError>>,
}

impl RawSource {
    /// Number of data rows read, including unparsable ones.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Load every CSV export in `dir`, sorted by file name.
///
/// A missing or unreadable directory is fatal. An individual file that
/// cannot be read is skipped with a warning.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn load_dir(dir: &Path) -> Result<Vec<RawSource>> {
    let entries = std::fs::read_dir(dir).map_err(|e| TgkbError::io(dir, e))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_export(p))
        .collect();
    files.sort();

    info!(files = files.len(), "found channel exports");

    let mut sources = Vec::with_capacity(files.len());
    for path in &files {
        match load_file(path) {
            Ok(source) => sources.push(source),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable export"),
        }
    }

    Ok(sources)
}

/// Load one CSV export file.
pub fn load_file(path: &Path) -> Result<RawSource> {
    let bytes = std::fs::read(path).map_err(|e| TgkbError::io(path, e))?;
    let name = source_name(path);
    let decoded = decode(&bytes);

    let mut source = parse_csv(&name, &decoded.text);
    source.path = Some(path.to_path_buf());
    source.encoding = decoded.encoding;

    info!(
        source = %source.name,
        encoding = source.encoding,
        delimiter = delimiter_name(source.delimiter),
        rows = source.row_count(),
        "export loaded"
    );

    Ok(source)
}

/// Split already-decoded CSV text into rows keyed by header name.
///
/// Rows whose field count differs from the header become
/// [`NormalizationError::UnparsableRow`] entries.
pub fn parse_csv(name: &str, text: &str) -> RawSource {
    let delimiter = sniff_delimiter(text);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(false)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|s| s.to_string()).collect(),
        Err(e) => {
            warn!(source = name, error = %e, "export has no readable header");
            Vec::new()
        }
    };

    let mut rows = Vec::new();
    if !headers.is_empty() {
        for (idx, record) in reader.records().enumerate() {
            let row = idx + 1;
            match record {
                Ok(record) => rows.push(Ok(RawRow::new(
                    row,
                    headers.iter().cloned().zip(record.iter().map(str::to_string)),
                ))),
                Err(e) => {
                    debug!(source = name, row, error = %e, "unparsable CSV row");
                    rows.push(Err(NormalizationError::UnparsableRow {
                        reason: format!("row {row}: {e}"),
                    }));
                }
            }
        }
    }

    RawSource {
        name: name.to_string(),
        path: None,
        encoding: "utf-8",
        delimiter,
        rows,
    }
}

/// Source identifier for an export file: its stem, or the full name.
pub fn source_name(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_export(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(EXPORT_EXTENSION))
}
