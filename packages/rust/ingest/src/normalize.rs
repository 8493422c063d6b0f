//! Raw tabular row → [`PostRecord`] normalization.

use tgkb_shared::PostRecord;

/// Accepted names for the post body, in order of preference.
pub const TEXT_COLUMNS: [&str; 2] = ["text", "content"];

/// Accepted names for the post date.
pub const DATE_COLUMNS: [&str; 1] = ["date"];

/// Accepted names for the post permalink.
pub const LINK_COLUMNS: [&str; 2] = ["link", "url"];

/// Why a single row could not become a record. Row-local: the row is
/// skipped and the run continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizationError {
    #[error("missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("unparsable row: {reason}")]
    UnparsableRow { reason: String },
}

/// One data row of a tabular export: `(column name, value)` in header order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based data row number within its file (header excluded).
    pub row: usize,
    pub fields: Vec<(String, String)>,
}

impl RawRow {
    pub fn new<K, V>(row: usize, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            row,
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up a column, ignoring case, surrounding whitespace and a BOM.
    /// When several headers match, the leftmost wins.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| clean_header(k).eq_ignore_ascii_case(column))
            .map(|(_, v)| v.as_str())
    }

    /// First of `columns` that is present with a non-blank value.
    fn first_filled(&self, columns: &[&str]) -> Option<&str> {
        columns
            .iter()
            .filter_map(|c| self.get(c))
            .find(|v| !v.trim().is_empty())
    }
}

/// Convert one raw row into a pending [`PostRecord`].
///
/// Requires a non-blank text column (`text`, else `content`) and a non-blank
/// `date`. A missing or blank link is not an error.
pub fn normalize(raw: &RawRow, source: &str) -> Result<PostRecord, NormalizationError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(NormalizationError::MissingField { field: "source" });
    }

    let text = raw
        .first_filled(&TEXT_COLUMNS)
        .ok_or(NormalizationError::MissingField { field: "text" })?;
    let date = raw
        .first_filled(&DATE_COLUMNS)
        .ok_or(NormalizationError::MissingField { field: "date" })?;
    let link = raw.first_filled(&LINK_COLUMNS).map(clean_value);

    Ok(PostRecord::new(
        source,
        raw.row,
        clean_value(date),
        clean_value(text),
        link,
    ))
}

/// Trim, unify line endings and collapse doubled newlines.
pub fn clean_value(value: &str) -> String {
    value
        .replace("\r\n", "\n")
        .trim()
        .replace("\n\n", "\n")
}

fn clean_header(header: &str) -> &str {
    header.trim_start_matches('\u{feff}').trim()
}
