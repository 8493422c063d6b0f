//! JSON Lines reader/writer for the intermediate record files.
//!
//! The convert, analyze and render stages can be run independently, so the
//! on-disk shape of [`PostRecord`] is a contract: one object per line,
//! versioned by `schema_version`.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, TgkbError};
use crate::types::{OutputMeta, PostRecord, RECORD_SCHEMA_VERSION};

/// Parse JSON Lines text into records.
///
/// Blank lines are ignored and undecodable lines are skipped with a warning.
/// A record written by a newer schema version fails the whole read.
pub fn parse_records(content: &str) -> Result<Vec<PostRecord>> {
    let mut records = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line_num = idx + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: PostRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_num, error = %e, "skipping undecodable record line");
                continue;
            }
        };

        if record.schema_version > RECORD_SCHEMA_VERSION {
            return Err(TgkbError::validation(format!(
                "line {line_num}: unsupported schema_version {} (max {RECORD_SCHEMA_VERSION})",
                record.schema_version
            )));
        }

        records.push(record);
    }

    Ok(records)
}

/// Read a JSON Lines record file.
pub fn read_records(path: &Path) -> Result<Vec<PostRecord>> {
    let content = std::fs::read_to_string(path).map_err(|e| TgkbError::io(path, e))?;
    let records = parse_records(&content)?;
    debug!(path = %path.display(), count = records.len(), "records loaded");
    Ok(records)
}

/// Serialize records as JSON Lines (trailing newline included).
pub fn to_jsonl(records: &[PostRecord]) -> Result<String> {
    let mut out = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| TgkbError::parse(format!("failed to serialize record: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Write records to `path` atomically, creating parent directories.
pub fn write_records(path: &Path, records: &[PostRecord]) -> Result<OutputMeta> {
    let content = to_jsonl(records)?;
    write_atomic(path, &content)
}

/// Write `content` to a temp file beside `path`, then rename over it.
pub fn write_atomic(path: &Path, content: &str) -> Result<OutputMeta> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| TgkbError::io(parent, e))?;
        }
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| TgkbError::validation(format!("not a file path: {}", path.display())))?;
    let temp = path.with_file_name(format!(".{filename}.tmp"));

    std::fs::write(&temp, content).map_err(|e| TgkbError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| TgkbError::io(path, e))?;

    Ok(output_meta(&filename, content))
}

/// Checksum metadata for written content.
pub fn output_meta(filename: &str, content: &str) -> OutputMeta {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    OutputMeta {
        filename: filename.to_string(),
        sha256: format!("{:x}", hasher.finalize()),
        size_bytes: content.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnrichmentStatus;

    #[test]
    fn parse_skips_blank_and_broken_lines() {
        let content = concat!(
            r#"{"source":"a","row":1,"date":"2024-01-01","text":"one"}"#,
            "\n\n",
            "not json at all\n",
            r#"{"source":"b","row":1,"date":"2024-01-02","text":"two","enrichment_status":"success","title":"T"}"#,
            "\n",
        );
        let records = parse_records(content).expect("parse");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source, "a");
        assert_eq!(records[1].enrichment_status, EnrichmentStatus::Success);
    }

    #[test]
    fn parse_rejects_newer_schema() {
        let content = r#"{"schema_version":2,"source":"a","date":"d","text":"t"}"#;
        let err = parse_records(content).unwrap_err();
        assert!(err.to_string().contains("unsupported schema_version 2"));
    }

    #[test]
    fn jsonl_has_one_line_per_record() {
        let records = vec![
            PostRecord::new("a", 1, "d", "multi\nline", None),
            PostRecord::new("a", 2, "d", "x", Some("https://t.me/a/2".into())),
        ];
        let jsonl = to_jsonl(&records).expect("serialize");
        assert_eq!(jsonl.lines().count(), 2);
        assert!(jsonl.ends_with('\n'));
        assert_eq!(parse_records(&jsonl).expect("parse"), records);
    }

    #[test]
    fn write_records_is_readable_and_leaves_no_temp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("posts.jsonl");
        let records = vec![PostRecord::new("a", 1, "d", "t", None)];

        let meta = write_records(&path, &records).expect("write");
        assert_eq!(meta.filename, "posts.jsonl");
        assert_eq!(meta.sha256.len(), 64);
        assert!(!path.with_file_name(".posts.jsonl.tmp").exists());
        assert_eq!(read_records(&path).expect("read"), records);
    }

    #[test]
    fn read_missing_file_is_io_error() {
        let err = read_records(Path::new("/definitely/not/here.jsonl")).unwrap_err();
        assert!(matches!(err, TgkbError::Io { .. }));
    }
}
