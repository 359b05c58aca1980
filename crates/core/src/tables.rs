use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::youtube::extract_video_id;

/// Output row schemas. Column order is part of the contract: downstream
/// analysis reads these files positionally.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRow {
    pub video_id: String,
    pub summary: String,
    /// Semicolon-joined topic list, one CSV cell.
    pub topics: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRow {
    pub comment_id: String,
    pub video_id: String,
    pub answer: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeRow {
    pub comment_id: String,
    pub video_id: String,
    pub theme: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRow {
    pub id: String,
    pub error: String,
}

/// Write rows via a temp file and atomic rename so readers never observe a
/// half-written table.
pub fn write_rows<S: Serialize>(path: &Path, rows: &[S]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp_path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn read_rows<D: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<D>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Read the input video list. Accepts either a `video_id` or a `video_url`
/// column; rows yielding no usable id are skipped and logged. Duplicate ids
/// keep their first position.
pub fn read_video_list(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let id_col = headers.iter().position(|h| h.trim() == "video_id");
    let url_col = headers.iter().position(|h| h.trim() == "video_url");
    if id_col.is_none() && url_col.is_none() {
        return Err(PipelineError::DataFormat {
            id: path.display().to_string(),
            reason: "video list needs a video_id or video_url column".into(),
        });
    }

    let mut ids = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record = record?;
        let raw = id_col
            .and_then(|col| record.get(col))
            .filter(|v| !v.trim().is_empty())
            .or_else(|| url_col.and_then(|col| record.get(col)))
            .unwrap_or("");

        match extract_video_id(raw) {
            Some(id) if !ids.contains(&id) => ids.push(id),
            Some(_) => {}
            None => {
                warn!(row = row_index + 2, value = raw, "skipping row without a usable video id");
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn summary_rows_round_trip_with_stable_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summaries.csv");

        let rows = vec![SummaryRow {
            video_id: "abc123".into(),
            summary: "A video about charging, with \"quotes\" and, commas".into(),
            topics: "charging;range".into(),
            prompt_tokens: 1200,
            completion_tokens: 240,
        }];
        write_rows(&path, &rows).unwrap();

        let header = fs::read_to_string(&path).unwrap();
        assert!(header.starts_with(
            "video_id,summary,topics,prompt_tokens,completion_tokens"
        ));

        let loaded: Vec<SummaryRow> = read_rows(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].summary, rows[0].summary);
        assert_eq!(loaded[0].completion_tokens, 240);
    }

    #[test]
    fn video_list_accepts_urls_and_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video_list.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "title,video_url").unwrap();
        writeln!(file, "first,https://www.youtube.com/watch?v=aaa111BBB-_").unwrap();
        writeln!(file, "second,https://youtu.be/ccc333DDD22").unwrap();
        writeln!(file, "dup,https://youtu.be/aaa111BBB-_").unwrap();
        writeln!(file, "bad,not a url at all!!").unwrap();
        drop(file);

        let ids = read_video_list(&path).unwrap();
        assert_eq!(ids, ["aaa111BBB-_", "ccc333DDD22"]);
    }

    #[test]
    fn video_list_prefers_id_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video_list.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "video_id,video_url").unwrap();
        writeln!(file, "xyz789,https://youtu.be/ignored00000").unwrap();
        drop(file);

        let ids = read_video_list(&path).unwrap();
        assert_eq!(ids, ["xyz789"]);
    }

    #[test]
    fn video_list_without_known_columns_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video_list.csv");
        fs::write(&path, "title,notes\nfoo,bar\n").unwrap();

        assert!(matches!(
            read_video_list(&path),
            Err(PipelineError::DataFormat { .. })
        ));
    }

    #[test]
    fn atomic_write_replaces_existing_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("themes.csv");

        write_rows(
            &path,
            &[ThemeRow {
                comment_id: "c1".into(),
                video_id: "v1".into(),
                theme: "Old".into(),
                confidence: 0.5,
            }],
        )
        .unwrap();
        write_rows(
            &path,
            &[ThemeRow {
                comment_id: "c2".into(),
                video_id: "v1".into(),
                theme: "New".into(),
                confidence: 0.9,
            }],
        )
        .unwrap();

        let rows: Vec<ThemeRow> = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].theme, "New");
        assert!(!path.with_extension("csv.tmp").exists());
    }
}
