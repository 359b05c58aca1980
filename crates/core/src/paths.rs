use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Resolves project-root-relative data locations. All pipeline inputs and
/// outputs live under `<root>/data/{raw,processed,reference}` so a run is
/// portable across machines.
#[derive(Debug, Clone)]
pub struct PathRegistry {
    root: PathBuf,
}

impl PathRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the output directories if they are missing.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.raw_dir(), self.processed_dir(), self.reference_dir()] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("data").join("raw")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("data").join("processed")
    }

    pub fn reference_dir(&self) -> PathBuf {
        self.root.join("data").join("reference")
    }

    // Stage inputs

    pub fn video_list(&self) -> PathBuf {
        self.raw_dir().join("video_list.csv")
    }

    pub fn transcripts(&self) -> PathBuf {
        self.raw_dir().join("transcripts.json")
    }

    pub fn comments(&self) -> PathBuf {
        self.raw_dir().join("comments.json")
    }

    pub fn theme_dictionary(&self) -> PathBuf {
        self.reference_dir().join("theme_dictionary.json")
    }

    // Stage outputs

    pub fn video_metadata(&self) -> PathBuf {
        self.processed_dir().join("video_metadata.csv")
    }

    pub fn transcript_summaries(&self) -> PathBuf {
        self.processed_dir().join("transcript_summaries.csv")
    }

    pub fn comment_analysis(&self) -> PathBuf {
        self.processed_dir().join("comment_analysis.csv")
    }

    pub fn theme_classification(&self) -> PathBuf {
        self.processed_dir().join("theme_classification.csv")
    }

    pub fn failures_for(&self, stage: &str) -> PathBuf {
        self.processed_dir().join(format!("{stage}_failures.csv"))
    }

    pub fn checkpoint_for(&self, stage: &str) -> PathBuf {
        self.processed_dir()
            .join(format!("{stage}_checkpoint.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted() {
        let paths = PathRegistry::new("/work/project");
        assert_eq!(
            paths.video_list(),
            PathBuf::from("/work/project/data/raw/video_list.csv")
        );
        assert_eq!(
            paths.checkpoint_for("summarize"),
            PathBuf::from("/work/project/data/processed/summarize_checkpoint.jsonl")
        );
        assert_eq!(
            paths.theme_dictionary(),
            PathBuf::from("/work/project/data/reference/theme_dictionary.json")
        );
    }

    #[test]
    fn ensure_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathRegistry::new(dir.path());
        paths.ensure().unwrap();
        assert!(paths.raw_dir().is_dir());
        assert!(paths.processed_dir().is_dir());
        assert!(paths.reference_dir().is_dir());
    }
}
