//! Tubesift Core Library
//!
//! Core functionality for collecting YouTube research data (metadata,
//! transcripts, comments) and running checkpointed, rate-limited LLM
//! analysis over it: transcript summaries, comment analysis, and theme
//! classification.

pub mod batch;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod format;
pub mod paths;
pub mod pipeline;
pub mod tables;
pub mod themes;
pub mod youtube;

// Re-export commonly used items at crate root
pub use batch::{BatchProcessor, BatchReport, ItemOutcome, RunSummary, WorkItem};
pub use checkpoint::{CheckpointEntry, CheckpointStore, ItemStatus};
pub use client::{
    ChatTransport, HttpChatTransport, ModelSpec, RateLimitedClient, TokenUsage, estimate_tokens,
};
pub use config::RunConfig;
pub use error::{PipelineError, Result};
pub use format::{format_timestamp, format_transcript_with_timestamps};
pub use paths::PathRegistry;
pub use pipeline::{StageReport, analyze, classify, collect, summarize};
pub use themes::{ThemeClassifier, ThemeDictionary, ThemeInfo, UNCLASSIFIED};
pub use youtube::{
    CommentRecord, TranscriptApi, TranscriptSegment, VideoApi, VideoRecord, extract_video_id,
    sanitize_video_id,
};
