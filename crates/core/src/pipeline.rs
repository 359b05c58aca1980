use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::batch::{BatchProcessor, BatchReport, RunSummary, WorkItem};
use crate::checkpoint::CheckpointStore;
use crate::client::{HttpChatTransport, ModelSpec, RateLimitedClient, TokenUsage};
use crate::config::RunConfig;
use crate::error::{PipelineError, Result};
use crate::format::format_transcript_with_timestamps;
use crate::paths::PathRegistry;
use crate::tables::{self, AnalysisRow, FailureRow, SummaryRow, ThemeRow};
use crate::themes::{ThemeClassifier, ThemeDictionary, UNCLASSIFIED, extract_json};
use crate::youtube::{CommentRecord, TranscriptApi, TranscriptSegment, VideoApi, VideoRecord};

pub const STAGE_COLLECT: &str = "collect";
pub const STAGE_SUMMARIZE: &str = "summarize";
pub const STAGE_ANALYZE: &str = "analyze";
pub const STAGE_CLASSIFY: &str = "classify";

const MAX_COMMENTS_PER_VIDEO: usize = 500;
const DISCOVERY_SAMPLE_SIZE: usize = 25;

const SUMMARIZE_SYSTEM_PROMPT: &str = "You analyze transcripts of electric-vehicle research \
videos. Reply with ONLY a JSON object of this exact shape (no markdown, no explanation): \
{\"summary\": \"2-3 sentence summary of the video\", \"topics\": [\"topic\", ...]} with 3 to 7 \
topics naming the concepts discussed.";

const ANALYZE_SYSTEM_PROMPT: &str = "You analyze single YouTube comments from electric-vehicle \
research videos. State in one or two plain-text sentences what the commenter is asking or \
claiming, and answer the question when one is present. Reply with the sentences only.";

/// What a stage hands back to the caller: the run summary for user-visible
/// reporting, whether an interrupt cut it short, and where the table went.
#[derive(Debug)]
pub struct StageReport {
    pub stage: &'static str,
    pub summary: RunSummary,
    pub interrupted: bool,
    pub output: PathBuf,
}

// Per-item results persisted in the checkpoint as JSON strings.

#[derive(Debug, Serialize, Deserialize)]
struct CollectPayload {
    record: VideoRecord,
    transcript: Vec<TranscriptSegment>,
    comments: Vec<CommentRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SummaryPayload {
    summary: String,
    topics: Vec<String>,
    usage: TokenUsage,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnalysisPayload {
    answer: String,
    usage: TokenUsage,
}

#[derive(Debug, Serialize, Deserialize)]
struct ThemePayload {
    theme: String,
    confidence: f32,
}

/// Expected shape of the summarize reply.
#[derive(Debug, Deserialize)]
struct SummaryReply {
    summary: String,
    #[serde(default)]
    topics: Vec<String>,
}

fn open_checkpoint(
    config: &RunConfig,
    paths: &PathRegistry,
    stage: &str,
) -> Result<CheckpointStore> {
    let path = config
        .checkpoint_path
        .clone()
        .unwrap_or_else(|| paths.checkpoint_for(stage));
    CheckpointStore::open(path)
}

fn make_client(config: &RunConfig) -> RateLimitedClient<HttpChatTransport> {
    RateLimitedClient::new(
        HttpChatTransport::new(&config.api_key),
        ModelSpec::lookup(&config.model_name),
        config.request_delay,
        config.max_retries,
    )
}

fn load_json_map<T: DeserializeOwned>(path: &PathBuf) -> Result<BTreeMap<String, T>> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Decode a checkpointed payload; a line from an older run that no longer
/// parses is dropped with a warning rather than failing the stage.
fn decode_payload<T: DeserializeOwned>(id: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(id, %err, "dropping undecodable checkpoint result");
            None
        }
    }
}

fn write_failures(paths: &PathRegistry, stage: &str, report: &BatchReport) -> Result<()> {
    let rows: Vec<FailureRow> = report
        .outcomes
        .iter()
        .filter_map(|o| {
            o.error.as_ref().map(|error| FailureRow {
                id: o.id.clone(),
                error: error.clone(),
            })
        })
        .collect();
    tables::write_rows(&paths.failures_for(stage), &rows)
}

/// Compact the checkpoint only after a clean pass; a log with failures or an
/// interrupt is left append-only for inspection.
fn maybe_compact(processor: &mut BatchProcessor, report: &BatchReport) -> Result<()> {
    if report.summary.failed == 0 && !report.interrupted {
        processor.compact_checkpoint()?;
    }
    Ok(())
}

/// Stage 1: video list CSV -> metadata CSV + raw transcripts/comments JSON.
pub async fn collect(
    config: &RunConfig,
    paths: &PathRegistry,
    shutdown: broadcast::Receiver<()>,
) -> Result<StageReport> {
    let ids = tables::read_video_list(&paths.video_list())?;
    info!(videos = ids.len(), "collecting video metadata");

    let youtube_key = config.require_youtube_key()?;
    let video_api = VideoApi::new(youtube_key, config.request_delay);
    let transcript_api = TranscriptApi::new(youtube_key);

    let items: Vec<WorkItem> = ids.iter().map(|id| WorkItem::new(id, id)).collect();
    let checkpoint = open_checkpoint(config, paths, STAGE_COLLECT)?;
    let mut processor = BatchProcessor::new(checkpoint, config.fail_fast, shutdown);

    let delay = config.request_delay;
    let report = processor
        .run(&items, |item| {
            let video_api = &video_api;
            let transcript_api = &transcript_api;
            async move {
                let record = video_api.video_metadata(&item.id).await?;
                tokio::time::sleep(delay).await;
                let transcript = transcript_api.transcript(&item.id).await?;
                tokio::time::sleep(delay).await;
                let comments = video_api.comments(&item.id, MAX_COMMENTS_PER_VIDEO).await?;
                let payload = CollectPayload {
                    record,
                    transcript,
                    comments,
                };
                Ok(serde_json::to_string(&payload)?)
            }
        })
        .await?;

    // Rebuild the raw files from every done item so a resumed run still
    // emits complete inputs for the downstream stages.
    let mut records: Vec<VideoRecord> = Vec::new();
    let mut transcripts: BTreeMap<String, Vec<TranscriptSegment>> = BTreeMap::new();
    let mut comments: BTreeMap<String, Vec<CommentRecord>> = BTreeMap::new();
    for (id, raw) in report.done_outputs() {
        let Some(payload) = decode_payload::<CollectPayload>(id, raw) else {
            continue;
        };
        records.push(payload.record);
        transcripts.insert(id.to_string(), payload.transcript);
        comments.insert(id.to_string(), payload.comments);
    }

    tables::write_rows(&paths.video_metadata(), &records)?;
    fs::write(
        paths.transcripts(),
        serde_json::to_string_pretty(&transcripts)?,
    )?;
    fs::write(paths.comments(), serde_json::to_string_pretty(&comments)?)?;
    write_failures(paths, STAGE_COLLECT, &report)?;
    maybe_compact(&mut processor, &report)?;

    Ok(StageReport {
        stage: STAGE_COLLECT,
        summary: report.summary,
        interrupted: report.interrupted,
        output: paths.video_metadata(),
    })
}

/// Stage 2: transcripts -> per-video summary + topics.
pub async fn summarize(
    config: &RunConfig,
    paths: &PathRegistry,
    shutdown: broadcast::Receiver<()>,
) -> Result<StageReport> {
    let transcripts: BTreeMap<String, Vec<TranscriptSegment>> =
        load_json_map(&paths.transcripts())?;
    info!(transcripts = transcripts.len(), "summarizing transcripts");

    let items: Vec<WorkItem> = transcripts
        .iter()
        .map(|(id, segments)| WorkItem::new(id, format_transcript_with_timestamps(segments)))
        .collect();

    let checkpoint = open_checkpoint(config, paths, STAGE_SUMMARIZE)?;
    let mut processor = BatchProcessor::new(checkpoint, config.fail_fast, shutdown);
    let client = Mutex::new(make_client(config));
    let max_response_tokens = config.max_response_tokens;

    let report = processor
        .run(&items, |item| {
            let client = &client;
            async move {
                let (reply, usage) = client
                    .lock()
                    .await
                    .request(SUMMARIZE_SYSTEM_PROMPT, &item.payload, max_response_tokens)
                    .await?;
                let parsed: SummaryReply = serde_json::from_str(extract_json(&reply))
                    .map_err(|err| PipelineError::BadResponse {
                        reason: format!("summary reply was not the expected JSON: {err}"),
                    })?;
                let payload = SummaryPayload {
                    summary: parsed.summary,
                    topics: parsed.topics,
                    usage,
                };
                Ok(serde_json::to_string(&payload)?)
            }
        })
        .await?;

    let rows: Vec<SummaryRow> = report
        .done_outputs()
        .filter_map(|(id, raw)| {
            decode_payload::<SummaryPayload>(id, raw).map(|p| SummaryRow {
                video_id: id.to_string(),
                summary: p.summary,
                topics: p.topics.join(";"),
                prompt_tokens: p.usage.prompt_tokens,
                completion_tokens: p.usage.completion_tokens,
            })
        })
        .collect();

    tables::write_rows(&paths.transcript_summaries(), &rows)?;
    write_failures(paths, STAGE_SUMMARIZE, &report)?;
    maybe_compact(&mut processor, &report)?;

    Ok(StageReport {
        stage: STAGE_SUMMARIZE,
        summary: report.summary,
        interrupted: report.interrupted,
        output: paths.transcript_summaries(),
    })
}

/// Stage 3: comments -> per-comment question/claim analysis.
pub async fn analyze(
    config: &RunConfig,
    paths: &PathRegistry,
    shutdown: broadcast::Receiver<()>,
) -> Result<StageReport> {
    let comments: BTreeMap<String, Vec<CommentRecord>> = load_json_map(&paths.comments())?;
    let (items, comment_videos) = comment_items(&comments);
    info!(comments = items.len(), "analyzing comments");

    let checkpoint = open_checkpoint(config, paths, STAGE_ANALYZE)?;
    let mut processor = BatchProcessor::new(checkpoint, config.fail_fast, shutdown);
    let client = Mutex::new(make_client(config));
    let max_response_tokens = config.max_response_tokens;

    let report = processor
        .run(&items, |item| {
            let client = &client;
            async move {
                let (answer, usage) = client
                    .lock()
                    .await
                    .request(ANALYZE_SYSTEM_PROMPT, &item.payload, max_response_tokens)
                    .await?;
                let payload = AnalysisPayload {
                    answer: answer.trim().to_string(),
                    usage,
                };
                Ok(serde_json::to_string(&payload)?)
            }
        })
        .await?;

    let rows: Vec<AnalysisRow> = report
        .done_outputs()
        .filter_map(|(id, raw)| {
            decode_payload::<AnalysisPayload>(id, raw).map(|p| AnalysisRow {
                comment_id: id.to_string(),
                video_id: comment_videos.get(id).cloned().unwrap_or_default(),
                answer: p.answer,
                prompt_tokens: p.usage.prompt_tokens,
                completion_tokens: p.usage.completion_tokens,
            })
        })
        .collect();

    tables::write_rows(&paths.comment_analysis(), &rows)?;
    write_failures(paths, STAGE_ANALYZE, &report)?;
    maybe_compact(&mut processor, &report)?;

    Ok(StageReport {
        stage: STAGE_ANALYZE,
        summary: report.summary,
        interrupted: report.interrupted,
        output: paths.comment_analysis(),
    })
}

/// Stage 4: comments -> theme labels; optionally grows the dictionary with
/// discovered themes afterwards.
pub async fn classify(
    config: &RunConfig,
    paths: &PathRegistry,
    shutdown: broadcast::Receiver<()>,
    update_dictionary: bool,
) -> Result<StageReport> {
    let comments: BTreeMap<String, Vec<CommentRecord>> = load_json_map(&paths.comments())?;
    let (items, comment_videos) = comment_items(&comments);
    let dictionary = ThemeDictionary::load(&paths.theme_dictionary())?;
    info!(
        comments = items.len(),
        themes = dictionary.len(),
        "classifying comments"
    );

    let checkpoint = open_checkpoint(config, paths, STAGE_CLASSIFY)?;
    let mut processor = BatchProcessor::new(checkpoint, config.fail_fast, shutdown);
    let classifier = Mutex::new(ThemeClassifier::new(
        make_client(config),
        dictionary,
        config.max_response_tokens,
    ));

    let report = processor
        .run(&items, |item| {
            let classifier = &classifier;
            async move {
                let (theme, confidence) = classifier.lock().await.classify(&item.payload).await?;
                let payload = ThemePayload { theme, confidence };
                Ok(serde_json::to_string(&payload)?)
            }
        })
        .await?;

    let rows: Vec<ThemeRow> = report
        .done_outputs()
        .filter_map(|(id, raw)| {
            decode_payload::<ThemePayload>(id, raw).map(|p| ThemeRow {
                comment_id: id.to_string(),
                video_id: comment_videos.get(id).cloned().unwrap_or_default(),
                theme: p.theme,
                confidence: p.confidence,
            })
        })
        .collect();

    if update_dictionary && !report.interrupted {
        let unclassified_ids: Vec<&str> = rows
            .iter()
            .filter(|row| row.theme == UNCLASSIFIED)
            .map(|row| row.comment_id.as_str())
            .collect();
        let sample: Vec<String> = items
            .iter()
            .filter(|item| unclassified_ids.contains(&item.id.as_str()))
            .take(DISCOVERY_SAMPLE_SIZE)
            .map(|item| item.payload.clone())
            .collect();
        if !sample.is_empty() {
            let mut classifier = classifier.lock().await;
            let added = classifier.discover(&sample).await?;
            if !added.is_empty() {
                info!(themes = ?added, "adding discovered themes to the dictionary");
                classifier.dictionary().save(&paths.theme_dictionary())?;
            }
        }
    }

    tables::write_rows(&paths.theme_classification(), &rows)?;
    write_failures(paths, STAGE_CLASSIFY, &report)?;
    maybe_compact(&mut processor, &report)?;

    Ok(StageReport {
        stage: STAGE_CLASSIFY,
        summary: report.summary,
        interrupted: report.interrupted,
        output: paths.theme_classification(),
    })
}

/// Flatten the per-video comment map into work items in (video, comment)
/// order, with a comment -> video index for row building.
fn comment_items(
    comments: &BTreeMap<String, Vec<CommentRecord>>,
) -> (Vec<WorkItem>, BTreeMap<String, String>) {
    let mut items = Vec::new();
    let mut comment_videos = BTreeMap::new();
    for (video_id, records) in comments {
        for record in records {
            if record.text.trim().is_empty() {
                warn!(comment_id = %record.comment_id, "skipping empty comment");
                continue;
            }
            items.push(WorkItem::new(&record.comment_id, &record.text));
            comment_videos.insert(record.comment_id.clone(), video_id.clone());
        }
    }
    (items, comment_videos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(comment_id: &str, video_id: &str, text: &str) -> CommentRecord {
        CommentRecord {
            comment_id: comment_id.to_string(),
            video_id: video_id.to_string(),
            author: "someone".into(),
            text: text.to_string(),
            published_at: "2024-03-01T00:00:00Z".into(),
            like_count: 0,
        }
    }

    #[test]
    fn comment_items_flatten_in_video_then_comment_order() {
        let mut map = BTreeMap::new();
        map.insert(
            "vid_b".to_string(),
            vec![comment("c3", "vid_b", "third"), comment("c4", "vid_b", "fourth")],
        );
        map.insert("vid_a".to_string(), vec![comment("c1", "vid_a", "first")]);

        let (items, index) = comment_items(&map);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["c1", "c3", "c4"]);
        assert_eq!(index.get("c3").map(String::as_str), Some("vid_b"));
    }

    #[test]
    fn comment_items_skip_empty_text() {
        let mut map = BTreeMap::new();
        map.insert(
            "vid_a".to_string(),
            vec![comment("c1", "vid_a", "  "), comment("c2", "vid_a", "real")],
        );
        let (items, _) = comment_items(&map);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "c2");
    }

    #[test]
    fn extract_json_unwraps_markdown_fences() {
        let fenced = "```json\n{\"summary\": \"s\", \"topics\": []}\n```";
        let parsed: SummaryReply = serde_json::from_str(extract_json(fenced)).unwrap();
        assert_eq!(parsed.summary, "s");
    }

    #[test]
    fn summary_reply_tolerates_missing_topics() {
        let parsed: SummaryReply = serde_json::from_str(r#"{"summary": "only"}"#).unwrap();
        assert!(parsed.topics.is_empty());
    }

    #[test]
    fn decode_payload_drops_garbage() {
        assert!(decode_payload::<SummaryPayload>("id", "not json").is_none());
        let good = serde_json::to_string(&SummaryPayload {
            summary: "s".into(),
            topics: vec!["t".into()],
            usage: TokenUsage::default(),
        })
        .unwrap();
        assert!(decode_payload::<SummaryPayload>("id", &good).is_some());
    }
}
