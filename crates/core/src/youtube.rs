use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::status_error;
use crate::error::{PipelineError, Result};

pub const VIDEOS_URL: &str = "https://www.googleapis.com/youtube/v3/videos";
pub const COMMENT_THREADS_URL: &str = "https://www.googleapis.com/youtube/v3/commentThreads";
pub const TRANSCRIPT_URL: &str = "https://transcript.fetch.dev/api/v1/transcript";

const COMMENTS_PAGE_SIZE: u32 = 100;
const MAX_VIDEO_ID_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: String,
    pub channel: String,
    pub published_at: String,
    pub view_count: u64,
    pub comment_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRecord {
    pub comment_id: String,
    pub video_id: String,
    pub author: String,
    pub text: String,
    pub published_at: String,
    pub like_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub duration: f64,
    pub text: String,
}

/// Pull the video id out of the common YouTube URL shapes; a bare id passes
/// through. Returns `None` when nothing id-like is present.
pub fn extract_video_id(url: &str) -> Option<String> {
    let raw_id = if let Some(v_param) = url.split("v=").nth(1) {
        v_param.split('&').next().unwrap_or(v_param)
    } else if let Some(youtu_be) = url.split("youtu.be/").nth(1) {
        youtu_be.split('?').next().unwrap_or(youtu_be)
    } else {
        url
    };
    sanitize_video_id(raw_id).ok()
}

/// Ensure a video identifier is safe for file names and API query params.
/// Only ASCII alphanumeric characters plus `_` and `-` are allowed.
pub fn sanitize_video_id(raw: &str) -> Result<String> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Err(PipelineError::DataFormat {
            id: raw.to_string(),
            reason: "video id is empty".into(),
        });
    }
    if trimmed.len() > MAX_VIDEO_ID_LEN {
        return Err(PipelineError::DataFormat {
            id: trimmed.chars().take(32).collect(),
            reason: "video id is unexpectedly long".into(),
        });
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(PipelineError::DataFormat {
            id: trimmed.to_string(),
            reason: "video id contains unsupported characters".into(),
        });
    }

    Ok(trimmed.to_string())
}

// YouTube Data API v3 response shapes (the fields we read).

#[derive(Deserialize)]
struct VideosResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Deserialize)]
struct VideoItem {
    snippet: VideoSnippet,
    statistics: VideoStatistics,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: String,
    channel_title: String,
    published_at: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    // The Data API returns counters as strings.
    #[serde(default)]
    view_count: Option<String>,
    #[serde(default)]
    comment_count: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadsResponse {
    #[serde(default)]
    items: Vec<CommentThreadItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct CommentThreadItem {
    id: String,
    snippet: CommentThreadSnippet,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadSnippet {
    top_level_comment: TopLevelComment,
}

#[derive(Deserialize)]
struct TopLevelComment {
    snippet: CommentSnippet,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentSnippet {
    author_display_name: String,
    text_original: String,
    published_at: String,
    #[serde(default)]
    like_count: u64,
}

/// YouTube Data API v3 client: video metadata and top-level comments.
pub struct VideoApi {
    client: reqwest::Client,
    api_key: String,
    videos_url: String,
    comment_threads_url: String,
    request_delay: Duration,
}

impl VideoApi {
    pub fn new(api_key: impl Into<String>, request_delay: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            videos_url: VIDEOS_URL.to_string(),
            comment_threads_url: COMMENT_THREADS_URL.to_string(),
            request_delay,
        }
    }

    pub fn with_base_urls(
        mut self,
        videos_url: impl Into<String>,
        comment_threads_url: impl Into<String>,
    ) -> Self {
        self.videos_url = videos_url.into();
        self.comment_threads_url = comment_threads_url.into();
        self
    }

    pub async fn video_metadata(&self, video_id: &str) -> Result<VideoRecord> {
        let response = self
            .client
            .get(&self.videos_url)
            .query(&[
                ("part", "snippet,statistics"),
                ("id", video_id),
                ("key", &self.api_key),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        let parsed: VideosResponse = response.json().await?;
        let item = parsed
            .items
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::DataFormat {
                id: video_id.to_string(),
                reason: "video not found or not accessible".into(),
            })?;

        Ok(VideoRecord {
            video_id: video_id.to_string(),
            title: item.snippet.title,
            channel: item.snippet.channel_title,
            published_at: item.snippet.published_at,
            view_count: parse_counter(item.statistics.view_count.as_deref()),
            comment_count: parse_counter(item.statistics.comment_count.as_deref()),
        })
    }

    /// Fetch up to `max_comments` top-level comments, following page tokens.
    pub async fn comments(&self, video_id: &str, max_comments: usize) -> Result<Vec<CommentRecord>> {
        let mut comments = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("part".to_string(), "snippet".to_string()),
                ("videoId".to_string(), video_id.to_string()),
                ("maxResults".to_string(), COMMENTS_PAGE_SIZE.to_string()),
                ("textFormat".to_string(), "plainText".to_string()),
                ("key".to_string(), self.api_key.clone()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }

            let response = self
                .client
                .get(&self.comment_threads_url)
                .query(&query)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status.as_u16(), &body));
            }

            let parsed: CommentThreadsResponse = response.json().await?;
            for item in parsed.items {
                let snippet = item.snippet.top_level_comment.snippet;
                comments.push(CommentRecord {
                    comment_id: item.id,
                    video_id: video_id.to_string(),
                    author: snippet.author_display_name,
                    text: snippet.text_original,
                    published_at: snippet.published_at,
                    like_count: snippet.like_count,
                });
                if comments.len() >= max_comments {
                    return Ok(comments);
                }
            }

            match parsed.next_page_token {
                Some(token) => {
                    debug!(video_id, fetched = comments.len(), "following comments page");
                    page_token = Some(token);
                    tokio::time::sleep(self.request_delay).await;
                }
                None => return Ok(comments),
            }
        }
    }
}

fn parse_counter(raw: Option<&str>) -> u64 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[derive(Deserialize)]
struct TranscriptResponse {
    segments: Vec<TranscriptSegment>,
}

/// Transcript-fetch API client.
pub struct TranscriptApi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TranscriptApi {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: TRANSCRIPT_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub async fn transcript(&self, video_id: &str) -> Result<Vec<TranscriptSegment>> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("video_id", video_id)])
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        let parsed: TranscriptResponse = response.json().await?;
        Ok(parsed.segments)
    }
}
