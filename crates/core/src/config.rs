use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, Result};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 1100;
pub const DEFAULT_MAX_RESPONSE_TOKENS: u32 = 1024;

/// Environment variables holding API keys. The generation key falls back to
/// the conventional OPENAI_API_KEY so existing shells keep working.
pub const GENERATION_KEY_ENV: &str = "TUBESIFT_OPENAI_KEY";
pub const GENERATION_KEY_FALLBACK_ENV: &str = "OPENAI_API_KEY";
pub const YOUTUBE_KEY_ENV: &str = "TUBESIFT_YOUTUBE_KEY";

/// Everything a pipeline stage needs, passed explicitly. No stage reads
/// configuration from globals after construction.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub api_key: String,
    pub youtube_api_key: Option<String>,
    pub model_name: String,
    pub max_retries: u32,
    pub request_delay: Duration,
    pub fail_fast: bool,
    pub max_response_tokens: u32,
    /// Overrides the stage's default checkpoint location when set.
    pub checkpoint_path: Option<PathBuf>,
}

impl RunConfig {
    /// Build a config from the environment, validating the generation API key
    /// up front so a missing key fails before any work starts.
    pub fn from_env() -> Result<Self> {
        let api_key = require_generation_key()?;
        let youtube_api_key = std::env::var(YOUTUBE_KEY_ENV).ok();
        Ok(Self {
            api_key,
            youtube_api_key,
            model_name: DEFAULT_MODEL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            request_delay: Duration::from_millis(DEFAULT_REQUEST_DELAY_MS),
            fail_fast: false,
            max_response_tokens: DEFAULT_MAX_RESPONSE_TOKENS,
            checkpoint_path: None,
        })
    }

    /// The YouTube Data API key, required only by the collect stage.
    pub fn require_youtube_key(&self) -> Result<&str> {
        self.youtube_api_key
            .as_deref()
            .ok_or(PipelineError::MissingApiKey {
                env_var: YOUTUBE_KEY_ENV.to_string(),
            })
    }
}

fn require_generation_key() -> Result<String> {
    std::env::var(GENERATION_KEY_ENV)
        .or_else(|_| std::env::var(GENERATION_KEY_FALLBACK_ENV))
        .map_err(|_| PipelineError::MissingApiKey {
            env_var: GENERATION_KEY_ENV.to_string(),
        })
}
