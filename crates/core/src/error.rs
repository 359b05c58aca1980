use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("transient API error: {reason}")]
    TransientApi { reason: String },

    #[error("fatal API error (HTTP {status}): {reason}")]
    FatalApi { status: u16, reason: String },

    #[error("prompt needs ~{estimated} tokens but {model} allows {limit}")]
    TokenBudgetExceeded {
        model: String,
        estimated: usize,
        limit: usize,
    },

    #[error("malformed input record '{id}': {reason}")]
    DataFormat { id: String, reason: String },

    #[error("unexpected API response: {reason}")]
    BadResponse { reason: String },

    #[error("missing API key: {env_var} environment variable is not set")]
    MissingApiKey { env_var: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    /// Errors worth retrying at the client level: network hiccups,
    /// rate-limit responses, server-side failures.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientApi { .. })
    }

    /// Errors that abort the whole run rather than a single item.
    /// Everything else is isolated at the batch item boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::FatalApi { .. } | PipelineError::MissingApiKey { .. }
        )
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        // Status codes are mapped by the caller before this conversion runs;
        // what reaches here is connect/timeout/body trouble (worth retrying)
        // or an undecodable body (not).
        if err.is_decode() {
            PipelineError::BadResponse {
                reason: err.to_string(),
            }
        } else {
            PipelineError::TransientApi {
                reason: err.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
