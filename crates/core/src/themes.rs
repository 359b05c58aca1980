use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::{ChatTransport, RateLimitedClient};
use crate::error::Result;

/// Label used when the model's answer is not in the dictionary.
pub const UNCLASSIFIED: &str = "Unclassified";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeInfo {
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Static reference taxonomy mapping theme name to description/keywords.
/// Loaded once per run and read-only while classifying; `insert` exists for
/// the discovery step that runs between batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThemeDictionary {
    themes: BTreeMap<String, ThemeInfo>,
}

impl ThemeDictionary {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.themes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.themes.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.themes.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.canonical(name).is_some()
    }

    /// Returns the dictionary's casing of a theme, matched case-insensitively.
    pub fn canonical(&self, name: &str) -> Option<&str> {
        let wanted = name.trim();
        self.themes
            .keys()
            .find(|known| known.eq_ignore_ascii_case(wanted))
            .map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, info: ThemeInfo) {
        self.themes.insert(name.into(), info);
    }

    /// One line per theme for prompt construction, in stable name order.
    pub fn prompt_block(&self) -> String {
        self.themes
            .iter()
            .map(|(name, info)| {
                if info.keywords.is_empty() {
                    format!("- {}: {}", name, info.description)
                } else {
                    format!(
                        "- {}: {} (keywords: {})",
                        name,
                        info.description,
                        info.keywords.join(", ")
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse a `label | confidence` reply. Missing or unparseable confidence
/// falls back to 0.0; the label half is returned verbatim for dictionary
/// matching by the caller.
pub fn parse_label_reply(reply: &str) -> (String, f32) {
    let line = reply.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    match line.split_once('|') {
        Some((label, confidence)) => {
            let confidence = confidence.trim().parse::<f32>().unwrap_or(0.0);
            (label.trim().to_string(), confidence.clamp(0.0, 1.0))
        }
        None => (line.trim().to_string(), 0.0),
    }
}

const CLASSIFY_SYSTEM_PROMPT: &str = "You classify YouTube comments from electric-vehicle \
research videos into exactly one theme from a fixed list. Reply with a single line in the \
form `theme name | confidence` where confidence is between 0.0 and 1.0. Use the theme names \
exactly as given. If no theme fits, reply `Unclassified | 0.0`.";

const DISCOVER_SYSTEM_PROMPT: &str = "You review YouTube comments and propose recurring \
discussion themes that are missing from an existing taxonomy. Reply with a JSON object \
mapping each new theme name to a one-sentence description. Reply `{}` when nothing new \
stands out.";

/// Maps free-text comments onto the theme taxonomy via the generation API.
pub struct ThemeClassifier<T: ChatTransport> {
    client: RateLimitedClient<T>,
    dictionary: ThemeDictionary,
    max_response_tokens: u32,
}

impl<T: ChatTransport> ThemeClassifier<T> {
    pub fn new(
        client: RateLimitedClient<T>,
        dictionary: ThemeDictionary,
        max_response_tokens: u32,
    ) -> Self {
        Self {
            client,
            dictionary,
            max_response_tokens,
        }
    }

    pub fn dictionary(&self) -> &ThemeDictionary {
        &self.dictionary
    }

    /// Classify one comment. An answer outside the dictionary yields
    /// `Unclassified` with confidence 0.0 rather than an error; client-level
    /// errors (transient exhaustion, fatal, token budget) propagate.
    pub async fn classify(&mut self, comment_text: &str) -> Result<(String, f32)> {
        let user = format!(
            "Themes:\n{}\n\nComment:\n{}",
            self.dictionary.prompt_block(),
            comment_text
        );
        let (reply, _usage) = self
            .client
            .request(CLASSIFY_SYSTEM_PROMPT, &user, self.max_response_tokens)
            .await?;

        let (raw_label, confidence) = parse_label_reply(&reply);
        match self.dictionary.canonical(&raw_label) {
            Some(canonical) => Ok((canonical.to_string(), confidence)),
            None => {
                if !raw_label.eq_ignore_ascii_case(UNCLASSIFIED) {
                    debug!(label = %raw_label, "model answered outside the taxonomy");
                }
                Ok((UNCLASSIFIED.to_string(), 0.0))
            }
        }
    }

    /// Ask the model for themes absent from the dictionary, given a sample of
    /// comments, and merge any new ones in. Returns the added names.
    pub async fn discover(&mut self, sample_comments: &[String]) -> Result<Vec<String>> {
        let user = format!(
            "Existing themes:\n{}\n\nComments:\n{}",
            self.dictionary.prompt_block(),
            sample_comments.join("\n---\n")
        );
        let (reply, _usage) = self
            .client
            .request(DISCOVER_SYSTEM_PROMPT, &user, self.max_response_tokens)
            .await?;

        let proposed: BTreeMap<String, String> = match serde_json::from_str(extract_json(&reply)) {
            Ok(proposed) => proposed,
            Err(err) => {
                warn!(%err, "discovery reply was not a JSON object, ignoring");
                return Ok(Vec::new());
            }
        };

        let mut added = Vec::new();
        for (name, description) in proposed {
            if self.dictionary.contains(&name) {
                continue;
            }
            self.dictionary.insert(
                name.clone(),
                ThemeInfo {
                    description,
                    keywords: Vec::new(),
                },
            );
            added.push(name);
        }
        Ok(added)
    }

    pub fn into_dictionary(self) -> ThemeDictionary {
        self.dictionary
    }
}

/// Models often wrap JSON in a markdown fence; take the outermost braces.
pub(crate) fn extract_json(reply: &str) -> &str {
    let start = reply.find('{');
    let end = reply.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => reply,
    }
}
