//! Request payloads accepted by the streaming endpoints.

use serde::{Deserialize, Serialize};

/// Default maximum number of tokens to generate.
pub const DEFAULT_MAX_LENGTH: u32 = 2048;
/// Default nucleus sampling threshold for streaming sessions.
pub const DEFAULT_TOP_P: f32 = 0.7;
/// Default sampling temperature for streaming sessions.
pub const DEFAULT_TEMPERATURE: f32 = 0.9;
/// Default priority tier (the strictest of the standard four).
pub const DEFAULT_TIER: i64 = 3;

/// One past turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Payload a client sends to open a streaming session.
///
/// Every field except `prompt` is optional on the wire. `tier` is kept signed
/// so that out-of-range values survive parsing and can be rejected explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub prompt: String,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(default = "default_max_length", rename = "maxLength", alias = "max_length")]
    pub max_length: u32,
    #[serde(default = "default_top_p", rename = "topP", alias = "top_p")]
    pub top_p: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_tier", alias = "level")]
    pub tier: i64,
}

impl StreamRequest {
    /// Request with every optional field at its default.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            history: Vec::new(),
            max_length: DEFAULT_MAX_LENGTH,
            top_p: DEFAULT_TOP_P,
            temperature: DEFAULT_TEMPERATURE,
            tier: DEFAULT_TIER,
        }
    }

    pub fn with_tier(mut self, tier: i64) -> Self {
        self.tier = tier;
        self
    }
}

/// Payload for the Server-Sent Events completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionsRequest {
    pub messages: Vec<HistoryMessage>,
    #[serde(default = "default_completions_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_completions_top_p")]
    pub top_p: f32,
    #[serde(default = "default_completions_temperature")]
    pub temperature: f32,
    /// Augment the prompt with retrieved knowledge.
    #[serde(default, alias = "zhishiku")]
    pub use_retrieval: bool,
}

impl CompletionsRequest {
    /// Splits the conversation into history and the final prompt.
    ///
    /// Returns `None` when there are no messages.
    pub fn split_prompt(&self) -> Option<(&[HistoryMessage], &str)> {
        let (last, history) = self.messages.split_last()?;
        Some((history, last.content.as_str()))
    }
}

fn default_max_length() -> u32 {
    DEFAULT_MAX_LENGTH
}
fn default_top_p() -> f32 {
    DEFAULT_TOP_P
}
fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}
fn default_tier() -> i64 {
    DEFAULT_TIER
}
fn default_completions_max_tokens() -> u32 {
    2048
}
fn default_completions_top_p() -> f32 {
    0.2
}
fn default_completions_temperature() -> f32 {
    0.8
}
