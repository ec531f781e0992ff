//! Generation engine abstraction layer.
//!
//! This module defines the `GenerationEngine` trait that puts a token
//! generation backend behind a common interface. The engine is an external
//! collaborator: sessions only format history, start a generation and pull
//! fragments from the returned stream.

mod ollama;

pub use ollama::OllamaEngine;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use tiergate_common::{HistoryMessage, StreamRequest};

use crate::error::Result;

/// Lazy, finite sequence of generated text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Conversation history normalised for an engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormattedHistory(pub Vec<HistoryMessage>);

impl FormattedHistory {
    pub fn messages(&self) -> &[HistoryMessage] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything an engine needs to start one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub history: FormattedHistory,
    pub max_length: u32,
    pub top_p: f32,
    pub temperature: f32,
    /// Ask the engine to augment the prompt with retrieved knowledge.
    pub use_retrieval: bool,
}

impl GenerationRequest {
    /// Build a request from a client payload, formatting its history with `engine`.
    pub fn from_stream_request(engine: &dyn GenerationEngine, request: &StreamRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            history: engine.initialize_history(&request.history),
            max_length: request.max_length,
            top_p: request.top_p,
            temperature: request.temperature,
            use_retrieval: false,
        }
    }
}

/// Primary trait for generation backends.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Unique identifier for this engine type (e.g., "ollama").
    fn engine_type(&self) -> &'static str;

    /// Turn client-supplied history into the engine's conversation format.
    ///
    /// The default keeps non-empty turns and maps role names onto
    /// `user`/`assistant`/`system`.
    fn initialize_history(&self, messages: &[HistoryMessage]) -> FormattedHistory {
        FormattedHistory(
            messages
                .iter()
                .filter(|m| !m.content.trim().is_empty())
                .map(|m| HistoryMessage::new(normalize_role(&m.role), m.content.clone()))
                .collect(),
        )
    }

    /// Start generating. The stream ends normally or yields an error.
    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream>;
}

fn normalize_role(role: &str) -> &'static str {
    match role.to_ascii_lowercase().as_str() {
        "assistant" | "ai" | "bot" | "model" => "assistant",
        "system" => "system",
        _ => "user",
    }
}
