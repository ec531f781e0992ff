//! Ollama generation engine implementation.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{FragmentStream, GenerationEngine, GenerationRequest};
use crate::error::{Error, Result};

/// Ollama generation engine.
///
/// Streams `/api/chat` responses from an Ollama server. Only one generation
/// runs at a time: the device permit is held until the fragment stream is
/// dropped.
pub struct OllamaEngine {
    http_client: Client,
    base_url: String,
    model: String,
    device: Arc<Semaphore>,
}

impl OllamaEngine {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            device: Arc::new(Semaphore::new(1)),
        }
    }
}

// ============================================================================
// Ollama API types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    top_p: f32,
    temperature: f32,
}

/// One line of a streamed `/api/chat` response.
#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ============================================================================
// GenerationEngine implementation
// ============================================================================

#[async_trait]
impl GenerationEngine for OllamaEngine {
    fn engine_type(&self) -> &'static str {
        "ollama"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream> {
        if request.use_retrieval {
            tracing::debug!("Retrieval requested but not supported by the ollama engine");
        }

        let permit = self
            .device
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::EngineFailure(e.to_string()))?;

        let mut messages: Vec<OllamaMessage> = request
            .history
            .messages()
            .iter()
            .map(|m| OllamaMessage {
                role: &m.role,
                content: &m.content,
            })
            .collect();
        messages.push(OllamaMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: true,
            options: OllamaOptions {
                num_predict: request.max_length,
                top_p: request.top_p,
                temperature: request.temperature,
            },
        };

        let url = format!("{}/api/chat", self.base_url);
        tracing::debug!("Starting generation at {} with model {}", url, self.model);

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::EngineFailure(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::EngineFailure(format!(
                "Ollama returned {}: {}",
                status, text
            )));
        }

        Ok(ndjson_fragments(response.bytes_stream(), permit))
    }
}

struct NdjsonState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    done: bool,
    _permit: OwnedSemaphorePermit,
}

/// Split a byte stream into NDJSON lines and yield each chunk's text.
fn ndjson_fragments<S, B>(bytes: S, permit: OwnedSemaphorePermit) -> FragmentStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = NdjsonState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        done: false,
        _permit: permit,
    };

    let stream = futures_util::stream::try_unfold(state, |mut state| async move {
        loop {
            if state.done {
                return Ok(None);
            }

            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                if let Some(text) = parse_line(&line, &mut state.done)? {
                    return Ok(Some((text, state)));
                }
                continue;
            }

            match state.bytes.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| Error::EngineFailure(e.to_string()))?;
                    state.buffer.extend_from_slice(chunk.as_ref());
                }
                None => {
                    // Last line may lack a trailing newline.
                    let line = std::mem::take(&mut state.buffer);
                    state.done = true;
                    if let Some(text) = parse_line(&line, &mut state.done)? {
                        return Ok(Some((text, state)));
                    }
                    return Ok(None);
                }
            }
        }
    });

    Box::pin(stream)
}

/// Parse one NDJSON line. Returns the non-empty text it carries, if any.
fn parse_line(line: &[u8], done: &mut bool) -> Result<Option<String>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let chunk: OllamaStreamChunk = serde_json::from_slice(line)
        .map_err(|e| Error::EngineFailure(format!("Failed to parse Ollama response: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(Error::EngineFailure(error));
    }
    if chunk.done {
        *done = true;
    }

    Ok(chunk
        .message
        .and_then(|m| m.content)
        .filter(|text| !text.is_empty()))
}
