//! Ollama provider implementation
//!
//! Structured prompts go to `/api/chat`, pre-rendered text prompts to
//! `/api/generate` with `raw` set. Both stream newline-delimited JSON.
//!
//! With `think` set, Ollama reports reasoning in `message.thinking` instead of
//! inline. Those runs are re-emitted between the reasoning markers so the
//! collector suppresses them like inline `<think>` blocks.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::conversation::{Prompt, Turn};
use crate::core::SuppressionMarkers;

use super::{line_stream, status_error, Chunk, FragmentStream, GenerationError, GenerationParams, Generator};

pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    think: bool,
    options: Options,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    raw: bool,
    stream: bool,
    options: Options,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

impl From<&Turn> for OllamaMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.as_str(),
            content: turn.content.clone(),
            tool_calls: turn
                .tool_calls
                .iter()
                .map(|call| json!({"function": {"name": call.name, "arguments": call.arguments}}))
                .collect(),
            tool_name: turn.name.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl From<&GenerationParams> for Options {
    fn from(params: &GenerationParams) -> Self {
        let sampling = &params.sampling;
        Self {
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            min_p: sampling.min_p,
            repeat_penalty: sampling.repetition_penalty,
            num_predict: params.max_output_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: String,
}

/// Per-response parser state: whether a reasoning run is open
#[derive(Debug, Default)]
struct LineParser {
    markers: Option<SuppressionMarkers>,
    in_thinking: bool,
}

impl LineParser {
    fn new(markers: Option<SuppressionMarkers>) -> Self {
        Self {
            markers,
            in_thinking: false,
        }
    }

    fn parse(&mut self, line: &str) -> Result<Chunk, GenerationError> {
        if line.trim().is_empty() {
            return Ok(Chunk::Skip);
        }

        let parsed: StreamLine = serde_json::from_str(line)
            .map_err(|e| GenerationError::InvalidChunk(format!("{}: {}", e, line)))?;

        if let Some(error) = parsed.error {
            return Err(GenerationError::Backend(error));
        }

        let (thinking, content) = match parsed.message {
            Some(message) => (message.thinking, message.content),
            None => (String::new(), parsed.response.unwrap_or_default()),
        };

        let mut fragments = Vec::new();
        // unframed reasoning would reach the reply as visible text
        if let (false, Some(markers)) = (thinking.is_empty(), &self.markers) {
            if !self.in_thinking {
                fragments.push(markers.enter.clone());
                self.in_thinking = true;
            }
            fragments.push(thinking);
        }
        if !content.is_empty() || parsed.done {
            self.close_thinking(&mut fragments);
        }
        if !content.is_empty() {
            fragments.push(content);
        }

        Ok(match (fragments.is_empty(), parsed.done) {
            (false, _) => Chunk::Fragments(fragments),
            (true, true) => Chunk::Done,
            (true, false) => Chunk::Skip,
        })
    }

    fn close_thinking(&mut self, fragments: &mut Vec<String>) {
        if !self.in_thinking {
            return;
        }
        self.in_thinking = false;
        if let Some(markers) = &self.markers {
            fragments.push(markers.exit.clone());
        }
    }
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Generator for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate_stream(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<FragmentStream, GenerationError> {
        let request = match prompt {
            Prompt::Messages { turns, enable_thinking } => self
                .client
                .post(format!("{}/api/chat", self.base_url))
                .json(&ChatRequest {
                    model: &params.model,
                    messages: turns.iter().map(OllamaMessage::from).collect(),
                    stream: true,
                    think: enable_thinking,
                    options: params.into(),
                }),
            Prompt::Text(text) => self
                .client
                .post(format!("{}/api/generate", self.base_url))
                .json(&GenerateRequest {
                    model: &params.model,
                    prompt: text,
                    raw: true,
                    stream: true,
                    options: params.into(),
                }),
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let mut parser = LineParser::new(params.reasoning_markers.clone());
        Ok(line_stream(response.bytes_stream(), move |line| parser.parse(line)))
    }
}
