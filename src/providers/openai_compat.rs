//! OpenAI-compatible provider
//!
//! Works with any server that implements the OpenAI completions API with
//! server-sent event streaming:
//! - vLLM (local server)
//! - LM Studio (local server)
//! - OpenAI, Groq and other hosted APIs
//!
//! Structured prompts go to `/chat/completions`, pre-rendered text prompts to
//! `/completions`.
//!
//! # Configuration
//!
//! ```toml
//! [model]
//! provider = "vllm"
//! endpoint = "http://localhost:8000/v1"
//! api_key_env = "OPENAI_API_KEY"
//! model = "Qwen/Qwen3-8B"
//! ```

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::conversation::{Prompt, Turn};

use super::{line_stream, status_error, Chunk, FragmentStream, GenerationError, GenerationParams, Generator};

/// OpenAI-compatible chat message
#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.as_str(),
            content: turn.content.clone(),
            name: turn.name.clone(),
        }
    }
}

/// Sampling fields shared by both endpoints. `top_k`, `min_p` and
/// `repetition_penalty` are vLLM extensions that other servers ignore.
#[derive(Debug, Serialize)]
struct Sampling {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repetition_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

impl From<&GenerationParams> for Sampling {
    fn from(params: &GenerationParams) -> Self {
        let sampling = &params.sampling;
        Self {
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            min_p: sampling.min_p,
            repetition_penalty: sampling.repetition_penalty,
            max_tokens: params.max_output_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(flatten)]
    sampling: Sampling,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_template_kwargs: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(flatten)]
    sampling: Sampling,
}

/// One `data:` event of either endpoint
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Error response from API
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

fn parse_event(line: &str) -> Result<Chunk, GenerationError> {
    let Some(data) = line.strip_prefix("data:") else {
        // blank separators, comments, `event:` and `id:` fields
        return Ok(Chunk::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Chunk::Done);
    }

    let event: StreamEvent = serde_json::from_str(data)
        .map_err(|e| GenerationError::InvalidChunk(format!("{}: {}", e, data)))?;

    if let Some(error) = event.error {
        return Err(GenerationError::Backend(error.message));
    }

    let text = event
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.and_then(|d| d.content).or(choice.text))
        .unwrap_or_default();

    Ok(if text.is_empty() { Chunk::Skip } else { Chunk::Fragment(text) })
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone)]
pub struct OpenAICompatConfig {
    /// Base URL for the API (e.g., http://localhost:8000/v1)
    pub base_url: String,
    /// API key (optional for local servers)
    pub api_key: Option<String>,
    /// Optional organization ID (OpenAI)
    pub organization: Option<String>,
    /// Connection timeout in seconds; generation deadlines live in the engine
    pub connect_timeout_secs: u64,
    /// Send `chat_template_kwargs` (vLLM); hosted APIs reject unknown fields
    pub template_kwargs: bool,
}

impl OpenAICompatConfig {
    /// Config for the server at `base_url`. Template kwargs are only sent to
    /// servers other than api.openai.com.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            template_kwargs: !base_url.contains("api.openai.com"),
            base_url,
            api_key: None,
            organization: None,
            connect_timeout_secs: 10,
        }
    }
}

/// OpenAI-compatible API provider
pub struct OpenAICompatProvider {
    config: OpenAICompatConfig,
    client: Client,
}

impl OpenAICompatProvider {
    pub fn new(config: OpenAICompatConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut builder = self.client.post(url);

        if let Some(ref api_key) = self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        // OpenAI specific
        if let Some(ref org) = self.config.organization {
            builder = builder.header("OpenAI-Organization", org);
        }

        builder
    }
}

#[async_trait]
impl Generator for OpenAICompatProvider {
    fn name(&self) -> &str {
        "openai_compat"
    }

    async fn generate_stream(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<FragmentStream, GenerationError> {
        let request = match prompt {
            Prompt::Messages { turns, enable_thinking } => {
                self.post("/chat/completions").json(&ChatCompletionRequest {
                    model: params.model.clone(),
                    messages: turns.iter().map(ChatMessage::from).collect(),
                    stream: true,
                    sampling: params.into(),
                    chat_template_kwargs: self
                        .config
                        .template_kwargs
                        .then(|| json!({ "enable_thinking": enable_thinking })),
                })
            }
            Prompt::Text(text) => self.post("/completions").json(&CompletionRequest {
                model: params.model.clone(),
                prompt: text,
                stream: true,
                sampling: params.into(),
            }),
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(match status_error(response).await {
                GenerationError::Status { status, body } => {
                    match serde_json::from_str::<ErrorResponse>(&body) {
                        Ok(parsed) => GenerationError::Status {
                            status,
                            body: parsed.error.message,
                        },
                        Err(_) => GenerationError::Status { status, body },
                    }
                }
                other => other,
            });
        }

        Ok(line_stream(response.bytes_stream(), parse_event))
    }
}
