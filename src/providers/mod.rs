//! Generation backends
//!
//! A [`Generator`] turns a rendered [`Prompt`] into a lazy stream of text
//! fragments. Backends own their transport; the chat engine only sees the
//! fragment stream and [`GenerationError`].

mod ollama;
mod openai_compat;
pub mod scripted;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, ModelConfig};
use crate::conversation::Prompt;
use crate::core::SuppressionMarkers;

pub use ollama::OllamaProvider;
pub use openai_compat::{OpenAICompatConfig, OpenAICompatProvider};
pub use scripted::{ScriptStep, ScriptedGenerator};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid stream chunk: {0}")]
    InvalidChunk(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generation worker stopped unexpectedly")]
    WorkerPanicked,

    #[error("{0} cannot handle this prompt form")]
    UnsupportedPrompt(&'static str),
}

/// Lazy sequence of generated text fragments, in production order
pub type FragmentStream = BoxStream<'static, Result<String, GenerationError>>;

/// Sampling knobs passed through to the backend untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Typically 0.0 - 2.0
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Nucleus sampling mass, 0.0 - 1.0
    #[serde(default)]
    pub top_p: Option<f32>,

    #[serde(default)]
    pub top_k: Option<u32>,

    /// Minimum probability relative to the top token, 0.0 - 1.0
    #[serde(default)]
    pub min_p: Option<f32>,

    /// 1.0 disables the penalty
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub sampling: SamplingConfig,
    pub max_output_tokens: Option<u32>,

    /// Framing for reasoning a backend reports out of band, so the collector
    /// can suppress it. Without markers that reasoning is dropped.
    pub reasoning_markers: Option<SuppressionMarkers>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Start a generation and return its fragments as they arrive
    async fn generate_stream(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<FragmentStream, GenerationError>;

    /// Run a generation to completion and return the whole text
    async fn generate(
        &self,
        prompt: Prompt,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let mut stream = self.generate_stream(prompt, params).await?;
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

/// Supported backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ollama,
    OpenAi,
    Scripted,
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Result<Self, GenerationError> {
        match name.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" | "openai_compat" | "vllm" => Ok(Self::OpenAi),
            "scripted" | "echo" => Ok(Self::Scripted),
            _ => Err(GenerationError::UnknownProvider(name.to_string())),
        }
    }
}

/// Build the generator described by a model profile
pub fn build_generator(
    model: &ModelConfig,
    config: &Config,
) -> Result<Arc<dyn Generator>, GenerationError> {
    match ProviderKind::from_name(&model.provider)? {
        ProviderKind::Ollama => {
            let url = model
                .endpoint
                .clone()
                .or_else(|| config.ollama_url.clone())
                .unwrap_or_else(|| "http://localhost:11434".into());
            Ok(Arc::new(OllamaProvider::new(url)?))
        }
        ProviderKind::OpenAi => {
            let base_url = model
                .endpoint
                .clone()
                .or_else(|| config.openai_base_url.clone())
                .ok_or_else(|| GenerationError::NotConfigured("openai base_url".into()))?;
            let api_key = match &model.api_key_env {
                Some(var) => std::env::var(var).ok(),
                None => config.openai_api_key.clone(),
            };
            let mut provider_config = OpenAICompatConfig::new(base_url);
            provider_config.api_key = api_key;
            provider_config.organization = model.organization.clone();
            Ok(Arc::new(OpenAICompatProvider::new(provider_config)?))
        }
        ProviderKind::Scripted => Ok(Arc::new(ScriptedGenerator::echo())),
    }
}

/// What one line of a streamed response body carried
pub(crate) enum Chunk {
    Fragment(String),
    Fragments(Vec<String>),
    Skip,
    Done,
}

/// Splits a byte stream into lines; `\n` never occurs inside a UTF-8 sequence
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string()
}

/// Turn a line-delimited HTTP body into a fragment stream
pub(crate) fn line_stream<S, B, F>(body: S, mut parse: F) -> FragmentStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    F: FnMut(&str) -> Result<Chunk, GenerationError> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut lines = LineBuffer::default();
        futures::pin_mut!(body);

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(GenerationError::from(e));
                    return;
                }
            };
            for line in lines.push(chunk.as_ref()) {
                match parse(&line) {
                    Ok(Chunk::Fragment(fragment)) => yield Ok(fragment),
                    Ok(Chunk::Fragments(fragments)) => {
                        for fragment in fragments {
                            yield Ok(fragment);
                        }
                    }
                    Ok(Chunk::Skip) => {}
                    Ok(Chunk::Done) => return,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if let Some(line) = lines.finish() {
            match parse(&line) {
                Ok(Chunk::Fragment(fragment)) => yield Ok(fragment),
                Ok(Chunk::Fragments(fragments)) => {
                    for fragment in fragments {
                        yield Ok(fragment);
                    }
                }
                Ok(Chunk::Skip) | Ok(Chunk::Done) => {}
                Err(e) => yield Err(e),
            }
        }
    };
    Box::pin(stream)
}

/// Read an unsuccessful response into a `GenerationError`
pub(crate) async fn status_error(response: reqwest::Response) -> GenerationError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    GenerationError::Status { status, body }
}
