//! Model profiles loaded from TOML files
//!
//! A profile describes one deployment of the chat core: which backend to talk
//! to, how to sample, how to recognise suppressed segments, how sessions
//! start, and which tools are available.
//!
//! # Example Profile
//!
//! ```toml
//! [model]
//! provider = "ollama"
//! model = "qwen3:8b"
//! streaming = true
//! timeout_secs = 120
//!
//! [sampling]
//! temperature = 0.6
//! top_p = 0.95
//! top_k = 20
//!
//! [markers]
//! preset = "think_tags"
//!
//! [session]
//! persona = "default"
//! partial_policy = "commit"
//! enable_thinking = true
//!
//! [tools]
//! enabled = true
//! allowed_paths = ["/srv/shared"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::conversation::{ChatMlRenderer, MessageListRenderer, PromptRenderer};
use crate::core::{EngineOptions, PartialPolicy, SuppressionMarkers, DEFAULT_MAX_TOOL_ROUNDS};
use crate::providers::{GenerationParams, SamplingConfig};
use crate::tools::{FilesystemConfig, ListFiles, ReadFiles, ToolRegistry};

use super::prompts::{builtin, PromptError, PromptManager};

/// Root profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatProfile {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub markers: MarkersConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name: "ollama", "openai", "vllm", "scripted"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Custom API endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    /// API key environment variable name (for hosted providers)
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Sent as the `OpenAI-Organization` header by OpenAI-compatible backends
    #[serde(default)]
    pub organization: Option<String>,

    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Deadline for a single generation
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "qwen3:8b".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            endpoint: None,
            api_key_env: None,
            organization: None,
            streaming: true,
            timeout_secs: None,
            max_output_tokens: None,
        }
    }
}

/// Suppressed-segment delimiters: a preset name, or an explicit pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkersConfig {
    /// "think_tags", "blank_lines" or "none"
    #[serde(default)]
    pub preset: Option<String>,

    #[serde(default)]
    pub enter: Option<String>,

    #[serde(default)]
    pub exit: Option<String>,
}

impl MarkersConfig {
    pub fn resolve(&self) -> Result<Option<SuppressionMarkers>, ConfigError> {
        match (&self.enter, &self.exit) {
            (Some(enter), Some(exit)) => {
                if enter.is_empty() || exit.is_empty() {
                    return Err(ConfigError::Validation("markers must not be empty".into()));
                }
                return Ok(Some(SuppressionMarkers::new(enter.clone(), exit.clone())));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Validation(
                    "markers.enter and markers.exit must be set together".into(),
                ));
            }
            (None, None) => {}
        }

        match self.preset.as_deref() {
            None | Some("none") => Ok(None),
            Some("think_tags") => Ok(Some(SuppressionMarkers::think_tags())),
            Some("blank_lines") => Ok(Some(SuppressionMarkers::blank_lines())),
            Some(other) => Err(ConfigError::Validation(format!(
                "unknown marker preset '{}'",
                other
            ))),
        }
    }
}

/// How the prompt is rendered for the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Structured messages, templated by the server
    #[default]
    Messages,
    /// ChatML text sent to a raw completion endpoint
    ChatMl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Explicit system preamble; takes precedence over `persona`
    #[serde(default)]
    pub preamble: Option<String>,

    /// Built-in persona name, or a file name in `persona_dir`
    #[serde(default)]
    pub persona: Option<String>,

    #[serde(default)]
    pub persona_dir: Option<PathBuf>,

    #[serde(default)]
    pub partial_policy: PartialPolicy,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub enable_thinking: bool,

    #[serde(default)]
    pub template: TemplateKind,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_generations: usize,
}

fn default_channel_capacity() -> usize {
    64
}

fn default_max_concurrent() -> usize {
    1
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preamble: None,
            persona: None,
            persona_dir: None,
            partial_policy: PartialPolicy::default(),
            channel_capacity: default_channel_capacity(),
            enable_thinking: false,
            template: TemplateKind::default(),
            max_concurrent_generations: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Paths the filesystem tools may touch
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,

    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_max_tool_rounds() -> usize {
    DEFAULT_MAX_TOOL_ROUNDS
}

fn default_max_file_size() -> u64 {
    FilesystemConfig::default().max_file_size
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_paths: vec![],
            max_tool_rounds: default_max_tool_rounds(),
            max_file_size: default_max_file_size(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Persona error: {0}")]
    Prompt(#[from] PromptError),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ChatProfile {
    /// Load and validate a profile from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load and validate a profile from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let profile: ChatProfile = toml::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.model.trim().is_empty() {
            return Err(ConfigError::Validation("model.model must not be empty".into()));
        }
        if self.session.channel_capacity == 0 {
            return Err(ConfigError::Validation("session.channel_capacity must be at least 1".into()));
        }
        if self.session.max_concurrent_generations == 0 {
            return Err(ConfigError::Validation(
                "session.max_concurrent_generations must be at least 1".into(),
            ));
        }
        if self.tools.max_tool_rounds == 0 {
            return Err(ConfigError::Validation("tools.max_tool_rounds must be at least 1".into()));
        }
        if self.model.timeout_secs == Some(0) {
            return Err(ConfigError::Validation("model.timeout_secs must be positive".into()));
        }
        if self.tools.enabled && self.tools.allowed_paths.is_empty() {
            return Err(ConfigError::Validation(
                "tools.allowed_paths is required when tools are enabled".into(),
            ));
        }
        self.markers.resolve()?;
        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            params: GenerationParams {
                model: self.model.model.clone(),
                sampling: self.sampling.clone(),
                max_output_tokens: self.model.max_output_tokens,
                reasoning_markers: None,
            },
            streaming: self.model.streaming,
            enable_thinking: self.session.enable_thinking,
            partial_policy: self.session.partial_policy,
            channel_capacity: self.session.channel_capacity,
            generation_timeout: self.model.timeout_secs.map(Duration::from_secs),
            max_tool_rounds: self.tools.max_tool_rounds,
            max_concurrent_generations: self.session.max_concurrent_generations,
        }
    }

    pub fn renderer(&self) -> Arc<dyn PromptRenderer> {
        match self.session.template {
            TemplateKind::Messages => Arc::new(MessageListRenderer),
            TemplateKind::ChatMl => Arc::new(ChatMlRenderer),
        }
    }

    /// The filesystem tools, when enabled
    pub fn tool_registry(&self) -> Option<ToolRegistry> {
        if !self.tools.enabled {
            return None;
        }

        let fs_config = FilesystemConfig {
            allowed_paths: self.tools.allowed_paths.clone(),
            max_file_size: self.tools.max_file_size,
        };
        let mut registry = ToolRegistry::new();
        registry.register(ListFiles::new(fs_config.clone()));
        registry.register(ReadFiles::new(fs_config));
        Some(registry)
    }

    /// Resolve the session preamble: explicit text, then persona, then the
    /// built-in default for the tool setting
    pub async fn preamble(&self) -> Result<String, ConfigError> {
        if let Some(preamble) = &self.session.preamble {
            return Ok(preamble.clone());
        }

        if let Some(persona) = &self.session.persona {
            if let Some(text) = builtin::lookup(persona) {
                return Ok(text.to_string());
            }
            let dir = self.session.persona_dir.as_ref().ok_or_else(|| {
                ConfigError::Validation(format!(
                    "persona '{}' is not built in and session.persona_dir is not set",
                    persona
                ))
            })?;
            let mut manager = PromptManager::new(dir);
            return Ok(manager.load(persona).await?.system_prompt.content.clone());
        }

        Ok(if self.tools.enabled {
            builtin::AGENT.to_string()
        } else {
            builtin::DEFAULT.to_string()
        })
    }
}
