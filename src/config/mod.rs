//! Application configuration

pub mod profile;
pub mod prompts;

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use profile::{
    ChatProfile, ConfigError, MarkersConfig, ModelConfig, SessionConfig, TemplateKind, ToolsConfig,
};
pub use prompts::{builtin as prompts_builtin, PromptManager, PromptTemplate};

/// Process-level settings taken from the environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub ollama_url: Option<String>,
    pub openai_base_url: Option<String>,
    pub openai_api_key: Option<String>,
    /// Profile used when none is given on the command line
    pub profile_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            ollama_url: env::var("OLLAMA_URL").ok(),
            openai_base_url: env::var("OPENAI_BASE_URL").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            profile_path: env::var("MOXIE_CHAT_PROFILE").ok().map(PathBuf::from),
        })
    }
}
