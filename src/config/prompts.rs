//! Preambles and persona management
//!
//! A preamble is the system turn every new conversation starts with. Besides
//! the built-ins, personas can be loaded from TOML files.
//!
//! # Example Persona File
//!
//! ```toml
//! [persona]
//! name = "Mobile Chat"
//! description = "Short answers for a phone screen"
//!
//! [system_prompt]
//! content = """
//! You are an assistant that provides concise responses...
//! """
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A persona loaded from a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub persona: PersonaInfo,
    pub system_prompt: SystemPrompt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaInfo {
    /// Display name of the persona
    pub name: String,

    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub content: String,
}

/// Loads persona files from a directory and caches them by name
#[derive(Debug)]
pub struct PromptManager {
    prompts_dir: PathBuf,
    cache: HashMap<String, PromptTemplate>,
}

impl PromptManager {
    pub fn new(prompts_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
            cache: HashMap::new(),
        }
    }

    /// Load a persona by name (file name without extension)
    pub async fn load(&mut self, name: &str) -> Result<&PromptTemplate, PromptError> {
        if !self.cache.contains_key(name) {
            let path = self.prompts_dir.join(format!("{}.toml", name));
            if !path.exists() {
                return Err(PromptError::NotFound(name.to_string()));
            }
            let template = Self::load_from_file(&path).await?;
            self.cache.insert(name.to_string(), template);
        }

        self.cache
            .get(name)
            .ok_or_else(|| PromptError::NotFound(name.to_string()))
    }

    pub async fn load_from_file(path: &Path) -> Result<PromptTemplate, PromptError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| PromptError::IoError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| PromptError::ParseError(e.to_string()))
    }

    /// Persona names available in the directory, sorted
    pub async fn list_available(&self) -> Result<Vec<String>, PromptError> {
        let mut prompts = Vec::new();

        let mut entries = fs::read_dir(&self.prompts_dir)
            .await
            .map_err(|e| PromptError::IoError(e.to_string()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PromptError::IoError(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "toml") {
                if let Some(stem) = path.file_stem() {
                    prompts.push(stem.to_string_lossy().to_string());
                }
            }
        }

        prompts.sort();
        Ok(prompts)
    }
}

/// Errors from persona loading
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Persona not found: {0}")]
    NotFound(String),
}

/// Built-in preambles that don't require files
pub mod builtin {
    /// General knowledge assistant
    pub const DEFAULT: &str = "You are a general knowledge assistant, answering in a cheerful mood.";

    /// Replies sized for a phone chat window
    pub const MOBILE_CHAT: &str = "You are an assistant that provides concise responses to fit a mobile phone chat, usually using markdown to enrich the text.";

    /// Tool-using agent
    pub const AGENT: &str = "You are a helpful assistant with access to tools. When the user asks you to perform a task that requires a tool, you MUST use the available tools by outputting a JSON tool call. Available tools: list_files - use this to list files in a directory, read_files - use this to read the contents of a file.";

    /// Resolve a built-in persona name
    pub fn lookup(name: &str) -> Option<&'static str> {
        match name.to_lowercase().as_str() {
            "default" | "cheerful" => Some(DEFAULT),
            "mobile" | "mobile_chat" => Some(MOBILE_CHAT),
            "agent" | "tools" => Some(AGENT),
            _ => None,
        }
    }
}
