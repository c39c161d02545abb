//! Prompt rendering
//!
//! Renderers turn the ordered turn history into whatever the generation
//! backend consumes: a structured message list for chat APIs, or a single
//! ChatML string for raw completion endpoints. Both reject turn sequences the
//! model template cannot express.

use serde_json::json;
use thiserror::Error;

use super::{Role, Turn};
use crate::tools::ToolDefinition;

/// Errors raised when a turn sequence cannot be rendered
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("No turns to render")]
    NoTurns,

    #[error("System turn at position {index}; only the first turn may be a system turn")]
    MisplacedSystemTurn { index: usize },

    #[error("Tool result at position {index} does not follow an assistant tool call")]
    OrphanToolResult { index: usize },

    #[error("Tool result '{name}' at position {index} matches no pending tool call")]
    UnmatchedToolResult { index: usize, name: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A rendered, model-ready prompt
#[derive(Debug, Clone)]
pub enum Prompt {
    /// Structured messages for chat-completion style endpoints
    Messages {
        turns: Vec<Turn>,
        enable_thinking: bool,
    },
    /// Fully templated text for raw completion endpoints
    Text(String),
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Let the model open a reasoning block before answering
    pub enable_thinking: bool,

    /// Tool definitions advertised to the model
    pub tools: Vec<ToolDefinition>,

    /// End the prompt with an open assistant turn
    pub add_generation_prompt: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            enable_thinking: false,
            tools: Vec::new(),
            add_generation_prompt: true,
        }
    }
}

pub trait PromptRenderer: Send + Sync {
    fn render(&self, turns: &[Turn], options: &RenderOptions) -> Result<Prompt, TemplateError>;
}

/// Check the structural rules every template relies on
pub fn validate_turns(turns: &[Turn]) -> Result<(), TemplateError> {
    if turns.is_empty() {
        return Err(TemplateError::NoTurns);
    }

    let mut open_calls: Option<&Turn> = None;

    for (index, turn) in turns.iter().enumerate() {
        match turn.role {
            Role::System if index != 0 => {
                return Err(TemplateError::MisplacedSystemTurn { index });
            }
            Role::System => {}
            Role::User => open_calls = None,
            Role::Assistant => {
                open_calls = turn.has_tool_calls().then_some(turn);
            }
            Role::Tool => {
                let caller = open_calls.ok_or(TemplateError::OrphanToolResult { index })?;
                if let Some(name) = &turn.name {
                    if !caller.tool_calls.iter().any(|c| &c.name == name) {
                        return Err(TemplateError::UnmatchedToolResult {
                            index,
                            name: name.clone(),
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

/// Passes turns through as messages; tool definitions go into the system turn
#[derive(Debug, Default, Clone)]
pub struct MessageListRenderer;

impl PromptRenderer for MessageListRenderer {
    fn render(&self, turns: &[Turn], options: &RenderOptions) -> Result<Prompt, TemplateError> {
        validate_turns(turns)?;

        let mut turns = turns.to_vec();
        if !options.tools.is_empty() {
            let section = tools_section(&options.tools)?;
            match turns.first_mut() {
                Some(first) if first.role == Role::System => {
                    first.content = format!("{}\n\n{}", first.content, section);
                }
                _ => turns.insert(0, Turn::system(section)),
            }
        }

        Ok(Prompt::Messages {
            turns,
            enable_thinking: options.enable_thinking,
        })
    }
}

/// ChatML template as used by Qwen-family checkpoints
#[derive(Debug, Default, Clone)]
pub struct ChatMlRenderer;

impl ChatMlRenderer {
    fn open(out: &mut String, role: &str) {
        out.push_str("<|im_start|>");
        out.push_str(role);
        out.push('\n');
    }

    fn close(out: &mut String) {
        out.push_str("<|im_end|>\n");
    }
}

impl PromptRenderer for ChatMlRenderer {
    fn render(&self, turns: &[Turn], options: &RenderOptions) -> Result<Prompt, TemplateError> {
        validate_turns(turns)?;

        let mut out = String::new();
        let (system, rest) = match turns.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(first), rest),
            _ => (None, turns),
        };

        if system.is_some() || !options.tools.is_empty() {
            Self::open(&mut out, "system");
            if let Some(system) = system {
                out.push_str(&system.content);
            }
            if !options.tools.is_empty() {
                if system.is_some() {
                    out.push_str("\n\n");
                }
                out.push_str(&tools_section(&options.tools)?);
            }
            Self::close(&mut out);
        }

        for turn in rest {
            match turn.role {
                Role::User => {
                    Self::open(&mut out, "user");
                    out.push_str(&turn.content);
                }
                Role::Assistant => {
                    Self::open(&mut out, "assistant");
                    out.push_str(&turn.content);
                    // calls the model already wrote as tagged blocks are not repeated
                    let calls = if turn.content.contains("<tool_call>") {
                        &[][..]
                    } else {
                        &turn.tool_calls[..]
                    };
                    for call in calls {
                        let body = json!({ "name": call.name, "arguments": call.arguments });
                        out.push_str("\n<tool_call>\n");
                        out.push_str(&serde_json::to_string(&body)?);
                        out.push_str("\n</tool_call>");
                    }
                }
                Role::Tool => {
                    Self::open(&mut out, "user");
                    out.push_str("<tool_response>\n");
                    out.push_str(&turn.content);
                    out.push_str("\n</tool_response>");
                }
                // validate_turns only admits a system turn at the front
                Role::System => continue,
            }
            Self::close(&mut out);
        }

        if options.add_generation_prompt {
            Self::open(&mut out, "assistant");
            if !options.enable_thinking {
                out.push_str("<think>\n\n</think>\n\n");
            }
        }

        Ok(Prompt::Text(out))
    }
}

fn tools_section(tools: &[ToolDefinition]) -> Result<String, TemplateError> {
    let mut signatures = Vec::with_capacity(tools.len());
    for tool in tools {
        signatures.push(serde_json::to_string(&tool.function_spec())?);
    }

    Ok(format!(
        "# Tools\n\nYou may call one or more functions to assist with the user query.\n\n\
        You are provided with function signatures within <tools></tools> XML tags:\n\
        <tools>\n{}\n</tools>\n\n\
        For each function call, return a json object with function name and arguments \
        within <tool_call></tool_call> XML tags:\n\
        <tool_call>\n{{\"name\": <function-name>, \"arguments\": <args-json-object>}}\n</tool_call>",
        signatures.join("\n")
    ))
}
