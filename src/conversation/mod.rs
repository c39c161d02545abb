//! Conversation types and state management
//!
//! A [`Conversation`] is the append-only history of one chat session. Turns are
//! never edited after they are appended; the only other mutations are
//! [`Conversation::clear`] and [`Conversation::discard_pending`], which drop
//! whole turns.

pub mod render;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub use render::{ChatMlRenderer, MessageListRenderer, Prompt, PromptRenderer, RenderOptions, TemplateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool call attached to an assistant turn, with its result once executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// One message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,

    /// Tool calls requested by the assistant in this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,

    /// Tool name, for `role = tool` turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Set when the reply was cut short by a generation failure
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,

    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            name: None,
            truncated: false,
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(name: impl Into<String>, result: impl Into<String>) -> Self {
        let mut turn = Self::new(Role::Tool, result);
        turn.name = Some(name.into());
        turn
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("No user turn is awaiting a reply")]
    NoPendingUserTurn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    preamble: Option<Turn>,
    turns: Vec<Turn>,
    /// Index of the user turn whose reply has not been committed yet
    #[serde(skip)]
    pending_from: Option<usize>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            preamble: None,
            turns: Vec::new(),
            pending_from: None,
        }
    }

    /// Seed the conversation with a system preamble that survives `clear()`
    pub fn with_preamble(mut self, prompt: impl Into<String>) -> Self {
        self.preamble = Some(Turn::system(prompt));
        self
    }

    pub fn preamble(&self) -> Option<&Turn> {
        self.preamble.as_ref()
    }

    /// Turns after the preamble, in insertion order
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Preamble followed by every turn, the sequence handed to renderers
    pub fn history(&self) -> Vec<Turn> {
        self.preamble
            .iter()
            .chain(self.turns.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_from.is_some()
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        self.pending_from = Some(self.turns.len());
        self.turns.push(Turn::user(text));
    }

    /// Commit the final reply to the pending user turn
    pub fn append_assistant(&mut self, text: impl Into<String>) -> Result<(), ConversationError> {
        self.complete(Turn::assistant(text))
    }

    /// Commit a reply that was cut short by a generation failure
    pub fn append_partial_assistant(
        &mut self,
        text: impl Into<String>,
    ) -> Result<(), ConversationError> {
        let mut turn = Turn::assistant(text);
        turn.truncated = true;
        self.complete(turn)
    }

    /// Append an assistant turn that requested tools. The exchange stays pending.
    pub fn append_tool_calls(
        &mut self,
        text: impl Into<String>,
        invocations: Vec<ToolInvocation>,
    ) -> Result<(), ConversationError> {
        if self.pending_from.is_none() {
            return Err(ConversationError::NoPendingUserTurn);
        }
        let mut turn = Turn::assistant(text);
        turn.tool_calls = invocations;
        self.turns.push(turn);
        Ok(())
    }

    pub fn append_tool_result(&mut self, name: impl Into<String>, result: impl Into<String>) {
        self.turns.push(Turn::tool(name, result));
    }

    /// Close the pending exchange without a final assistant reply, keeping
    /// its tool turns
    pub fn end_exchange(&mut self) {
        self.pending_from = None;
    }

    /// Drop the pending user turn and everything appended after it
    pub fn discard_pending(&mut self) {
        if let Some(from) = self.pending_from.take() {
            self.turns.truncate(from);
        }
    }

    /// Reset to just the preamble
    pub fn clear(&mut self) {
        self.turns.clear();
        self.pending_from = None;
    }

    pub fn render_prompt(
        &self,
        renderer: &dyn PromptRenderer,
        options: &RenderOptions,
    ) -> Result<Prompt, TemplateError> {
        renderer.render(&self.history(), options)
    }

    fn complete(&mut self, turn: Turn) -> Result<(), ConversationError> {
        if self.pending_from.take().is_none() {
            return Err(ConversationError::NoPendingUserTurn);
        }
        self.turns.push(turn);
        Ok(())
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}
