//! In-process generator that replays canned fragments
//!
//! Used by `--dry-run` (echo mode) and by tests that need exact control over
//! what a backend produces, including mid-stream failures.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::conversation::{Prompt, Role};

use super::{FragmentStream, GenerationError, GenerationParams, Generator};

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Fragment(String),
    Fail(String),
    Pause(Duration),
}

impl ScriptStep {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self::Fragment(text.into())
    }
}

/// Build a script of plain fragments
pub fn fragments<I, S>(items: I) -> Vec<ScriptStep>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(ScriptStep::fragment).collect()
}

#[derive(Debug)]
enum WhenExhausted {
    Echo,
    Fail,
}

/// Replays one script per call, in order
#[derive(Debug)]
pub struct ScriptedGenerator {
    rounds: Mutex<VecDeque<Vec<ScriptStep>>>,
    when_exhausted: WhenExhausted,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedGenerator {
    pub fn new(rounds: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            when_exhausted: WhenExhausted::Fail,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Replies by repeating the latest user message, word by word
    pub fn echo() -> Self {
        Self {
            when_exhausted: WhenExhausted::Echo,
            ..Self::new(Vec::new())
        }
    }

    /// Number of generations started so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, oldest first
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn next_script(&self, prompt: &Prompt) -> Result<Vec<ScriptStep>, GenerationError> {
        let next = self
            .rounds
            .lock()
            .map_err(|_| GenerationError::Backend("script state poisoned".into()))?
            .pop_front();

        match (next, &self.when_exhausted) {
            (Some(script), _) => Ok(script),
            (None, WhenExhausted::Echo) => Ok(echo_script(prompt)),
            (None, WhenExhausted::Fail) => Err(GenerationError::Backend("script exhausted".into())),
        }
    }
}

fn last_user_text(prompt: &Prompt) -> String {
    match prompt {
        Prompt::Messages { turns, .. } => turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.clone())
            .unwrap_or_default(),
        Prompt::Text(text) => text
            .rsplit("<|im_start|>user\n")
            .next()
            .and_then(|tail| tail.split("<|im_end|>").next())
            .unwrap_or_default()
            .to_string(),
    }
}

fn echo_script(prompt: &Prompt) -> Vec<ScriptStep> {
    let text = format!("You said: {}", last_user_text(prompt));
    text.split_inclusive(' ').map(ScriptStep::fragment).collect()
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_stream(
        &self,
        prompt: Prompt,
        _params: &GenerationParams,
    ) -> Result<FragmentStream, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.next_script(&prompt)?;
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt);
        }

        let stream = async_stream::stream! {
            for step in script {
                match step {
                    ScriptStep::Fragment(text) => yield Ok(text),
                    ScriptStep::Pause(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Fail(reason) => {
                        yield Err(GenerationError::Backend(reason));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
