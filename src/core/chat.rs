//! Chat engine with tool calling orchestration
//!
//! The ChatEngine drives one user turn:
//! 1. Appends the user message to the conversation
//! 2. Renders the history into a prompt
//! 3. Streams a generation through the collector into the sink
//! 4. Executes any tool calls and feeds the results back, for a bounded
//!    number of rounds
//! 5. Commits the final assistant turn

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::conversation::{
    Conversation, ConversationError, Prompt, PromptRenderer, RenderOptions, TemplateError,
    ToolInvocation,
};
use crate::providers::{GenerationError, GenerationParams, Generator, SamplingConfig};
use crate::tools::{ToolDefinition, ToolRegistry};

use super::collector::{CollectedResponse, Interrupted, Sink, StreamCollector, SuppressionMarkers};
use super::tool_calls::parse_tool_calls;

/// Default cap on generations per user turn when tools are enabled
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 5;

/// What happens to the pending exchange when a generation fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialPolicy {
    /// Keep the visible text as a truncated assistant turn
    #[default]
    Commit,
    /// Drop the user turn and everything after it
    Discard,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub params: GenerationParams,

    /// Stream fragments as they are produced; otherwise wait for the full text
    pub streaming: bool,

    pub enable_thinking: bool,

    pub partial_policy: PartialPolicy,

    /// Bound of the fragment channel between worker and collector
    pub channel_capacity: usize,

    /// Deadline for a single generation. Expiry aborts the worker and
    /// discards the exchange.
    pub generation_timeout: Option<Duration>,

    pub max_tool_rounds: usize,

    /// Generations allowed to run at once across all sessions
    pub max_concurrent_generations: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            params: GenerationParams {
                model: String::new(),
                sampling: SamplingConfig::default(),
                max_output_tokens: None,
                reasoning_markers: None,
            },
            streaming: true,
            enable_thinking: false,
            partial_policy: PartialPolicy::default(),
            channel_capacity: 64,
            generation_timeout: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            max_concurrent_generations: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Complete,
    /// Generation failed; the partial text was committed
    Truncated,
    /// The model was still calling tools when the round cap was reached
    ToolRoundsExhausted,
}

/// Summary of a tool call for the response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub output: String,
    pub success: bool,
    pub duration_ms: u64,
    pub round: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReply {
    pub content: String,
    pub status: ReplyStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallSummary>,
    /// Fragments received across all rounds
    pub token_count: usize,
    pub rounds: usize,
    /// Generation failure behind a truncated reply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Errors from the chat engine
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Generation failed: {source}")]
    Generation {
        /// Visible text produced before the failure
        partial: String,
        #[source]
        source: GenerationError,
    },

    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),
}

/// Aborts the generation worker unless it has been joined
struct Worker(Option<JoinHandle<()>>);

impl Worker {
    async fn join(mut self) -> Result<(), GenerationError> {
        match self.0.take() {
            Some(handle) => handle.await.map_err(|_| GenerationError::WorkerPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// The core chat engine
pub struct ChatEngine {
    generator: Arc<dyn Generator>,
    renderer: Arc<dyn PromptRenderer>,
    tools: Option<ToolRegistry>,
    markers: Option<SuppressionMarkers>,
    options: EngineOptions,
    permits: Arc<Semaphore>,
}

impl ChatEngine {
    pub fn new(
        generator: Arc<dyn Generator>,
        renderer: Arc<dyn PromptRenderer>,
        options: EngineOptions,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent_generations.max(1)));
        Self {
            generator,
            renderer,
            tools: None,
            markers: None,
            options,
            permits,
        }
    }

    /// Enable the tool loop with these tools
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Suppression markers for the collector; backends that report
    /// reasoning separately frame it with the same pair
    pub fn with_markers(mut self, markers: Option<SuppressionMarkers>) -> Self {
        self.options.params.reasoning_markers = markers.clone();
        self.markers = markers;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    /// Get all available tools
    pub fn available_tools(&self) -> Vec<ToolDefinition> {
        self.tools
            .as_ref()
            .map(ToolRegistry::definitions)
            .unwrap_or_default()
    }

    /// Run one user turn to completion against `conversation`
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        user_text: &str,
        sink: &mut dyn Sink,
    ) -> Result<TurnReply, ChatError> {
        let started = Instant::now();
        let result = self.drive(conversation, user_text, sink).await;
        sink.finish();

        match &result {
            Ok(reply) => tracing::debug!(
                conversation = %conversation.id,
                fragments = reply.token_count,
                rounds = reply.rounds,
                status = ?reply.status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Turn finished"
            ),
            Err(e) => tracing::debug!(
                conversation = %conversation.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Turn failed: {}",
                e
            ),
        }
        result
    }

    async fn drive(
        &self,
        conversation: &mut Conversation,
        user_text: &str,
        sink: &mut dyn Sink,
    ) -> Result<TurnReply, ChatError> {
        conversation.append_user(user_text);

        let render_options = RenderOptions {
            enable_thinking: self.options.enable_thinking,
            tools: self.available_tools(),
            add_generation_prompt: true,
        };
        let max_rounds = self.options.max_tool_rounds.max(1);
        let mut summaries = Vec::new();
        let mut token_count = 0;
        let mut round = 0;

        loop {
            round += 1;

            let prompt = match conversation.render_prompt(self.renderer.as_ref(), &render_options) {
                Ok(prompt) => prompt,
                Err(e) => {
                    conversation.discard_pending();
                    return Err(e.into());
                }
            };

            let collected = match self.generate(prompt, sink).await {
                Ok(collected) => collected,
                Err(interrupted) => {
                    token_count += interrupted.token_count;
                    return self.recover(conversation, interrupted, summaries, token_count, round);
                }
            };
            token_count += collected.token_count;

            let calls = match &self.tools {
                Some(_) => parse_tool_calls(&collected.text),
                None => Vec::new(),
            };
            let Some(tools) = self.tools.as_ref().filter(|_| !calls.is_empty()) else {
                conversation.append_assistant(collected.text.clone())?;
                return Ok(TurnReply {
                    content: collected.text,
                    status: ReplyStatus::Complete,
                    tool_calls: summaries,
                    token_count,
                    rounds: round,
                    error: None,
                });
            };

            tracing::debug!(round, calls = calls.len(), "Executing tool calls");
            let mut invocations = Vec::with_capacity(calls.len());
            for call in calls {
                let outcome = tools.invoke(&call).await;
                summaries.push(ToolCallSummary {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    output: outcome.output.clone(),
                    success: outcome.success,
                    duration_ms: outcome.duration_ms,
                    round,
                });
                invocations.push(ToolInvocation {
                    name: call.name,
                    arguments: call.arguments,
                    result: Some(outcome.output),
                });
            }

            let results: Vec<(String, String)> = invocations
                .iter()
                .map(|i| (i.name.clone(), i.result.clone().unwrap_or_default()))
                .collect();
            conversation.append_tool_calls(collected.text.clone(), invocations)?;
            for (name, output) in results {
                conversation.append_tool_result(name, output);
            }

            if round >= max_rounds {
                tracing::warn!(rounds = round, "Tool round limit reached");
                conversation.end_exchange();
                return Ok(TurnReply {
                    content: collected.text,
                    status: ReplyStatus::ToolRoundsExhausted,
                    tool_calls: summaries,
                    token_count,
                    rounds: round,
                    error: None,
                });
            }
        }
    }

    /// Apply the partial policy after a failed generation
    fn recover(
        &self,
        conversation: &mut Conversation,
        interrupted: Interrupted,
        summaries: Vec<ToolCallSummary>,
        token_count: usize,
        rounds: usize,
    ) -> Result<TurnReply, ChatError> {
        let Interrupted { partial, source, .. } = interrupted;
        tracing::warn!(partial_len = partial.len(), "Generation failed: {}", source);

        let commit = self.options.partial_policy == PartialPolicy::Commit
            && !partial.is_empty()
            && !matches!(source, GenerationError::Timeout(_));

        if !commit {
            conversation.discard_pending();
            return Err(ChatError::Generation { partial, source });
        }

        conversation.append_partial_assistant(partial.clone())?;
        Ok(TurnReply {
            content: partial,
            status: ReplyStatus::Truncated,
            tool_calls: summaries,
            token_count,
            rounds,
            error: Some(source.to_string()),
        })
    }

    /// One generation, collected into visible text
    async fn generate(
        &self,
        prompt: Prompt,
        sink: &mut dyn Sink,
    ) -> Result<CollectedResponse, Interrupted> {
        let mut collector = StreamCollector::new(self.markers.clone());

        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Err(collector.interrupt(GenerationError::Backend(
                    "generation queue closed".into(),
                )))
            }
        };

        if !self.options.streaming {
            let generation = self.generator.generate(prompt, &self.options.params);
            let text = match self.options.generation_timeout {
                Some(limit) => match tokio::time::timeout(limit, generation).await {
                    Ok(result) => result,
                    Err(_) => Err(GenerationError::Timeout(limit)),
                },
                None => generation.await,
            };
            return match text {
                Ok(text) => {
                    collector.accept(&text, sink);
                    Ok(collector.finish())
                }
                Err(e) => Err(collector.interrupt(e)),
            };
        }

        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let generator = Arc::clone(&self.generator);
        let params = self.options.params.clone();

        let worker = Worker(Some(tokio::spawn(async move {
            let mut stream = match generator.generate_stream(prompt, &params).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            while let Some(item) = stream.next().await {
                let failed = item.is_err();
                // receiver gone means the turn was abandoned
                if tx.send(item).await.is_err() || failed {
                    return;
                }
            }
        })));

        let fragments = ReceiverStream::new(rx);
        let collected = match self.options.generation_timeout {
            None => collector.drain(fragments, sink).await,
            Some(limit) => {
                let deadline = tokio::time::Instant::now() + limit;
                let bounded = async_stream::stream! {
                    let mut fragments = fragments;
                    loop {
                        match tokio::time::timeout_at(deadline, fragments.next()).await {
                            Ok(Some(item)) => yield item,
                            Ok(None) => break,
                            Err(_) => {
                                yield Err(GenerationError::Timeout(limit));
                                break;
                            }
                        }
                    }
                };
                collector.drain(bounded, sink).await
            }
        }?;

        // a worker that panicked closes the channel like a finished one
        if let Err(source) = worker.join().await {
            return Err(Interrupted {
                partial: collected.text,
                token_count: collected.token_count,
                source,
            });
        }

        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ChatMlRenderer, MessageListRenderer, Role};
    use crate::core::collector::BufferSink;
    use crate::providers::scripted::{fragments, ScriptStep, ScriptedGenerator};
    use crate::providers::FragmentStream;
    use crate::tools::{Tool, ToolError};
    use async_trait::async_trait;
    use serde_json::json;

    struct Weather;

    #[async_trait]
    impl Tool for Weather {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("get_weather", "Current weather for a city")
        }

        async fn call(&self, arguments: Map<String, Value>) -> Result<String, ToolError> {
            let city = crate::tools::required_str("get_weather", &arguments, "city")?;
            Ok(format!("Sunny in {}", city))
        }
    }

    fn tools() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Weather);
        registry
    }

    fn engine(generator: Arc<ScriptedGenerator>, options: EngineOptions) -> ChatEngine {
        ChatEngine::new(generator, Arc::new(MessageListRenderer), options)
    }

    fn commit_options() -> EngineOptions {
        EngineOptions::default()
    }

    #[tokio::test]
    async fn test_plain_turn() {
        let generator = Arc::new(ScriptedGenerator::new(vec![fragments(["Hi", " there", "!"])]));
        let engine = engine(generator.clone(), commit_options());
        let mut conversation = Conversation::new().with_preamble("Be cheerful");
        let mut sink = BufferSink::default();

        let reply = engine.run_turn(&mut conversation, "Hello", &mut sink).await.unwrap();

        assert_eq!(reply.content, "Hi there!");
        assert_eq!(reply.status, ReplyStatus::Complete);
        assert_eq!(reply.token_count, 3);
        assert_eq!(reply.rounds, 1);
        assert!(sink.finished);
        assert_eq!(sink.visible, "Hi there!");

        let roles: Vec<Role> = conversation.turns().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert!(!conversation.has_pending());

        match &generator.prompts()[0] {
            Prompt::Messages { turns, .. } => {
                assert_eq!(turns.len(), 2);
                assert_eq!(turns[0].role, Role::System);
                assert_eq!(turns[1].content, "Hello");
            }
            other => panic!("unexpected prompt: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_thinking_is_streamed_but_not_stored() {
        let generator = Arc::new(ScriptedGenerator::new(vec![fragments([
            "<think>\n",
            "user wants a greeting",
            "</think>\n\n",
            "Hello!",
        ])]));
        let engine = engine(generator, commit_options()).with_markers(Some(SuppressionMarkers::think_tags()));
        let mut conversation = Conversation::new();
        let mut sink = BufferSink::default();

        let reply = engine.run_turn(&mut conversation, "Hi", &mut sink).await.unwrap();

        assert_eq!(reply.content, "Hello!");
        assert_eq!(reply.token_count, 4);
        assert_eq!(sink.suppressed, "user wants a greeting");
        assert_eq!(conversation.last().unwrap().content, "Hello!");
    }

    #[tokio::test]
    async fn test_history_accumulates_across_turns() {
        let generator = Arc::new(ScriptedGenerator::new(vec![fragments(["one"]), fragments(["two"])]));
        let engine = ChatEngine::new(generator.clone(), Arc::new(ChatMlRenderer), commit_options());
        let mut conversation = Conversation::new();
        let mut sink = BufferSink::default();

        engine.run_turn(&mut conversation, "first", &mut sink).await.unwrap();
        engine.run_turn(&mut conversation, "second", &mut sink).await.unwrap();

        assert_eq!(conversation.len(), 4);
        match &generator.prompts()[1] {
            Prompt::Text(text) => {
                let first = text.find("first").unwrap();
                let one = text.find("one").unwrap();
                let second = text.find("second").unwrap();
                assert!(first < one && one < second);
            }
            other => panic!("unexpected prompt: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            fragments([r#"[get_weather(city="Paris")]"#]),
            fragments(["It is sunny in Paris."]),
        ]));
        let engine = engine(generator.clone(), commit_options()).with_tools(tools());
        let mut conversation = Conversation::new();
        let mut sink = BufferSink::default();

        let reply = engine
            .run_turn(&mut conversation, "Weather in Paris?", &mut sink)
            .await
            .unwrap();

        assert_eq!(reply.status, ReplyStatus::Complete);
        assert_eq!(reply.content, "It is sunny in Paris.");
        assert_eq!(reply.rounds, 2);
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].output, "Sunny in Paris");
        assert_eq!(reply.tool_calls[0].arguments["city"], json!("Paris"));

        let turns = conversation.turns();
        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(turns[1].tool_calls[0].result.as_deref(), Some("Sunny in Paris"));
        assert_eq!(turns[2].name.as_deref(), Some("get_weather"));
        assert_eq!(turns[2].content, "Sunny in Paris");

        // the second prompt carries the tool result
        match &generator.prompts()[1] {
            Prompt::Messages { turns, .. } => assert_eq!(turns.last().unwrap().role, Role::Tool),
            other => panic!("unexpected prompt: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_result_is_fed_back() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            fragments([r#"[launch_rocket(target="moon")]"#]),
            fragments(["I cannot do that."]),
        ]));
        let engine = engine(generator, commit_options()).with_tools(tools());
        let mut conversation = Conversation::new();
        let mut sink = BufferSink::default();

        let reply = engine.run_turn(&mut conversation, "Go", &mut sink).await.unwrap();

        assert_eq!(reply.status, ReplyStatus::Complete);
        assert!(!reply.tool_calls[0].success);
        assert_eq!(conversation.turns()[2].content, "Error: Unknown function 'launch_rocket'");
    }

    #[tokio::test]
    async fn test_tool_rounds_are_capped() {
        let call = r#"[get_weather(city="Oslo")]"#;
        let mut scripts = vec![fragments([call]); DEFAULT_MAX_TOOL_ROUNDS];
        scripts.push(fragments(["It is cold in Oslo."]));
        let generator = Arc::new(ScriptedGenerator::new(scripts));
        let engine = engine(generator.clone(), commit_options()).with_tools(tools());
        let mut conversation = Conversation::new();
        let mut sink = BufferSink::default();

        let reply = engine.run_turn(&mut conversation, "Loop", &mut sink).await.unwrap();

        assert_eq!(reply.status, ReplyStatus::ToolRoundsExhausted);
        assert_eq!(reply.rounds, DEFAULT_MAX_TOOL_ROUNDS);
        assert_eq!(generator.calls(), DEFAULT_MAX_TOOL_ROUNDS);
        assert_eq!(reply.tool_calls.len(), DEFAULT_MAX_TOOL_ROUNDS);
        assert!(!conversation.has_pending());
        // user turn plus an assistant and a tool turn per round
        assert_eq!(conversation.len(), 1 + 2 * DEFAULT_MAX_TOOL_ROUNDS);
        // the plain answer scripted for a sixth generation is never produced
        assert_ne!(reply.content, "It is cold in Oslo.");
        assert!(conversation.turns().iter().all(|t| t.content != "It is cold in Oslo."));
    }

    #[tokio::test]
    async fn test_tool_syntax_ignored_without_tools() {
        let generator = Arc::new(ScriptedGenerator::new(vec![fragments([r#"[get_weather(city="Paris")]"#])]));
        let engine = engine(generator.clone(), commit_options());
        let mut conversation = Conversation::new();

        let reply = engine
            .run_turn(&mut conversation, "hi", &mut BufferSink::default())
            .await
            .unwrap();

        assert_eq!(reply.status, ReplyStatus::Complete);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_partial_reply_is_committed() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![
            ScriptStep::fragment("Hello "),
            ScriptStep::fragment("wor"),
            ScriptStep::Fail("connection reset".into()),
        ]]));
        let engine = engine(generator, commit_options());
        let mut conversation = Conversation::new();
        let mut sink = BufferSink::default();

        let reply = engine.run_turn(&mut conversation, "Hi", &mut sink).await.unwrap();

        assert_eq!(reply.status, ReplyStatus::Truncated);
        assert_eq!(reply.content, "Hello wor");
        assert!(reply.error.unwrap().contains("connection reset"));
        let last = conversation.last().unwrap();
        assert!(last.truncated);
        assert_eq!(last.content, "Hello wor");
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn test_partial_reply_is_discarded() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            fragments(["fine"]),
            vec![ScriptStep::fragment("Hello "), ScriptStep::Fail("boom".into())],
        ]));
        let options = EngineOptions {
            partial_policy: PartialPolicy::Discard,
            ..EngineOptions::default()
        };
        let engine = engine(generator, options);
        let mut conversation = Conversation::new();
        let mut sink = BufferSink::default();

        engine.run_turn(&mut conversation, "first", &mut sink).await.unwrap();
        let err = engine.run_turn(&mut conversation, "second", &mut sink).await.unwrap_err();

        match err {
            ChatError::Generation { partial, .. } => assert_eq!(partial, "Hello "),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.last().unwrap().content, "fine");
        assert!(!conversation.has_pending());
    }

    #[tokio::test]
    async fn test_template_error_leaves_conversation_unchanged() {
        let generator = Arc::new(ScriptedGenerator::new(vec![fragments(["never"])]));
        let engine = engine(generator.clone(), commit_options());
        let mut conversation = Conversation::new();
        // a tool result with no preceding tool call cannot be rendered
        conversation.append_tool_result("list_files", "a.txt");
        let before = conversation.len();

        let err = engine
            .run_turn(&mut conversation, "hello", &mut BufferSink::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ChatError::Template(TemplateError::OrphanToolResult { .. })));
        assert_eq!(conversation.len(), before);
        assert!(!conversation.has_pending());
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout_discards_exchange() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![
            ScriptStep::fragment("slow"),
            ScriptStep::Pause(Duration::from_secs(5)),
            ScriptStep::fragment("never"),
        ]]));
        let options = EngineOptions {
            generation_timeout: Some(Duration::from_millis(50)),
            ..EngineOptions::default()
        };
        let engine = engine(generator, options);
        let mut conversation = Conversation::new();

        let err = engine
            .run_turn(&mut conversation, "hi", &mut BufferSink::default())
            .await
            .unwrap_err();

        match err {
            ChatError::Generation { partial, source } => {
                assert_eq!(partial, "slow");
                assert!(matches!(source, GenerationError::Timeout(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(conversation.is_empty());
    }

    #[tokio::test]
    async fn test_batch_mode_feeds_one_fragment() {
        let generator = Arc::new(ScriptedGenerator::new(vec![fragments(["a", "b", "c"])]));
        let options = EngineOptions {
            streaming: false,
            ..EngineOptions::default()
        };
        let engine = engine(generator, options);
        let mut conversation = Conversation::new();
        let mut sink = BufferSink::default();

        let reply = engine.run_turn(&mut conversation, "hi", &mut sink).await.unwrap();
        assert_eq!(reply.content, "abc");
        assert_eq!(reply.token_count, 1);
        assert_eq!(sink.fragments.len(), 1);
    }

    struct Panicking;

    #[async_trait]
    impl Generator for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn generate_stream(
            &self,
            _prompt: Prompt,
            _params: &GenerationParams,
        ) -> Result<FragmentStream, GenerationError> {
            panic!("backend crashed");
        }
    }

    #[tokio::test]
    async fn test_worker_panic_is_reported() {
        let engine = ChatEngine::new(Arc::new(Panicking), Arc::new(MessageListRenderer), commit_options());
        let mut conversation = Conversation::new();

        let err = engine
            .run_turn(&mut conversation, "hi", &mut BufferSink::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ChatError::Generation {
                source: GenerationError::WorkerPanicked,
                ..
            }
        ));
        assert!(conversation.is_empty());
    }

    #[tokio::test]
    async fn test_generations_are_serialized_by_permits() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            vec![ScriptStep::Pause(Duration::from_millis(30)), ScriptStep::fragment("a")],
            vec![ScriptStep::Pause(Duration::from_millis(30)), ScriptStep::fragment("b")],
        ]));
        let engine = Arc::new(engine(generator, commit_options()));

        let started = Instant::now();
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let mut conversation = Conversation::new();
                    engine
                        .run_turn(&mut conversation, "hi", &mut BufferSink::default())
                        .await
                        .map(|reply| reply.content)
                })
            })
            .collect();

        let mut replies = Vec::new();
        for task in tasks {
            replies.push(task.await.unwrap().unwrap());
        }
        replies.sort();

        assert_eq!(replies, vec!["a", "b"]);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
