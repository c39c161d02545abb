//! Core chat components
//!
//! Response collection, session isolation, tool-call extraction and the turn
//! driver that ties them to a generation backend.

pub mod collector;
mod chat;
pub mod registry;
pub mod tool_calls;

pub use chat::{
    ChatEngine, ChatError, EngineOptions, PartialPolicy, ReplyStatus, ToolCallSummary, TurnReply,
    DEFAULT_MAX_TOOL_ROUNDS,
};
pub use collector::{
    BufferSink, CollectedResponse, FragmentTag, Interrupted, NullSink, Sink, StreamCollector,
    SuppressionMarkers, TerminalSink,
};
pub use registry::{SessionHandle, SessionRegistry};
pub use tool_calls::parse_tool_calls;
