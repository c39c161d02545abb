//! Multi-turn chat sessions for local language models
//!
//! The crate keeps per-session conversation history, renders it into prompts,
//! streams generations from a backend while separating visible text from
//! suppressed reasoning segments, and runs a bounded tool-calling loop.

pub mod config;
pub mod conversation;
pub mod core;
pub mod providers;
pub mod routes;
pub mod tools;
