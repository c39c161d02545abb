//! Streaming response assembly
//!
//! The collector drains a fragment stream in production order, forwards every
//! fragment to a [`Sink`] tagged as visible or suppressed, and accumulates the
//! visible text that becomes the assistant turn.

use console::style;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::Write;
use thiserror::Error;

use crate::providers::GenerationError;

/// Fragment pair delimiting a segment that is shown but never stored
///
/// Markers are matched by exact fragment equality. A marker that arrives split
/// across fragments, or embedded inside a larger fragment, is treated as
/// ordinary text. This holds for backends that emit special tokens as whole
/// fragments and does not for backends that re-chunk their output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionMarkers {
    pub enter: String,
    pub exit: String,
}

impl SuppressionMarkers {
    pub fn new(enter: impl Into<String>, exit: impl Into<String>) -> Self {
        Self {
            enter: enter.into(),
            exit: exit.into(),
        }
    }

    /// Reasoning blocks of thinking models
    pub fn think_tags() -> Self {
        Self::new("<think>\n", "</think>\n\n")
    }

    /// Blank-line framing used by some chat templates
    pub fn blank_lines() -> Self {
        Self::new("\n\n", "\n\n\n\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentTag {
    Visible,
    Suppressed,
}

/// Receives fragments as they are produced
pub trait Sink: Send {
    fn emit(&mut self, fragment: &str, tag: FragmentTag);

    /// Called once after the stream ends, successfully or not
    fn finish(&mut self) {}
}

/// Writes fragments to stdout, dimming suppressed text
#[derive(Debug, Default)]
pub struct TerminalSink {
    show_suppressed: bool,
}

impl TerminalSink {
    pub fn new(show_suppressed: bool) -> Self {
        Self { show_suppressed }
    }
}

impl Sink for TerminalSink {
    fn emit(&mut self, fragment: &str, tag: FragmentTag) {
        let mut stdout = std::io::stdout().lock();
        let _ = match tag {
            FragmentTag::Visible => write!(stdout, "{}", fragment),
            FragmentTag::Suppressed if self.show_suppressed => {
                write!(stdout, "{}", style(fragment).dim())
            }
            FragmentTag::Suppressed => Ok(()),
        };
        let _ = stdout.flush();
    }

    fn finish(&mut self) {
        println!();
    }
}

/// Keeps everything it receives, for front ends that reply in one piece
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    pub visible: String,
    pub suppressed: String,
    pub fragments: Vec<(String, FragmentTag)>,
    pub finished: bool,
}

impl Sink for BufferSink {
    fn emit(&mut self, fragment: &str, tag: FragmentTag) {
        match tag {
            FragmentTag::Visible => self.visible.push_str(fragment),
            FragmentTag::Suppressed => self.suppressed.push_str(fragment),
        }
        self.fragments.push((fragment.to_string(), tag));
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl Sink for NullSink {
    fn emit(&mut self, _fragment: &str, _tag: FragmentTag) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedResponse {
    pub text: String,
    /// Fragments received, markers included
    pub token_count: usize,
}

/// The stream failed before it was exhausted
#[derive(Debug, Error)]
#[error("Generation interrupted after {token_count} fragments: {source}")]
pub struct Interrupted {
    /// Visible text accumulated before the failure
    pub partial: String,
    pub token_count: usize,
    #[source]
    pub source: GenerationError,
}

#[derive(Debug)]
pub struct StreamCollector {
    markers: Option<SuppressionMarkers>,
    visible: String,
    suppressed: bool,
    token_count: usize,
}

impl StreamCollector {
    pub fn new(markers: Option<SuppressionMarkers>) -> Self {
        Self {
            markers,
            visible: String::new(),
            suppressed: false,
            token_count: 0,
        }
    }

    pub fn visible(&self) -> &str {
        &self.visible
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Process one fragment. Enter is checked before exit, so identical
    /// markers only ever enter.
    pub fn accept(&mut self, fragment: &str, sink: &mut dyn Sink) {
        self.token_count += 1;

        if let Some(markers) = &self.markers {
            if fragment == markers.enter {
                self.suppressed = true;
                return;
            }
            if fragment == markers.exit {
                self.suppressed = false;
                return;
            }
        }

        if self.suppressed {
            sink.emit(fragment, FragmentTag::Suppressed);
        } else {
            self.visible.push_str(fragment);
            sink.emit(fragment, FragmentTag::Visible);
        }
    }

    pub fn finish(self) -> CollectedResponse {
        CollectedResponse {
            text: self.visible,
            token_count: self.token_count,
        }
    }

    pub fn interrupt(self, source: GenerationError) -> Interrupted {
        Interrupted {
            partial: self.visible,
            token_count: self.token_count,
            source,
        }
    }

    /// Drain a fragment stream until it ends or yields an error
    pub async fn drain<S>(
        mut self,
        stream: S,
        sink: &mut dyn Sink,
    ) -> Result<CollectedResponse, Interrupted>
    where
        S: Stream<Item = Result<String, GenerationError>>,
    {
        futures::pin_mut!(stream);

        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => self.accept(&fragment, sink),
                Err(e) => return Err(self.interrupt(e)),
            }
        }

        Ok(self.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio_test::{assert_err, assert_ok};

    fn ok_stream(items: &[&str]) -> impl Stream<Item = Result<String, GenerationError>> {
        stream::iter(items.iter().map(|s| Ok(s.to_string())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn test_well_formed_block_is_excluded() {
        let mut sink = BufferSink::default();
        let collector = StreamCollector::new(Some(SuppressionMarkers::think_tags()));

        let stream = ok_stream(&["<think>\n", "hmm", "</think>\n\n", "Hello", " there"]);
        let response = assert_ok!(collector.drain(stream, &mut sink).await);

        assert_eq!(response.text, "Hello there");
        assert_eq!(response.token_count, 5);
        assert_eq!(sink.suppressed, "hmm");
        assert_eq!(sink.visible, "Hello there");
        assert_eq!(
            sink.fragments,
            vec![
                ("hmm".to_string(), FragmentTag::Suppressed),
                ("Hello".to_string(), FragmentTag::Visible),
                (" there".to_string(), FragmentTag::Visible),
            ]
        );
    }

    #[tokio::test]
    async fn test_without_markers_visible_is_concatenation() {
        let mut sink = NullSink;
        let fragments = ["<think>\n", "a", "\n\n", "b", "</think>\n\n"];
        let response = StreamCollector::new(None)
            .drain(ok_stream(&fragments), &mut sink)
            .await
            .unwrap();

        assert_eq!(response.text, fragments.concat());
        assert_eq!(response.token_count, fragments.len());
    }

    #[tokio::test]
    async fn test_error_keeps_partial_text() {
        let mut sink = BufferSink::default();
        let stream = stream::iter(vec![
            Ok("Hello ".to_string()),
            Ok("wor".to_string()),
            Err(GenerationError::Backend("connection reset".into())),
            Ok("never".to_string()),
        ]);

        let interrupted = assert_err!(StreamCollector::new(None).drain(stream, &mut sink).await);
        assert_eq!(interrupted.partial, "Hello wor");
        assert_eq!(interrupted.token_count, 2);
        assert!(matches!(interrupted.source, GenerationError::Backend(_)));
        assert_eq!(sink.visible, "Hello wor");
    }

    #[test]
    fn test_markers_match_exactly() {
        let mut sink = BufferSink::default();
        let mut collector = StreamCollector::new(Some(SuppressionMarkers::think_tags()));

        // split or embedded markers are ordinary text
        collector.accept("<think>", &mut sink);
        collector.accept("\n", &mut sink);
        collector.accept("x <think>\n", &mut sink);
        assert!(!collector.is_suppressed());
        assert_eq!(collector.visible(), "<think>\nx <think>\n");
    }

    #[test]
    fn test_unclosed_block_suppresses_rest() {
        let mut sink = BufferSink::default();
        let mut collector = StreamCollector::new(Some(SuppressionMarkers::think_tags()));

        collector.accept("Hi", &mut sink);
        collector.accept("<think>\n", &mut sink);
        collector.accept("still thinking", &mut sink);

        assert!(collector.is_suppressed());
        let response = collector.finish();
        assert_eq!(response.text, "Hi");
        assert_eq!(response.token_count, 3);
    }

    #[test]
    fn test_exit_without_enter_is_swallowed() {
        let mut sink = BufferSink::default();
        let mut collector = StreamCollector::new(Some(SuppressionMarkers::blank_lines()));

        collector.accept("a", &mut sink);
        collector.accept("\n\n\n\n", &mut sink);
        collector.accept("b", &mut sink);

        assert_eq!(collector.finish().text, "ab");
        assert_eq!(sink.fragments.len(), 2);
    }

    #[test]
    fn test_identical_markers_only_enter() {
        let mut sink = BufferSink::default();
        let mut collector = StreamCollector::new(Some(SuppressionMarkers::new("|", "|")));

        collector.accept("a", &mut sink);
        collector.accept("|", &mut sink);
        collector.accept("b", &mut sink);
        collector.accept("|", &mut sink);
        collector.accept("c", &mut sink);

        assert_eq!(collector.visible(), "a");
        assert_eq!(sink.suppressed, "bc");
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut sink = NullSink;
        let response = StreamCollector::new(Some(SuppressionMarkers::think_tags()))
            .drain(ok_stream(&[]), &mut sink)
            .await
            .unwrap();
        assert_eq!(response.text, "");
        assert_eq!(response.token_count, 0);
    }
}
