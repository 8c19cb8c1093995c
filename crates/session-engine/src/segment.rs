//! Segmentation and throttling of streamed assistant text
//!
//! A turn's text is split into segments at every tool invocation, so a UI can
//! render prose, then tool status, then more prose as separate messages. Within
//! a segment, `text` updates carry the segment's accumulated text and are
//! rate limited: one per `interval`, and only once the segment is longer than
//! `min_chars`. Closing a segment (`segment_end`) is never throttled.
//!
//! Ordering per segment: every `text` for segment k precedes its
//! `segment_end`, which precedes anything carrying segment k + 1.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Kind of update delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Thinking,
    Tool,
    Text,
    SegmentEnd,
    Done,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Thinking => "thinking",
            UpdateKind::Tool => "tool",
            UpdateKind::Text => "text",
            UpdateKind::SegmentEnd => "segment_end",
            UpdateKind::Done => "done",
        }
    }
}

/// One caller-visible update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub kind: UpdateKind,
    /// Payload; empty for `done`.
    pub content: String,
    /// Present for `text` and `segment_end`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<u64>,
}

impl StatusUpdate {
    pub fn thinking(content: impl Into<String>) -> Self {
        Self {
            kind: UpdateKind::Thinking,
            content: content.into(),
            segment_id: None,
        }
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Self {
            kind: UpdateKind::Tool,
            content: name.into(),
            segment_id: None,
        }
    }

    pub fn done() -> Self {
        Self {
            kind: UpdateKind::Done,
            content: String::new(),
            segment_id: None,
        }
    }

    fn text(content: &str, segment_id: u64) -> Self {
        Self {
            kind: UpdateKind::Text,
            content: content.to_string(),
            segment_id: Some(segment_id),
        }
    }

    fn segment_end(content: &str, segment_id: u64) -> Self {
        Self {
            kind: UpdateKind::SegmentEnd,
            content: content.to_string(),
            segment_id: Some(segment_id),
        }
    }
}

/// Rate limits for `text` updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub interval: Duration,
    pub min_chars: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            min_chars: 20,
        }
    }
}

#[derive(Debug)]
struct Segment {
    id: u64,
    text: String,
    chars: usize,
    last_emit: Option<Instant>,
}

impl Segment {
    fn new(id: u64) -> Self {
        Self {
            id,
            text: String::new(),
            chars: 0,
            last_emit: None,
        }
    }
}

/// Per-send accumulator. Owned by exactly one send.
#[derive(Debug)]
pub struct Segmenter {
    config: ThrottleConfig,
    full: String,
    segment: Segment,
    saw_delta: bool,
}

impl Segmenter {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            full: String::new(),
            segment: Segment::new(0),
            saw_delta: false,
        }
    }

    /// Incremental text. Returns a `text` update when the throttle allows one.
    pub fn on_delta(&mut self, delta: &str, now: Instant) -> Option<StatusUpdate> {
        self.saw_delta = true;
        self.push(delta, now)
    }

    /// A complete message. Only used as text when this send has produced no
    /// deltas (non-streaming backends); otherwise it repeats what the deltas
    /// already delivered.
    pub fn on_message(&mut self, content: &str, now: Instant) -> Option<StatusUpdate> {
        if self.saw_delta {
            return None;
        }
        self.push(content, now)
    }

    /// A tool invocation begins: close the current segment if it has text and
    /// open the next one with a fresh throttle clock.
    pub fn on_tool_start(&mut self) -> Option<StatusUpdate> {
        let end = self.close();
        self.segment = Segment::new(self.segment.id + 1);
        end
    }

    /// The turn is over: close the open segment if it has text.
    pub fn finish(&mut self) -> Option<StatusUpdate> {
        self.close()
    }

    #[cfg(test)]
    fn segment_id(&self) -> u64 {
        self.segment.id
    }

    #[cfg(test)]
    fn full_text(&self) -> &str {
        &self.full
    }

    pub fn into_full_text(self) -> String {
        self.full
    }

    fn push(&mut self, text: &str, now: Instant) -> Option<StatusUpdate> {
        if text.is_empty() {
            return None;
        }
        self.full.push_str(text);
        self.segment.text.push_str(text);
        self.segment.chars += text.chars().count();

        if self.segment.chars <= self.config.min_chars {
            return None;
        }
        let due = match self.segment.last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= self.config.interval,
        };
        if !due {
            return None;
        }
        self.segment.last_emit = Some(now);
        Some(StatusUpdate::text(&self.segment.text, self.segment.id))
    }

    fn close(&mut self) -> Option<StatusUpdate> {
        if self.segment.text.is_empty() {
            return None;
        }
        Some(StatusUpdate::segment_end(&self.segment.text, self.segment.id))
    }
}
