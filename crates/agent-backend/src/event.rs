//! Typed backend event vocabulary

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Token counts reported for the most recent turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

/// An event on a backend session's stream, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Incremental assistant text.
    MessageDelta { content: String },
    /// A complete assistant message. Backends that stream deltas may also send
    /// this at the end of a turn.
    Message { content: String },
    /// Reasoning / thinking text.
    Reasoning { content: String },
    ToolStart { name: String },
    ToolComplete { name: String },
    Usage(Usage),
    TitleChanged { title: String },
    ModelChanged { model: String },
    /// The turn is complete and the session is waiting for input.
    Idle,
    /// The turn failed.
    Error(Error),
}
