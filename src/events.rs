use serde_json::Value;

use crate::types::{ToolCall, Usage};

/// One increment produced by the executor in streaming mode.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A partial assistant message.
    Chunk {
        content: String,
        tool_calls: Vec<ToolCall>,
        usage: Option<Usage>,
    },
    /// The output of a tool the model called.
    ToolResult { tool_call_id: String, content: Value },
}

impl StreamEvent {
    pub fn text(content: impl Into<String>) -> Self {
        StreamEvent::Chunk {
            content: content.into(),
            tool_calls: Vec::new(),
            usage: None,
        }
    }

    pub fn usage(&self) -> Option<&Usage> {
        match self {
            StreamEvent::Chunk { usage, .. } => usage.as_ref(),
            StreamEvent::ToolResult { .. } => None,
        }
    }
}

/// Metadata the executor attaches to each event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMetadata {
    pub thread_id: Option<String>,
    pub node: Option<String>,
}
