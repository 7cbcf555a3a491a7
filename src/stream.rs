//! Encoder for the AI SDK data-stream protocol (v1).
//!
//! Every frame is one line: a one-character type tag, a colon, a JSON
//! payload and a newline. The client dispatches on the tag alone.

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use crate::events::{EventMetadata, StreamEvent};
use crate::executor::EventStream;
use crate::types::Usage;

/// Response header announcing the protocol version.
pub const PROTOCOL_HEADER: (&str, &str) = ("x-vercel-ai-data-stream", "v1");
pub const CONTENT_TYPE: &str = "text/plain; charset=utf-8";

const FINISH_REASON: &str = "stop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl From<Usage> for FrameUsage {
    fn from(u: Usage) -> Self {
        Self {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    StartStep { message_id: String },
    TextDelta(String),
    ToolCall { id: String, name: String, args: Value },
    ToolResult { id: String, result: Value },
    FinishStep { usage: FrameUsage },
    Error(String),
    FinishMessage { usage: FrameUsage },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartStepPart<'a> {
    message_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallPart<'a> {
    tool_call_id: &'a str,
    tool_name: &'a str,
    args: &'a Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResultPart<'a> {
    tool_call_id: &'a str,
    result: &'a Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishStepPart {
    finish_reason: &'static str,
    usage: FrameUsage,
    is_continued: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishMessagePart {
    finish_reason: &'static str,
    usage: FrameUsage,
}

fn json<T: Serialize>(value: &T) -> String {
    // Serializing these plain structs and strings cannot fail.
    serde_json::to_string(value).unwrap_or_default()
}

impl Frame {
    pub fn tag(&self) -> char {
        match self {
            Frame::StartStep { .. } => 'f',
            Frame::TextDelta(_) => '0',
            Frame::ToolCall { .. } => '9',
            Frame::ToolResult { .. } => 'a',
            Frame::FinishStep { .. } => 'e',
            Frame::Error(_) => '3',
            Frame::FinishMessage { .. } => 'd',
        }
    }

    /// The wire form, newline included.
    pub fn to_line(&self) -> String {
        let payload = match self {
            Frame::StartStep { message_id } => json(&StartStepPart { message_id }),
            Frame::TextDelta(text) => json(text),
            Frame::ToolCall { id, name, args } => json(&ToolCallPart {
                tool_call_id: id,
                tool_name: name,
                args,
            }),
            Frame::ToolResult { id, result } => json(&ToolResultPart {
                tool_call_id: id,
                result,
            }),
            Frame::FinishStep { usage } => json(&FinishStepPart {
                finish_reason: FINISH_REASON,
                usage: *usage,
                is_continued: false,
            }),
            Frame::Error(message) => json(message),
            Frame::FinishMessage { usage } => json(&FinishMessagePart {
                finish_reason: FINISH_REASON,
                usage: *usage,
            }),
        };
        format!("{}:{}\n", self.tag(), payload)
    }
}

/// Per-stream encoder state. Feed it events in arrival order, then call
/// exactly one of [`finish`](Self::finish) or [`fail`](Self::fail).
#[derive(Debug, Default)]
pub struct StreamEncoder {
    message_id: Option<String>,
    step_started: bool,
    step: Usage,
    total: Usage,
}

impl StreamEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn total_usage(&self) -> Usage {
        self.total
    }

    pub fn push(&mut self, event: &StreamEvent, metadata: &EventMetadata) -> Vec<Frame> {
        let mut frames = Vec::new();

        if !self.step_started {
            let id = self
                .message_id
                .get_or_insert_with(|| {
                    metadata
                        .thread_id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string())
                })
                .clone();
            frames.push(Frame::StartStep { message_id: id });
            self.step_started = true;
        }

        if let Some(usage) = event.usage() {
            self.step.accumulate(usage);
            self.total.accumulate(usage);
        }

        match event {
            StreamEvent::Chunk {
                content,
                tool_calls,
                ..
            } => {
                if !content.is_empty() {
                    frames.push(Frame::TextDelta(content.clone()));
                } else {
                    frames.extend(tool_calls.iter().map(|call| Frame::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        args: call.args.clone(),
                    }));
                }
            }
            StreamEvent::ToolResult {
                tool_call_id,
                content,
            } => frames.push(Frame::ToolResult {
                id: tool_call_id.clone(),
                result: content.clone(),
            }),
        }

        frames
    }

    /// Frames for a stream that ran to completion.
    pub fn finish(&mut self) -> Vec<Frame> {
        let frames = vec![
            Frame::FinishStep {
                usage: self.step.into(),
            },
            self.finish_message(),
        ];
        self.step = Usage::default();
        frames
    }

    /// Frames for a stream that ended in `error`.
    pub fn fail(&mut self, error: impl Into<String>) -> Vec<Frame> {
        vec![Frame::Error(error.into()), self.finish_message()]
    }

    fn finish_message(&self) -> Frame {
        Frame::FinishMessage {
            usage: self.total.into(),
        }
    }
}

/// Encode an executor event stream into protocol lines. The end-of-message
/// line is always the last one produced, whether the stream completes or
/// fails part way.
pub fn encode_stream(events: EventStream) -> impl Stream<Item = String> + Send + 'static {
    async_stream::stream! {
        let mut events = events;
        let mut encoder = StreamEncoder::new();
        let mut failure = None;

        while let Some(item) = events.next().await {
            match item {
                Ok((event, metadata)) => {
                    for frame in encoder.push(&event, &metadata) {
                        yield frame.to_line();
                    }
                }
                Err(e) => {
                    error!(error = %e, message_id = ?encoder.message_id(), "stream failed");
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        let tail = match failure {
            Some(message) => encoder.fail(message),
            None => encoder.finish(),
        };
        debug!(usage = ?encoder.total_usage(), "stream finished");
        for frame in tail {
            yield frame.to_line();
        }
    }
}

/// A stream that never started: an error line and the end-of-message line.
pub fn encode_error(message: impl Into<String>) -> impl Stream<Item = String> + Send + 'static {
    let frames = StreamEncoder::new().fail(message);
    futures::stream::iter(frames.into_iter().map(|f| f.to_line()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;
    use crate::types::ToolCall;
    use serde_json::json;

    fn meta(thread: Option<&str>) -> EventMetadata {
        EventMetadata {
            thread_id: thread.map(str::to_string),
            node: None,
        }
    }

    fn scripted() -> Vec<Result<(StreamEvent, EventMetadata), ExecutorError>> {
        vec![
            Ok((
                StreamEvent::Chunk {
                    content: "Hi".into(),
                    tool_calls: vec![],
                    usage: Some(Usage {
                        input_tokens: 10,
                        output_tokens: 2,
                    }),
                },
                meta(Some("thread-1")),
            )),
            Ok((
                StreamEvent::Chunk {
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        id: "call_1".into(),
                        name: "search".into(),
                        args: json!({"q": "rust"}),
                    }],
                    usage: Some(Usage {
                        input_tokens: 5,
                        output_tokens: 1,
                    }),
                },
                meta(Some("thread-1")),
            )),
            Ok((
                StreamEvent::ToolResult {
                    tool_call_id: "call_1".into(),
                    content: json!("found it"),
                },
                meta(Some("thread-1")),
            )),
        ]
    }

    async fn collect(items: Vec<Result<(StreamEvent, EventMetadata), ExecutorError>>) -> Vec<String> {
        let events: EventStream = futures::stream::iter(items).boxed();
        encode_stream(events).collect().await
    }

    #[tokio::test]
    async fn frames_follow_event_order() {
        let lines = collect(scripted()).await;
        assert_eq!(
            lines,
            vec![
                "f:{\"messageId\":\"thread-1\"}\n",
                "0:\"Hi\"\n",
                "9:{\"toolCallId\":\"call_1\",\"toolName\":\"search\",\"args\":{\"q\":\"rust\"}}\n",
                "a:{\"toolCallId\":\"call_1\",\"result\":\"found it\"}\n",
                "e:{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":15,\"completionTokens\":3},\"isContinued\":false}\n",
                "d:{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":15,\"completionTokens\":3}}\n",
            ]
        );
    }

    #[tokio::test]
    async fn error_replaces_finish_step_and_message_end_stays_last() {
        let mut items = scripted();
        items.truncate(1);
        items.push(Err(ExecutorError::Model("rate limited".into())));
        items.extend(scripted());

        let lines = collect(items).await;
        let tags: Vec<char> = lines.iter().filter_map(|l| l.chars().next()).collect();
        assert_eq!(tags, vec!['f', '0', '3', 'd']);
        assert_eq!(lines[2], "3:\"model error: rate limited\"\n");
        assert!(lines[3].contains("\"promptTokens\":10"));
    }

    #[tokio::test]
    async fn empty_stream_still_closes_the_message() {
        let lines = collect(vec![]).await;
        let tags: Vec<char> = lines.iter().filter_map(|l| l.chars().next()).collect();
        assert_eq!(tags, vec!['e', 'd']);
    }

    #[test]
    fn message_id_falls_back_to_uuid() {
        let mut encoder = StreamEncoder::new();
        let frames = encoder.push(&StreamEvent::text("x"), &meta(None));
        let Frame::StartStep { message_id } = &frames[0] else {
            panic!("expected start-of-step first");
        };
        assert!(Uuid::parse_str(message_id).is_ok());

        // The id is fixed by the first event only.
        let again = encoder.push(&StreamEvent::text("y"), &meta(Some("later")));
        assert_eq!(again, vec![Frame::TextDelta("y".into())]);
        assert_eq!(encoder.message_id(), Some(message_id.as_str()));
    }

    #[test]
    fn tool_calls_on_text_chunks_are_not_announced() {
        let mut encoder = StreamEncoder::new();
        let event = StreamEvent::Chunk {
            content: "thinking".into(),
            tool_calls: vec![ToolCall {
                id: "c".into(),
                name: "t".into(),
                args: json!({}),
            }],
            usage: None,
        };
        let frames = encoder.push(&event, &meta(Some("m")));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], Frame::TextDelta("thinking".into()));
    }

    #[tokio::test]
    async fn encode_error_emits_error_then_end() {
        let lines: Vec<String> = encode_error("Please upgrade to access this model.")
            .collect()
            .await;
        assert_eq!(
            lines,
            vec![
                "3:\"Please upgrade to access this model.\"\n",
                "d:{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":0,\"completionTokens\":0}}\n",
            ]
        );
    }
}
