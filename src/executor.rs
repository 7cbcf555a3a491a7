use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ExecutorError;
use crate::events::{EventMetadata, StreamEvent};
use crate::model::ModelHandle;
use crate::tools::ToolRegistry;
use crate::types::Message;

/// Everything the executor needs for one reasoning turn.
#[derive(Debug, Clone)]
pub struct ExecutorRequest {
    pub model: ModelHandle,
    pub tools: Arc<ToolRegistry>,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub thread_id: Option<String>,
}

pub type EventStream =
    BoxStream<'static, Result<(StreamEvent, EventMetadata), ExecutorError>>;

/// The external agent/graph runtime. It owns provider SDKs, tool calling
/// and planning; the gate only hands it a validated request.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run one turn and return the messages it produced.
    async fn invoke(&self, request: ExecutorRequest) -> Result<Vec<Message>, ExecutorError>;

    /// Run one turn, yielding partial messages as they arrive.
    async fn stream(&self, request: ExecutorRequest) -> Result<EventStream, ExecutorError>;
}

/// Blanket impl so `Arc<dyn AgentExecutor>` can be passed wherever an
/// executor is expected.
#[async_trait]
impl AgentExecutor for Arc<dyn AgentExecutor> {
    async fn invoke(&self, request: ExecutorRequest) -> Result<Vec<Message>, ExecutorError> {
        (**self).invoke(request).await
    }

    async fn stream(&self, request: ExecutorRequest) -> Result<EventStream, ExecutorError> {
        (**self).stream(request).await
    }
}
