use async_trait::async_trait;
use serde_json::Value;

/// Executes one discovered tool. Connector clients implement this per tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &Value) -> Result<Value, String>;
}

/// A tool definition: schema for the model + handler for execution.
pub struct ToolDef {
    pub name: String,
    /// Connector the tool came from.
    pub source: String,
    pub schema: Value,
    pub(crate) handler: Box<dyn ToolHandler>,
}
