use serde_json::{json, Value};
use tracing::warn;

use super::handler::{ToolDef, ToolHandler};

/// Tools assembled for one turn, across every resolved connector.
/// Names are unique; the first connector to register a name keeps it.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. The schema is the complete JSON tool definition
    /// (name, description, input_schema) sent to the model.
    pub fn add(
        mut self,
        source: impl Into<String>,
        name: impl Into<String>,
        schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        self.push(ToolDef {
            name: name.into(),
            source: source.into(),
            schema,
            handler: Box::new(handler),
        });
        self
    }

    pub fn push(&mut self, def: ToolDef) {
        if self.tools.iter().any(|t| t.name == def.name) {
            warn!(tool = %def.name, source = %def.source, "duplicate tool name, keeping first");
            return;
        }
        self.tools.push(def);
    }

    /// Move every tool of `other` into this registry.
    pub fn extend(&mut self, other: ToolRegistry) {
        for def in other.tools {
            self.push(def);
        }
    }

    /// All tool schemas for the model request.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    pub fn schema(&self, name: &str) -> Option<&Value> {
        self.tools.iter().find(|t| t.name == name).map(|t| &t.schema)
    }

    /// Run a tool by name.
    pub async fn execute(&self, name: &str, input: &Value) -> Result<Value, String> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| format!("unknown tool: {name}"))?;
        tool.handler.call(input).await
    }

    /// Compact listing (connector, name, description) for previews.
    pub fn summaries(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "connector": t.source,
                    "name": t.name,
                    "description": t.schema["description"],
                })
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tool_names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, input: &Value) -> Result<Value, String> {
            Ok(input.clone())
        }
    }

    fn schema(name: &str, description: &str) -> Value {
        json!({
            "name": name,
            "description": description,
            "input_schema": {"type": "object", "properties": {}}
        })
    }

    #[tokio::test]
    async fn executes_by_name() {
        let reg = ToolRegistry::new().add("drive", "list_files", schema("list_files", "List"), Echo);
        let out = reg.execute("list_files", &json!({"q": 1})).await.unwrap();
        assert_eq!(out, json!({"q": 1}));
        assert!(reg.execute("missing", &json!({})).await.is_err());
    }

    #[test]
    fn duplicate_names_keep_first() {
        let mut reg = ToolRegistry::new().add("a", "search", schema("search", "from a"), Echo);
        reg.extend(ToolRegistry::new().add("b", "search", schema("search", "from b"), Echo));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.summaries()[0]["connector"], "a");
    }

    #[test]
    fn summaries_omit_input_schema() {
        let reg = ToolRegistry::new().add("drive", "list_files", schema("list_files", "List files"), Echo);
        let s = &reg.summaries()[0];
        assert_eq!(s["description"], "List files");
        assert!(s.get("input_schema").is_none());
    }
}
