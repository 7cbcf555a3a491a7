use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ConnectionParams, DiscoveredTools, ToolDiscovery};
use crate::error::DiscoveryError;
use crate::tools::{ToolDef, ToolHandler, ToolRegistry};

const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// One connector endpoint plus the session the server assigned us.
#[derive(Debug, Clone)]
struct Endpoint {
    connector: String,
    url: String,
    headers: BTreeMap<String, String>,
    session_id: Option<String>,
}

/// JSON-RPC over streamable HTTP. Shared by discovery and every tool it
/// hands out.
#[derive(Debug)]
struct RpcClient {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcClient {
    async fn send(
        &self,
        endpoint: &Endpoint,
        method: &str,
        params: Option<Value>,
        notification: bool,
    ) -> Result<(Value, Option<String>), DiscoveryError> {
        let id = (!notification).then(|| self.next_id.fetch_add(1, Ordering::Relaxed));
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let mut req = self
            .client
            .post(&endpoint.url)
            .header("accept", "application/json, text/event-stream")
            .json(&body);
        for (name, value) in &endpoint.headers {
            req = req.header(name, value);
        }
        if let Some(session) = &endpoint.session_id {
            req = req.header(SESSION_HEADER, session);
        }

        let resp = req.send().await.map_err(|e| DiscoveryError::Request {
            connector: endpoint.connector.clone(),
            message: e.to_string(),
        })?;

        let status = resp.status().as_u16();
        let session = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = resp.text().await.map_err(|e| DiscoveryError::Request {
            connector: endpoint.connector.clone(),
            message: e.to_string(),
        })?;

        if !(200..300).contains(&status) {
            return Err(DiscoveryError::ApiError {
                connector: endpoint.connector.clone(),
                status,
                body: text,
            });
        }
        if notification {
            return Ok((Value::Null, session));
        }

        let result = parse_rpc_body(&text).map_err(|message| DiscoveryError::Protocol {
            connector: endpoint.connector.clone(),
            message: format!("{method}: {message}"),
        })?;
        Ok((result, session))
    }
}

/// Pull the JSON-RPC `result` out of a response body. Streamable HTTP servers
/// answer either with plain JSON or with an event stream whose `data:` lines
/// carry the response.
pub(crate) fn parse_rpc_body(body: &str) -> Result<Value, String> {
    let trimmed = body.trim_start();
    let payload: Value = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).map_err(|e| format!("invalid json-rpc response: {e}"))?
    } else {
        trimmed
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
            .filter(|v| v.get("result").is_some() || v.get("error").is_some())
            .last()
            .ok_or_else(|| "no json-rpc response in event stream".to_string())?
    };

    if let Some(error) = payload.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown error");
        return Err(message.to_string());
    }
    payload
        .get("result")
        .cloned()
        .ok_or_else(|| "missing result".to_string())
}

/// Tool schema as the model sees it.
pub(crate) fn tool_schema(tool: &Value) -> Option<(String, Value)> {
    let name = tool["name"].as_str()?.to_string();
    let schema = json!({
        "name": name,
        "description": tool["description"].as_str().unwrap_or_default(),
        "input_schema": tool
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    });
    Some((name, schema))
}

/// Reduce a `tools/call` result to the value handed back to the model.
pub(crate) fn tool_output(result: Value) -> Result<Value, String> {
    let text = || {
        result["content"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|c| c["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    };

    if result["isError"].as_bool().unwrap_or(false) {
        return Err(text());
    }
    if let Some(structured) = result.get("structuredContent") {
        return Ok(structured.clone());
    }
    Ok(Value::String(text()))
}

/// Discovers tools on streamable-HTTP MCP servers.
///
/// Connectors are queried one at a time in name order. Any failure aborts
/// the whole discovery; there are no retries.
pub struct HttpToolDiscovery {
    rpc: Arc<RpcClient>,
}

impl HttpToolDiscovery {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            rpc: Arc::new(RpcClient {
                client,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    async fn discover_one(
        &self,
        name: &str,
        params: &ConnectionParams,
        registry: &mut ToolRegistry,
        instructions: &mut Vec<String>,
    ) -> Result<(), DiscoveryError> {
        let mut endpoint = Endpoint {
            connector: name.to_string(),
            url: params.url.clone(),
            headers: params.headers.clone(),
            session_id: None,
        };

        let init = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
        });
        let (result, session) = self
            .rpc
            .send(&endpoint, "initialize", Some(init), false)
            .await?;
        endpoint.session_id = session;
        if let Some(text) = result["instructions"].as_str().filter(|s| !s.is_empty()) {
            instructions.push(text.to_string());
        }

        if let Err(e) = self
            .rpc
            .send(&endpoint, "notifications/initialized", None, true)
            .await
        {
            warn!(connector = name, error = %e, "initialized notification rejected");
        }

        let (listing, _) = self.rpc.send(&endpoint, "tools/list", None, false).await?;
        let tools = listing["tools"]
            .as_array()
            .ok_or_else(|| DiscoveryError::Protocol {
                connector: name.to_string(),
                message: "tools/list returned no tool array".into(),
            })?;

        let endpoint = Arc::new(endpoint);
        for tool in tools {
            let Some((tool_name, schema)) = tool_schema(tool) else {
                warn!(connector = name, "skipping tool without a name");
                continue;
            };
            registry.push(ToolDef {
                name: tool_name.clone(),
                source: name.to_string(),
                schema,
                handler: Box::new(RemoteTool {
                    rpc: self.rpc.clone(),
                    endpoint: endpoint.clone(),
                    name: tool_name,
                }),
            });
        }
        debug!(connector = name, tools = tools.len(), "connector tools listed");
        Ok(())
    }
}

impl Default for HttpToolDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolDiscovery for HttpToolDiscovery {
    async fn discover(
        &self,
        connections: &BTreeMap<String, ConnectionParams>,
    ) -> Result<DiscoveredTools, DiscoveryError> {
        let mut tools = ToolRegistry::new();
        let mut instructions = Vec::new();
        for (name, params) in connections {
            self.discover_one(name, params, &mut tools, &mut instructions)
                .await?;
        }
        Ok(DiscoveredTools {
            tools,
            instructions,
        })
    }
}

/// A tool living on a connector, invoked with `tools/call`.
pub struct RemoteTool {
    rpc: Arc<RpcClient>,
    endpoint: Arc<Endpoint>,
    name: String,
}

impl std::fmt::Debug for RemoteTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTool")
            .field("connector", &self.endpoint.connector)
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl ToolHandler for RemoteTool {
    async fn call(&self, input: &Value) -> Result<Value, String> {
        let params = json!({"name": self.name, "arguments": input});
        let (result, _) = self
            .rpc
            .send(&self.endpoint, "tools/call", Some(params), false)
            .await
            .map_err(|e| e.to_string())?;
        tool_output(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json_response() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
        assert_eq!(parse_rpc_body(body).unwrap(), json!({"tools": []}));
    }

    #[test]
    fn parses_event_stream_response() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"instructions\":\"hi\"}}\n\n";
        assert_eq!(parse_rpc_body(body).unwrap()["instructions"], "hi");
    }

    #[test]
    fn rpc_error_is_surfaced() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#;
        assert_eq!(parse_rpc_body(body).unwrap_err(), "Method not found");
        assert!(parse_rpc_body("event: ping\n\n").is_err());
    }

    #[test]
    fn tool_schema_maps_input_schema() {
        let tool = json!({
            "name": "list_files",
            "description": "List files",
            "inputSchema": {"type": "object", "properties": {"folder": {"type": "string"}}},
        });
        let (name, schema) = tool_schema(&tool).unwrap();
        assert_eq!(name, "list_files");
        assert_eq!(schema["input_schema"]["properties"]["folder"]["type"], "string");
        assert!(tool_schema(&json!({"description": "nameless"})).is_none());
    }

    #[test]
    fn tool_output_prefers_structured_content() {
        let structured = json!({"structuredContent": {"n": 3}, "content": [{"type": "text", "text": "3"}]});
        assert_eq!(tool_output(structured).unwrap(), json!({"n": 3}));

        let text = json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(tool_output(text).unwrap(), json!("a\nb"));

        let failed = json!({"isError": true, "content": [{"type": "text", "text": "quota"}]});
        assert_eq!(tool_output(failed).unwrap_err(), "quota");
    }
}
