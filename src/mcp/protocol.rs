//! MCP protocol types (JSON-RPC 2.0), client side.

use crate::error::{ReferatError, Result};
use crate::tools::ToolOutput;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "referat";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// JSON-RPC request or notification.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params: None,
        }
    }
}

/// JSON-RPC response.
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// Numeric request id this responds to.
    pub fn request_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    pub fn into_result(self, server: &str) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(ReferatError::RemoteServer {
                server: server.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Params of the `initialize` handshake.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": CLIENT_VERSION,
        }
    })
}

/// Tool definition as listed by a server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// One page of `tools/list`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<RemoteTool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Params for `tools/list`, continuing from `cursor`.
pub fn list_params(cursor: Option<&str>) -> Option<Value> {
    cursor.map(|c| json!({ "cursor": c }))
}

/// Params for `tools/call`.
pub fn call_params(name: &str, arguments: Value) -> Value {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    json!({ "name": name, "arguments": arguments })
}

/// Result of `tools/call`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

impl ToolCallResult {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Unsupported => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Convert into a tool output; `isError` results become errors.
    pub fn into_output(self, server: &str, tool: &str) -> Result<ToolOutput> {
        if self.is_error.unwrap_or(false) {
            return Err(ReferatError::ToolExecution(format!(
                "{} on '{}' reported: {}",
                tool,
                server,
                self.text()
            )));
        }
        if let Some(structured) = self.structured_content {
            return Ok(ToolOutput::Structured(structured));
        }
        Ok(ToolOutput::Text(self.text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest::new(7, "tools/list", None);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"})
        );
        let note = JsonRpcRequest::notification("notifications/initialized");
        assert!(serde_json::to_value(&note).unwrap().get("id").is_none());
    }

    #[test]
    fn test_error_response_maps_to_remote_error() {
        let response: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        assert_eq!(response.request_id(), Some(3));
        let err = response.into_result("clock").unwrap_err();
        assert!(matches!(err, ReferatError::RemoteServer { code: -32601, .. }));
    }

    #[test]
    fn test_tool_list_parsing() {
        let page: ToolsListResult = serde_json::from_value(json!({
            "tools": [{
                "name": "get_time",
                "description": "Current time in a city",
                "inputSchema": {"type": "object", "properties": {"city": {"type": "string"}}}
            }],
            "nextCursor": "2"
        }))
        .unwrap();
        assert_eq!(page.tools[0].name, "get_time");
        assert_eq!(page.next_cursor.as_deref(), Some("2"));
    }

    #[test]
    fn test_call_result_shapes() {
        let text: ToolCallResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "12:00"}, {"type": "image", "data": "..."}]
        }))
        .unwrap();
        assert_eq!(text.into_output("clock", "get_time").unwrap(), ToolOutput::text("12:00"));

        let structured: ToolCallResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "{\"t\":1}"}],
            "structuredContent": {"t": 1}
        }))
        .unwrap();
        assert_eq!(
            structured.into_output("clock", "get_time").unwrap(),
            ToolOutput::Structured(json!({"t": 1}))
        );

        let failed: ToolCallResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "unknown city"}],
            "isError": true
        }))
        .unwrap();
        let err = failed.into_output("clock", "get_time").unwrap_err();
        assert!(err.to_string().contains("unknown city"));
    }
}
