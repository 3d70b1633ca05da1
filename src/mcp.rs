//! MCP tool interface: JSON-RPC 2.0, one message per line over stdio.
//!
//! Tools map one-to-one onto manager operations; their results are the manager's
//! JSON shapes wrapped as MCP text content.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::manager::Manager;

/// Source name tool calls are announced under.
pub const MCP_SOURCE: &str = "MCP Server";

const PROTOCOL_VERSION: &str = "2024-11-05";
const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Serialize, Deserialize, Debug)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub id: Option<Value>,
}

pub struct McpServer {
    manager: Arc<Manager>,
}

impl McpServer {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    /// Serves requests from `reader` until EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<JsonRpcRequest>(line) {
                Ok(req) => self.handle_request(&req).await,
                Err(err) => {
                    warn!("failed to parse JSON-RPC payload: {}", err);
                    Some(json_rpc_error(None, -32700, "Parse error"))
                }
            };
            if let Some(response) = response {
                let mut payload = serde_json::to_vec(&response)?;
                payload.push(b'\n');
                writer.write_all(&payload).await?;
                writer.flush().await?;
            }
        }
        debug!("MCP client closed stdin");
        Ok(())
    }

    /// Answers one request; notifications (no id) get no response.
    pub async fn handle_request(&self, req: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        let Some(id) = req.id.clone() else {
            debug!("notification {}", req.method);
            return None;
        };
        let id = Some(id);
        let response = match req.method.as_str() {
            "initialize" => json_rpc_ok(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": { "name": "devrack", "version": env!("CARGO_PKG_VERSION") }
                }),
            ),
            "ping" => json_rpc_ok(id, json!({})),
            "tools/list" => json_rpc_ok(id, json!({ "tools": tool_definitions() })),
            "tools/call" => {
                let Some(params) = req.params.as_ref().and_then(|p| p.as_object()) else {
                    return Some(json_rpc_error(id, -32602, "Invalid params"));
                };
                let Some(name) = params.get("name").and_then(|n| n.as_str()) else {
                    return Some(json_rpc_error(id, -32602, "Missing tool name"));
                };
                let empty = Map::new();
                let args = params
                    .get("arguments")
                    .and_then(|a| a.as_object())
                    .unwrap_or(&empty);
                match self.call_tool(name, args).await {
                    Some((value, is_error)) => json_rpc_ok(id, tool_result(&value, is_error)),
                    None => json_rpc_error(id, -32602, &format!("Unknown tool: {}", name)),
                }
            }
            other => json_rpc_error(id, -32601, &format!("Method not found: {}", other)),
        };
        Some(response)
    }

    async fn call_tool(&self, tool: &str, args: &Map<String, Value>) -> Option<(Value, bool)> {
        self.manager
            .announce(
                MCP_SOURCE,
                format!("Tool '{}' called with: {}", tool, Value::Object(args.clone())),
            )
            .await;

        let server = args.get("name").and_then(|n| n.as_str());
        let result = match tool {
            "start_server" | "stop_server" | "restart_server" => {
                let Some(server) = server else {
                    return Some(missing_name());
                };
                let result = match tool {
                    "start_server" => self.manager.start(server).await,
                    "stop_server" => self.manager.stop(server).await,
                    _ => self.manager.restart(server).await,
                };
                (to_value(&result), result.is_error())
            }
            "get_server_status" => {
                let Some(server) = server else {
                    return Some(missing_name());
                };
                let result = self.manager.status_result(server).await;
                (to_value(&result), result.is_error())
            }
            "get_server_logs" => {
                let Some(server) = server else {
                    return Some(missing_name());
                };
                let offset = args.get("offset").and_then(Value::as_i64).unwrap_or(0);
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .and_then(|limit| usize::try_from(limit).ok())
                    .unwrap_or(DEFAULT_LOG_LIMIT);
                let reverse = args.get("reverse").and_then(Value::as_bool).unwrap_or(true);
                let report = self.manager.logs(server, offset, limit, reverse);
                let is_error = report.message.is_some();
                (to_value(&report), is_error)
            }
            "list_servers" => {
                let servers = self.manager.list_all().await;
                let mut value = json!({ "servers": servers });
                if let Some(companion) = self.manager.companion_status().await {
                    value["companion"] = to_value(&companion);
                }
                (value, false)
            }
            _ => return None,
        };
        Some(result)
    }
}

fn missing_name() -> (Value, bool) {
    (
        json!({"status": "error", "message": "Missing required argument 'name'"}),
        true,
    )
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| json!({"status": "error", "message": err.to_string()}))
}

fn tool_result(value: &Value, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": value.to_string() }],
        "isError": is_error
    })
}

fn name_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "name": { "type": "string", "description": "Server name from devrack.toml" } },
        "required": ["name"]
    })
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "start_server",
            "description": "Start a configured development server",
            "inputSchema": name_schema()
        },
        {
            "name": "stop_server",
            "description": "Stop a development server started by devrack",
            "inputSchema": name_schema()
        },
        {
            "name": "restart_server",
            "description": "Stop a development server if it is running, then start it again",
            "inputSchema": name_schema()
        },
        {
            "name": "get_server_status",
            "description": "Get the status of a development server (running, external or stopped)",
            "inputSchema": name_schema()
        },
        {
            "name": "get_server_logs",
            "description": "Page through recent output of a development server",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "offset": { "type": "integer", "description": "Lines to skip from the newest (reverse) or oldest end; negative values count back from the total", "default": 0 },
                    "limit": { "type": "integer", "default": DEFAULT_LOG_LIMIT },
                    "reverse": { "type": "boolean", "description": "Newest first", "default": true }
                },
                "required": ["name"]
            }
        },
        {
            "name": "list_servers",
            "description": "List all configured servers with their status",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}

fn json_rpc_ok(id: Option<Value>, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        result: Some(result),
        error: None,
        id,
    }
}

fn json_rpc_error(id: Option<Value>, code: i64, message: &str) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        result: None,
        error: Some(json!({
            "code": code,
            "message": message
        })),
        id,
    }
}
