//! MCP protocol implementation for JSON-RPC 2.0 communication.
//!
//! This module provides the core MCP server implementation including:
//! - JSON-RPC 2.0 request/response handling
//! - Tool definitions and schemas
//! - Stdio-based server communication
//!
//! Tool calls run as their own tasks so progress notifications and
//! cancellations can flow while a research run is in progress. All output
//! goes through a single writer task, one JSON document per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{handle_tool_call, SharedState, ToolContext};
use crate::error::McpError;

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

const OUTBOUND_BUFFER: usize = 256;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request identifier (None for notifications).
    pub id: Option<Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional parameters for the method.
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request identifier (null if notification, must always be present per JSON-RPC 2.0).
    pub id: Value,
    /// The result on success (mutually exclusive with error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure (mutually exclusive with result).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    /// Error code (negative for predefined errors).
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server-initiated JSON-RPC notification.
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

/// MCP server information returned during initialization.
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    /// The server name identifier.
    pub name: String,
    /// The server version string.
    pub version: String,
}

/// MCP server capabilities advertised to clients.
#[derive(Debug, Serialize)]
pub struct Capabilities {
    /// Tool-related capabilities.
    pub tools: ToolCapabilities,
}

/// Tool-specific capabilities.
#[derive(Debug, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change dynamically.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Result of the MCP initialize handshake.
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    /// The MCP protocol version supported.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: Capabilities,
    /// Server identification information.
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// MCP tool definition with JSON Schema.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    /// Unique tool name (used in tool calls).
    pub name: String,
    /// Human-readable description of the tool.
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Parameters for a tools/call request.
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    /// The name of the tool to invoke.
    pub name: String,
    /// Optional arguments for the tool.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Parameters of a `notifications/cancelled` message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledParams {
    request_id: Value,
    #[serde(default)]
    reason: Option<String>,
}

/// Content item within a tool result.
#[derive(Debug, Serialize)]
pub struct ToolResultContent {
    /// The content type (e.g., "text").
    #[serde(rename = "type")]
    pub content_type: String,
    /// The text content of the result.
    pub text: String,
}

/// Result of a tool invocation.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    /// The result content items.
    pub content: Vec<ToolResultContent>,
    /// Whether the result represents an error.
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Cloneable handle for writing to the client.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<String>,
}

impl Notifier {
    /// Create a notifier and the receiving end the writer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Send a server-initiated notification.
    pub async fn notify(&self, method: &str, params: Value) {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };
        match serde_json::to_string(&notification) {
            Ok(line) => self.send_line(line).await,
            Err(e) => error!(error = %e, "Failed to serialize notification"),
        }
    }

    async fn respond(&self, response: &JsonRpcResponse) {
        match serde_json::to_string(response) {
            Ok(line) => self.send_line(line).await,
            Err(e) => error!(error = %e, "Failed to serialize response"),
        }
    }

    async fn send_line(&self, line: String) {
        if self.tx.send(line).await.is_err() {
            debug!("Client writer closed, dropping message");
        }
    }
}

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// MCP Server running over stdio.
///
/// Handles JSON-RPC 2.0 messages over stdin/stdout for MCP protocol
/// communication with clients.
pub struct McpServer {
    /// Shared application state.
    state: SharedState,
    /// Cancellation tokens of running tool calls, keyed by request id.
    in_flight: InFlight,
}

impl McpServer {
    /// Create a new MCP server
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the server using async stdio
    pub async fn run(&self) -> std::io::Result<()> {
        info!("Company research MCP server starting...");
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Serve requests from `reader`, writing responses to `writer`.
    ///
    /// Returns at EOF once every in-flight tool call has been cancelled and
    /// has written its response.
    pub async fn serve<R, W>(&self, mut reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (notifier, rx) = Notifier::channel(OUTBOUND_BUFFER);
        let writer_task = tokio::spawn(write_lines(writer, rx));
        let mut tool_calls = JoinSet::new();
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            // EOF reached
            if bytes_read == 0 {
                info!("EOF received, shutting down");
                break;
            }

            // Reap finished tool calls
            while tool_calls.try_join_next().is_some() {}

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            debug!(request = %trimmed, "Received request");

            match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) if request.method == "tools/call" => {
                    self.spawn_tool_call(&mut tool_calls, request, notifier.clone());
                }
                Ok(request) => {
                    if let Some(response) = self.handle_request(request) {
                        notifier.respond(&response).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to parse request");
                    notifier
                        .respond(&JsonRpcResponse::error(
                            None,
                            -32700,
                            format!("Parse error: {}", e),
                        ))
                        .await;
                }
            }
        }

        self.cancel_all();
        while tool_calls.join_next().await.is_some() {}

        drop(notifier);
        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }

    /// Handle a non tool-call JSON-RPC request
    /// Returns None for notifications (requests without id) per JSON-RPC 2.0
    fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        // Check if this is a notification (no id = no response required)
        let is_notification = request.id.is_none();

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(request.id)),
            "initialized" | "notifications/initialized" => {
                // Notification - no response per JSON-RPC 2.0
                debug!("Received initialized notification");
                None
            }
            "notifications/cancelled" => {
                self.handle_cancelled(request.params);
                None
            }
            "tools/list" => Some(self.handle_tools_list(request.id)),
            "ping" => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method => {
                // For unknown methods, only respond if it's a request (has id)
                if is_notification {
                    debug!(method = %method, "Unknown notification, ignoring");
                    None
                } else {
                    error!(method = %method, "Unknown method");
                    Some(JsonRpcResponse::error(
                        request.id,
                        -32601,
                        format!("Method not found: {}", method),
                    ))
                }
            }
        }
    }

    /// Handle initialize request
    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling initialize request");

        let result = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: Capabilities {
                tools: ToolCapabilities {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: "company-research".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        match serde_json::to_value(result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize initialize result");
                JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
            }
        }
    }

    /// Handle tools/list request
    fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling tools/list request");

        let tools = vec![
            get_research_start_tool(),
            get_research_resume_tool(),
            get_research_status_tool(),
        ];

        JsonRpcResponse::success(
            id,
            serde_json::json!({
                "tools": tools
            }),
        )
    }

    /// Handle notifications/cancelled by firing the call's token
    fn handle_cancelled(&self, params: Option<Value>) {
        let params = match params.map(serde_json::from_value::<CancelledParams>) {
            Some(Ok(p)) => p,
            _ => {
                warn!("Ignoring malformed cancellation notification");
                return;
            }
        };

        let key = request_key(&params.request_id);
        let token = self.lock_in_flight().get(&key).cloned();
        match token {
            Some(token) => {
                info!(request_id = %key, reason = ?params.reason, "Cancelling tool call");
                token.cancel();
            }
            None => debug!(request_id = %key, "Cancellation for unknown or finished request"),
        }
    }

    fn spawn_tool_call(
        &self,
        tool_calls: &mut JoinSet<()>,
        request: JsonRpcRequest,
        notifier: Notifier,
    ) {
        let id = request.id;
        let params = match request.params.map(serde_json::from_value::<ToolCallParams>) {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                let response = JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e));
                tool_calls.spawn(async move { notifier.respond(&response).await });
                return;
            }
            None => {
                let response = JsonRpcResponse::error(id, -32602, "Missing params");
                tool_calls.spawn(async move { notifier.respond(&response).await });
                return;
            }
        };

        let cancel = CancellationToken::new();
        let key = id.as_ref().map(request_key);
        if let Some(key) = &key {
            self.lock_in_flight().insert(key.clone(), cancel.clone());
        }

        let state = Arc::clone(&self.state);
        let in_flight = Arc::clone(&self.in_flight);

        tool_calls.spawn(async move {
            info!(tool = %params.name, "Handling tool call");
            let ctx = ToolContext {
                notifier: notifier.clone(),
                cancel,
            };
            let result = handle_tool_call(&state, &params.name, params.arguments, ctx).await;

            if let Some(key) = key {
                in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
            }

            notifier.respond(&tool_response(id, result)).await;
        });
    }

    fn cancel_all(&self) {
        let in_flight = self.lock_in_flight();
        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "Cancelling in-flight tool calls");
        }
        for token in in_flight.values() {
            token.cancel();
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Turn a handler result into the JSON-RPC response for a tool call.
///
/// Bad arguments are protocol errors (-32602); every other failure is a tool
/// result flagged with `isError`.
pub fn tool_response(id: Option<Value>, result: Result<Value, McpError>) -> JsonRpcResponse {
    let (content, is_error) = match result {
        Ok(result) => {
            let text = serde_json::to_string_pretty(&result).unwrap_or_else(|e| {
                error!(error = %e, "Failed to serialize tool result");
                format!("{{\"error\": \"Serialization failed: {}\"}}", e)
            });
            (
                ToolResultContent {
                    content_type: "text".to_string(),
                    text,
                },
                None,
            )
        }
        Err(e @ McpError::InvalidParameters { .. }) => {
            return JsonRpcResponse::error(id, -32602, e.to_string());
        }
        Err(e) => (
            ToolResultContent {
                content_type: "text".to_string(),
                text: format!("Error: {}", e),
            },
            Some(true),
        ),
    };

    let tool_result = ToolCallResult {
        content: vec![content],
        is_error,
    };

    match serde_json::to_value(tool_result) {
        Ok(val) => JsonRpcResponse::success(id, val),
        Err(e) => {
            error!(error = %e, "Failed to serialize tool call result");
            JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
        }
    }
}

/// Request ids may be numbers or strings; key them by their JSON text.
fn request_key(id: &Value) -> String {
    id.to_string()
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        debug!(message = %line, "Sending message");
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Get the research_start tool definition
fn get_research_start_tool() -> Tool {
    Tool {
        name: "research_start".to_string(),
        description: "Start researching a company. Generates search queries, searches the web, takes notes, extracts the requested fields and reflects on completeness. Progress is reported as notifications/research_event; the run may suspend and return {awaiting: step}.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "sessionId": {
                    "type": "string",
                    "description": "Caller chosen id for this research run"
                },
                "company": {
                    "type": "string",
                    "description": "Name of the company to research"
                },
                "maxSearchQueries": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Max search queries per generation step (default: 3)"
                },
                "maxSearchResults": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Max results per search query (default: 3)"
                },
                "maxReflectionSteps": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Extra research passes allowed after the first reflection (default: 0)"
                },
                "includeSearchResults": {
                    "type": "boolean",
                    "description": "Return the raw search results with the extracted info (default: false)"
                },
                "userNotes": {
                    "type": "string",
                    "description": "Optional hints for the researcher"
                },
                "extractionSchema": {
                    "type": "object",
                    "description": "JSON schema of the fields to extract (default: CompanyInfo)"
                }
            },
            "required": ["sessionId", "company"],
            "additionalProperties": false
        }),
    }
}

/// Get the research_resume tool definition
fn get_research_resume_tool() -> Tool {
    Tool {
        name: "research_resume".to_string(),
        description: "Resume a suspended research run from its last checkpoint.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "sessionId": {
                    "type": "string",
                    "description": "Id of the suspended research run"
                },
                "resumeInput": {
                    "description": "Optional input from the reviewer, recorded in the logs"
                }
            },
            "required": ["sessionId"],
            "additionalProperties": false
        }),
    }
}

/// Get the research_status tool definition
fn get_research_status_tool() -> Tool {
    Tool {
        name: "research_status".to_string(),
        description: "Show the stored checkpoint of a research run: pending step and accumulated state.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "sessionId": {
                    "type": "string",
                    "description": "Id of the research run"
                }
            },
            "required": ["sessionId"],
            "additionalProperties": false
        }),
    }
}
