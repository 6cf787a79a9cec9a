//! MCP (JSON-RPC 2.0 over HTTP) front end for the `exec` tool

use super::{CommandRunner, ExecRequest, DEFAULT_TIMEOUT_SECS, DEFAULT_WORKDIR, MAX_TIMEOUT_SECS};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "workspace-exec";
pub const EXEC_TOOL: &str = "exec";

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const PARSE_ERROR: i32 = -32700;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    #[serde(default)]
    jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Clone)]
pub struct ExecServerState {
    pub runner: Arc<dyn CommandRunner>,
}

pub fn router(runner: Arc<dyn CommandRunner>) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/", post(handle_mcp))
        .route("/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES)),
        )
        .with_state(ExecServerState { runner })
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn handle_mcp(State(state): State<ExecServerState>, body: Bytes) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "invalid JSON-RPC payload");
            let response = JsonRpcResponse::error(Value::Null, PARSE_ERROR, format!("Parse error: {e}"));
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    match handle_request(state.runner.as_ref(), request).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Dispatches one request; `None` for notifications, which get no reply
pub async fn handle_request(runner: &dyn CommandRunner, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    if request.method.starts_with("notifications/") {
        debug!(method = %request.method, "notification received");
        return None;
    }

    let id = request.id.clone().unwrap_or(Value::Null);
    let response = match request.method.as_str() {
        "initialize" => JsonRpcResponse::result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        ),
        "tools/list" => JsonRpcResponse::result(id, json!({ "tools": [exec_tool_definition()] })),
        "tools/call" => handle_tool_call(runner, id, request.params).await,
        other => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
    };
    Some(response)
}

async fn handle_tool_call(runner: &dyn CommandRunner, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let call: ToolCall = match serde_json::from_value(params.unwrap_or(Value::Null)) {
        Ok(call) => call,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {e}")),
    };
    if call.name != EXEC_TOOL {
        return JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Unknown tool: {}", call.name));
    }

    let request: ExecRequest =
        match serde_json::from_value(call.arguments.unwrap_or_else(|| json!({}))) {
            Ok(request) => request,
            Err(e) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid arguments: {e}"))
            }
        };
    let argv = match request.to_argv() {
        Ok(argv) => argv,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
    };

    let timeout = request.timeout();
    info!(
        program = %argv.first().map(String::as_str).unwrap_or_default(),
        timeout_secs = timeout.as_secs(),
        "executing in workspace"
    );
    let outcome = runner.run(&argv, timeout).await;
    if !outcome.success() {
        debug!(exit_code = outcome.exit_code, timed_out = outcome.timed_out, "command unsuccessful");
    }

    JsonRpcResponse::result(
        id,
        json!({
            "content": [{ "type": "text", "text": outcome.render() }],
            "isError": !outcome.success()
        }),
    )
}

fn exec_tool_definition() -> Value {
    json!({
        "name": EXEC_TOOL,
        "description": "Execute a command in the workspace container.\n\n\
            The workspace may have different tools installed than the agent. Use this for \
            builds, tests, git and anything else that needs the workspace's toolchain. \
            `command` runs through `sh -c`; `argv` runs a program directly.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to execute"
                },
                "argv": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Program and arguments, executed without a shell"
                },
                "workdir": {
                    "type": "string",
                    "description": format!("Working directory (default: {DEFAULT_WORKDIR})"),
                    "default": DEFAULT_WORKDIR
                },
                "timeout": {
                    "type": "integer",
                    "description": format!("Timeout in seconds (default: {DEFAULT_TIMEOUT_SECS}, max: {MAX_TIMEOUT_SECS})"),
                    "default": DEFAULT_TIMEOUT_SECS
                }
            }
        }
    })
}
