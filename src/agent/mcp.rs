//! MCP tool server bridging a CLI agent run back into the process.
//!
//! The `claude` CLI runs in a separate process, so the in-process
//! callbacks (interactive questions, the scheduling tool surface, file
//! upload) are exposed to it as MCP tools on a loopback HTTP endpoint.
//! The runner starts one bridge per run and points the CLI at it with
//! `--mcp-config`; dropping the bridge shuts the server down.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::AgentCallbacks;
use crate::rendezvous::questions_from_json;

const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "panbot";
const TOOL_NAMES: [&str; 5] = [
    "ask_user",
    "schedule_job",
    "list_jobs",
    "remove_job",
    "upload_file",
];

/// Fully qualified tool names for the CLI's `--allowedTools` flag.
pub fn allowed_tools() -> Vec<String> {
    TOOL_NAMES
        .iter()
        .map(|name| format!("mcp__{SERVER_NAME}__{name}"))
        .collect()
}

/// A running per-run tool server.
pub struct McpBridge {
    url: String,
    cancel: CancellationToken,
}

impl McpBridge {
    /// Bind a loopback listener and serve `callbacks` as MCP tools.
    pub async fn start(callbacks: Arc<dyn AgentCallbacks>) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let app = Router::new().route("/mcp", post(rpc)).with_state(callbacks);
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });

        debug!(%addr, "mcp bridge listening");
        Ok(Self {
            url: format!("http://{addr}/mcp"),
            cancel,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Inline `--mcp-config` value pointing the CLI at this bridge.
    pub fn cli_config(&self) -> String {
        json!({
            "mcpServers": {
                SERVER_NAME: { "type": "http", "url": self.url }
            }
        })
        .to_string()
    }
}

impl Drop for McpBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn rpc(
    State(callbacks): State<Arc<dyn AgentCallbacks>>,
    Json(request): Json<Value>,
) -> Response {
    // Notifications carry no id and expect no response body.
    let Some(id) = request.get("id").cloned().filter(|id| !id.is_null()) else {
        return StatusCode::ACCEPTED.into_response();
    };
    let method = request["method"].as_str().unwrap_or_default();
    debug!(method, "mcp request");

    let result = match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_descriptors() })),
        "tools/call" => call_tool(callbacks.as_ref(), &request["params"]).await,
        other => Err(format!("unknown method: {other}")),
    };

    let body = match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(message) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": message },
        }),
    };
    Json(body).into_response()
}

async fn call_tool(callbacks: &dyn AgentCallbacks, params: &Value) -> Result<Value, String> {
    let Some(name) = params["name"].as_str() else {
        return Err("tools/call missing tool name".to_string());
    };
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    if name == "ask_user" {
        let questions = questions_from_json(&args["questions"]);
        let answers = callbacks.ask_user(&questions).await;
        let text = serde_json::to_string(&answers).unwrap_or_else(|_| "{}".to_string());
        return Ok(tool_text(text, false));
    }

    match callbacks.tool_call(name, &args).await {
        Ok(Some(text)) => Ok(tool_text(text, false)),
        Ok(None) => Err(format!("unknown tool: {name}")),
        // Tool failures go back to the agent as tool output, not as a
        // protocol error, so it can react to them.
        Err(e) => Ok(tool_text(format!("Error: {e}"), true)),
    }
}

fn tool_text(text: String, is_error: bool) -> Value {
    json!({ "content": [{ "type": "text", "text": text }], "isError": is_error })
}

fn tool_descriptors() -> Value {
    json!([
        {
            "name": "ask_user",
            "description": "Ask the user one or more questions with button options \
                            and wait for their answer.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "questions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "text": { "type": "string" },
                                "header": { "type": "string" },
                                "options": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "properties": {
                                            "label": { "type": "string" },
                                            "description": { "type": "string" }
                                        },
                                        "required": ["label"]
                                    }
                                }
                            },
                            "required": ["text"]
                        }
                    }
                },
                "required": ["questions"]
            }
        },
        {
            "name": "schedule_job",
            "description": "Schedule a recurring cron job that runs a prompt on a schedule.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "job_name": {
                        "type": "string",
                        "description": "Human-readable name for the job"
                    },
                    "cron_expression": {
                        "type": "string",
                        "description": "Cron schedule (e.g. '0 9 * * 1-5' for weekdays 9am, \
                                        '*/30 * * * *' for every 30min)"
                    },
                    "prompt": {
                        "type": "string",
                        "description": "The prompt to run when the job fires"
                    },
                    "skill_name": {
                        "type": "string",
                        "description": "Optional skill to invoke"
                    }
                },
                "required": ["job_name", "cron_expression", "prompt"]
            }
        },
        {
            "name": "list_jobs",
            "description": "List all active scheduled jobs.",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "remove_job",
            "description": "Remove a scheduled job by its ID.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "job_id": { "type": "string" }
                },
                "required": ["job_id"]
            }
        },
        {
            "name": "upload_file",
            "description": "Upload a text file to the current Slack channel.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "filename": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["filename", "content"]
            }
        }
    ])
}
