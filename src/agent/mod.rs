//! Agent execution contract and the `claude` CLI backend.
//!
//! [`AgentRunner`] is the seam the orchestrator drives; [`AgentCallbacks`]
//! is what a run may call back into (interactive questions, the
//! scheduling tool surface).  The CLI backend executes the agent in a
//! separate process and reaches the callbacks through a per-run
//! [`mcp::McpBridge`] tool server.

pub mod mcp;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::rendezvous::Question;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub working_directory: PathBuf,
    /// Resume this session when set; start fresh otherwise.
    pub session_id: Option<String>,
}

/// What a completed run produced.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub content: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub tools_used: Vec<String>,
}

/// Services the agent may call back into during a run.
#[async_trait]
pub trait AgentCallbacks: Send + Sync {
    /// Ask the triggering user; empty answers mean no reply arrived.
    async fn ask_user(&self, questions: &[Question]) -> HashMap<String, String>;

    /// Invoke a named tool.  `Ok(None)` means the tool is unknown to
    /// this context.
    async fn tool_call(&self, name: &str, args: &Value) -> anyhow::Result<Option<String>>;
}

/// Callbacks for contexts with no user to ask (webhooks, broadcasts).
pub struct NoCallbacks;

#[async_trait]
impl AgentCallbacks for NoCallbacks {
    async fn ask_user(&self, _questions: &[Question]) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn tool_call(&self, _name: &str, _args: &Value) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync + 'static {
    async fn run(
        &self,
        request: &AgentRequest,
        callbacks: Arc<dyn AgentCallbacks>,
    ) -> anyhow::Result<AgentOutcome>;
}

/// Runs the `claude` CLI as a subprocess and parses its JSON output.
pub struct ClaudeCliRunner {
    binary: String,
    timeout: Duration,
    max_turns: u32,
}

impl ClaudeCliRunner {
    pub fn new(binary: impl Into<String>, timeout: Duration, max_turns: u32) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            max_turns,
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeCliRunner {
    async fn run(
        &self,
        request: &AgentRequest,
        callbacks: Arc<dyn AgentCallbacks>,
    ) -> anyhow::Result<AgentOutcome> {
        // The bridge must outlive the subprocess; the CLI calls back
        // into it for interactive questions and tools.
        let bridge = mcp::McpBridge::start(callbacks).await?;
        let args = build_args(request, self.max_turns, Some(&bridge.cli_config()));
        debug!(binary = %self.binary, cwd = %request.working_directory.display(),
               mcp_url = bridge.url(), "spawning agent process");

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(&args)
            .current_dir(&request.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!("agent run timed out after {}s", self.timeout.as_secs())
            })?
            .with_context(|| format!("failed to spawn '{}'", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "agent process exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let outcome = parse_cli_output(&output.stdout)?;
        info!(
            session_id = outcome.session_id.as_deref().unwrap_or(""),
            cost_usd = outcome.cost_usd.unwrap_or_default(),
            "agent run complete"
        );
        Ok(outcome)
    }
}

fn build_args(request: &AgentRequest, max_turns: u32, mcp_config: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(session_id) = &request.session_id {
        args.push("--resume".to_string());
        args.push(session_id.clone());
    }
    args.push("-p".to_string());
    args.push(request.prompt.clone());
    args.push("--output-format".to_string());
    args.push("json".to_string());
    args.push("--max-turns".to_string());
    args.push(max_turns.to_string());
    if let Some(config) = mcp_config {
        args.push("--mcp-config".to_string());
        args.push(config.to_string());
        args.push("--allowedTools".to_string());
        args.push(mcp::allowed_tools().join(","));
    }
    args
}

/// Parse the CLI's `--output-format json` result document.
fn parse_cli_output(stdout: &[u8]) -> anyhow::Result<AgentOutcome> {
    let payload: Value =
        serde_json::from_slice(stdout).context("agent produced non-JSON output")?;

    if payload["is_error"].as_bool() == Some(true) {
        anyhow::bail!(
            "agent reported an error: {}",
            payload["result"].as_str().unwrap_or("unknown")
        );
    }

    Ok(AgentOutcome {
        content: payload["result"].as_str().unwrap_or_default().to_string(),
        session_id: payload["session_id"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        cost_usd: payload["total_cost_usd"].as_f64(),
        tools_used: payload["tools_used"]
            .as_array()
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    })
}
