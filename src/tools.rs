use crate::error::HandlerError;
use crate::events::task_types;
use crate::frame::error_codes;
use crate::task_registry::{Metadata, TaskOutcome, TaskRegistry, TaskScope};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Declared shape of a tool, as advertised to the model and the webview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

/// What a tool body gets besides its arguments.
#[derive(Clone)]
pub struct ToolContext {
    pub tasks: Arc<TaskRegistry>,
    /// Token of the invoking operation; background tasks derive child tokens
    pub cancel: CancellationToken,
}

type ToolFuture = BoxFuture<'static, Result<Value, HandlerError>>;

pub type ToolFn = Arc<dyn Fn(ToolContext, Value) -> ToolFuture + Send + Sync>;

struct RegisteredTool {
    definition: ToolDefinition,
    run: ToolFn,
}

/// Name → async tool function. Tool bodies are opaque to the bridge.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the tools the bridge ships with.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(execute_command_definition(), execute_command);
        registry
    }

    pub fn register<F, Fut>(&mut self, definition: ToolDefinition, run: F)
    where
        F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let name = definition.name.clone();
        let run: ToolFn = Arc::new(move |ctx, args| run(ctx, args).boxed());
        if self
            .tools
            .insert(name.clone(), RegisteredTool { definition, run })
            .is_none()
        {
            self.order.push(name);
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub async fn execute(
        &self,
        name: &str,
        ctx: ToolContext,
        args: Value,
    ) -> Result<Value, HandlerError> {
        let run = self
            .tools
            .get(name)
            .map(|tool| tool.run.clone())
            .ok_or_else(|| {
                HandlerError::with_code(
                    error_codes::TOOL_NOT_FOUND,
                    format!("Unknown tool: {}", name),
                )
            })?;
        debug!(tool = name, "executing tool");
        run(ctx, args).await
    }
}

// ==============================================================================
// execute_command
// ==============================================================================

#[derive(Debug, Deserialize)]
struct ExecuteCommandArgs {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
}

fn execute_command_definition() -> ToolDefinition {
    ToolDefinition {
        name: "execute_command".to_string(),
        description: "Run a shell command and stream its output to the terminal panel.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Command line to run" },
                "cwd": { "type": "string", "description": "Working directory" }
            },
            "required": ["command"]
        }),
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("{} 2>&1", command));
        cmd
    }
}

fn io_error(context: &str, err: std::io::Error) -> HandlerError {
    HandlerError::new(format!("{}: {}", context, err))
}

/// Runs as a background task of type `execute_command`; each output line is
/// published as task output and the task can be cancelled mid-run.
async fn execute_command(ctx: ToolContext, args: Value) -> Result<Value, HandlerError> {
    let args: ExecuteCommandArgs = serde_json::from_value(args).map_err(|e| {
        HandlerError::invalid_request(format!("Invalid execute_command arguments: {}", e))
    })?;

    let mut metadata = Metadata::new();
    metadata.insert("command".into(), json!(args.command));
    if let Some(cwd) = &args.cwd {
        metadata.insert("cwd".into(), json!(cwd));
    }
    let scope = TaskScope::start(&ctx.tasks, task_types::EXECUTE_COMMAND, &ctx.cancel, metadata)
        .map_err(|e| HandlerError::new(e.to_string()))?;
    let task_id = scope.task_id().to_string();
    let cancel = scope.token().clone();

    let mut cmd = shell_command(&args.command);
    if let Some(cwd) = &args.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    info!(task_id = %task_id, command = %args.command, "starting command");
    let mut child = cmd
        .spawn()
        .map_err(|e| io_error("Failed to start command", e))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| HandlerError::new("Command stdout unavailable"))?;
    let mut lines = BufReader::new(stdout).lines();
    let mut output = String::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                info!(task_id = %task_id, "command cancelled");
                scope.finish(TaskOutcome::Cancelled, Metadata::new());
                return Ok(json!({
                    "taskId": task_id,
                    "cancelled": true,
                    "output": output,
                }));
            }
            line = lines.next_line() => {
                match line.map_err(|e| io_error("Failed to read command output", e))? {
                    Some(line) => {
                        scope.emit_output(json!({ "line": line }));
                        output.push_str(&line);
                        output.push('\n');
                    }
                    None => break,
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| io_error("Failed to wait for command", e))?;
    let exit_code = status.code().unwrap_or(-1);

    let mut result = Metadata::new();
    result.insert("exitCode".into(), json!(exit_code));
    let outcome = if status.success() {
        TaskOutcome::Completed
    } else {
        TaskOutcome::Error
    };
    scope.finish(outcome, result);

    Ok(json!({
        "taskId": task_id,
        "exitCode": exit_code,
        "output": output,
    }))
}
