//! Execution Engine
//!
//! Runs one script against one tool set: compile, build a fresh sandbox,
//! evaluate under a deadline and fold every outcome into an
//! [`ExecutionResult`]. The public entry points never return `Err` and never
//! let a panic escape.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn, Instrument};

use crate::config::SandboxConfig;
use crate::sandbox::{LogBuffer, SandboxContext};
use crate::script::interpreter::Interpreter;
use crate::script::parse;
use crate::tools::{ToolDefinition, ToolSet};

/// A script and the tools it may call
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub tools: ToolSet,
    /// Deadline in milliseconds; `None` or zero uses the configured default
    pub timeout_ms: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            tools: ToolSet::new(),
            timeout_ms: None,
        }
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.insert(tool);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Uniform outcome of an execution
///
/// Exactly one of `output` and `error` carries the outcome; `logs` holds the
/// console output captured before the script settled, failed or timed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: Value,
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: Value, logs: Vec<String>) -> Self {
        Self {
            output,
            logs,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            output: Value::Null,
            logs,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Lifecycle of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Created,
    Compiling,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Created => "created",
            ExecutionState::Compiling => "compiling",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an execution together with how it ended
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub state: ExecutionState,
    pub result: ExecutionResult,
    pub duration: Duration,
}

type Outcome = (ExecutionState, Result<Value, String>);

/// Runs scripts under a fixed [`SandboxConfig`]
///
/// Holds no per-execution state; one executor can serve concurrent calls.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    config: SandboxConfig,
}

impl Executor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.execute_detailed(request).await.result
    }

    /// Execute and report the terminal state and wall-clock duration
    pub async fn execute_detailed(&self, request: ExecutionRequest) -> ExecutionReport {
        let started = Instant::now();
        let timeout_ms = self.config.effective_timeout_ms(request.timeout_ms);
        let logs = LogBuffer::new(self.config.max_log_entries);
        let span = tracing::debug_span!(
            "script_execution",
            timeout_ms,
            code_bytes = request.code.len(),
            tools = request.tools.len()
        );
        debug!(state = %ExecutionState::Created, "Execution state changed");

        let run = AssertUnwindSafe(self.run(&request, timeout_ms, logs.clone())).catch_unwind();
        let (state, outcome) = match run.instrument(span).await {
            Ok(outcome) => outcome,
            Err(panic) => (
                ExecutionState::Failed,
                Err(format!("Internal error: {}", panic_message(panic.as_ref()))),
            ),
        };

        let result = match outcome {
            Ok(output) => ExecutionResult::success(output, logs.snapshot()),
            Err(error) => ExecutionResult::failure(error, logs.snapshot()),
        };
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;
        match state {
            ExecutionState::Completed => {
                info!(duration_ms, logs = result.logs.len(), "Script execution completed")
            }
            ExecutionState::TimedOut => {
                warn!(duration_ms, timeout_ms, "Script execution timed out")
            }
            _ => warn!(
                duration_ms,
                error = result.error.as_deref().unwrap_or_default(),
                "Script execution failed"
            ),
        }

        ExecutionReport {
            state,
            result,
            duration,
        }
    }

    async fn run(&self, request: &ExecutionRequest, timeout_ms: u64, logs: LogBuffer) -> Outcome {
        debug!(state = %ExecutionState::Compiling, "Execution state changed");
        if request.code.len() > self.config.max_code_bytes {
            return (
                ExecutionState::Failed,
                Err(format!(
                    "RangeError: Script of {} bytes exceeds the limit of {} bytes",
                    request.code.len(),
                    self.config.max_code_bytes
                )),
            );
        }
        let program = match parse(&request.code) {
            Ok(program) => program,
            Err(err) => return (ExecutionState::Failed, Err(format!("SyntaxError: {}", err))),
        };
        let ctx = match SandboxContext::build(&request.tools, &self.config, logs) {
            Ok(ctx) => ctx,
            Err(err) => return (ExecutionState::Failed, Err(err.to_string())),
        };

        debug!(state = %ExecutionState::Running, "Execution state changed");
        let interpreter = Interpreter::new(&ctx);
        let deadline = Duration::from_millis(timeout_ms);
        let outcome = tokio::time::timeout(deadline, interpreter.run(&program)).await;
        debug!(steps = interpreter.steps(), "Evaluation stopped");
        ctx.release();

        match outcome {
            Ok(Ok(output)) => (ExecutionState::Completed, Ok(output)),
            Ok(Err(error)) => (ExecutionState::Failed, Err(error)),
            Err(_) => (
                ExecutionState::TimedOut,
                Err(format!(
                    "Execution timeout: script did not settle within {}ms",
                    timeout_ms
                )),
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
