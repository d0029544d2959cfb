//! Aster Script - sandboxed script execution for agent tools
//!
//! An agent hands a short script to the sandbox together with the host tools
//! it may call. The script runs in an isolated global scope with a bounded
//! deadline; its console output is captured and every outcome is folded
//! into one [`ExecutionResult`].
//!
//! ```no_run
//! use aster_script::{execute, ToolDefinition, ToolError, ToolSet};
//! use serde_json::{json, Value};
//!
//! async fn add(input: Value) -> Result<Value, ToolError> {
//!     let a = input["a"].as_f64().unwrap_or_default();
//!     let b = input["b"].as_f64().unwrap_or_default();
//!     Ok(json!(a + b))
//! }
//!
//! # async fn run() {
//! let tools = ToolSet::new().with(ToolDefinition::new("add", add));
//! let result = execute("await add({ a: 5, b: 3 })", tools, None).await;
//! assert_eq!(result.output, json!(8));
//! # }
//! ```

pub mod config;
pub mod executor;
pub mod logging;
pub mod sandbox;
pub mod script;
pub mod tools;

pub use config::{ConfigError, SandboxConfig};
pub use executor::{ExecutionReport, ExecutionRequest, ExecutionResult, ExecutionState, Executor};
pub use sandbox::{LogBuffer, SandboxContext};
pub use tools::{Schema, SchemaViolation, ToolBridge, ToolDefinition, ToolError, ToolHandler, ToolSet};

/// Execute a script with the default [`SandboxConfig`]
///
/// `timeout_ms` of `None` or zero uses the default deadline of 30 seconds.
pub async fn execute(code: &str, tools: ToolSet, timeout_ms: Option<u64>) -> ExecutionResult {
    let request = ExecutionRequest {
        code: code.to_string(),
        tools,
        timeout_ms,
    };
    Executor::default().execute(request).await
}
