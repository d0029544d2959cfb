//! Sandbox
//!
//! The isolated global environment one script runs in: language intrinsics,
//! bridged tools, captured console output and the resource counters shared
//! by everything the script starts. A context is built fresh per execution
//! and never reused.

mod logs;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tracing::debug;

pub use logs::LogBuffer;

use crate::config::SandboxConfig;
use crate::script::builtins;
use crate::script::heap::Heap;
use crate::script::lexer::is_valid_identifier;
use crate::script::scope::Scope;
use crate::script::value::{Function, Value};
use crate::tools::{ToolBridge, ToolError, ToolSet};

/// Global names tools may not take
const RESERVED_GLOBALS: [&str; 1] = ["console"];

pub struct SandboxContext {
    pub(crate) globals: Scope,
    pub(crate) logs: LogBuffer,
    pub(crate) heap: Arc<Heap>,
    pub(crate) config: SandboxConfig,
    pub(crate) tool_calls: AtomicUsize,
}

impl SandboxContext {
    /// Build the global environment for one execution
    ///
    /// Tools are bound after the intrinsics, so a tool named like a global
    /// such as `Math` replaces it for this script.
    pub fn build(
        tools: &ToolSet,
        config: &SandboxConfig,
        logs: LogBuffer,
    ) -> Result<Self, ToolError> {
        let heap = Arc::new(Heap::new());
        let globals = Scope::new();
        heap.adopt_scope(&globals);
        builtins::install(&globals, &heap);

        for name in tools.names() {
            let Some(tool) = tools.get(name) else {
                continue;
            };
            if !is_valid_identifier(name) {
                return Err(ToolError::invalid_name(name, "not a valid identifier"));
            }
            if RESERVED_GLOBALS.contains(&name) {
                return Err(ToolError::invalid_name(name, "name is reserved"));
            }
            if let Some(schema) = &tool.input_schema {
                schema
                    .check()
                    .map_err(|reason| ToolError::invalid_schema(name, reason))?;
            }
            let bridge = Arc::new(ToolBridge::new(tool.clone()));
            globals.declare(name, Value::Function(Arc::new(Function::Tool(bridge))), false);
        }
        debug!(tools = tools.len(), "Sandbox context built");

        Ok(Self {
            globals,
            logs,
            heap,
            config: config.clone(),
            tool_calls: AtomicUsize::new(0),
        })
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    /// Value bound to a global name
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.lookup(name)
    }

    /// Break reference cycles left behind by the script
    pub fn release(&self) {
        self.heap.release();
    }
}
