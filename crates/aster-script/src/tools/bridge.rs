//! Tool Bridge
//!
//! Adapts a [`ToolDefinition`] to the calling convention scripts use:
//! positional arguments are collapsed into a single JSON input, validated
//! against the tool's schema, and the handler runs as its own task.

use std::time::Instant;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::debug;

use super::definition::ToolDefinition;
use super::error::ToolError;

/// Key under which positional arguments are passed when they are not a single object
pub const ARGS_KEY: &str = "args";

/// Callable form of a tool inside one sandbox
#[derive(Debug, Clone)]
pub struct ToolBridge {
    definition: ToolDefinition,
}

impl ToolBridge {
    pub fn new(definition: ToolDefinition) -> Self {
        Self { definition }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// Collapse script arguments into one input value
    ///
    /// A single object is passed through, no arguments become `{}`, and
    /// anything else is wrapped as `{"args": [...]}`.
    pub fn collapse_arguments(mut args: Vec<Value>) -> Value {
        match args.len() {
            0 => Value::Object(Map::new()),
            1 if args[0].is_object() => args.remove(0),
            _ => {
                let mut wrapped = Map::new();
                wrapped.insert(ARGS_KEY.to_string(), Value::Array(args));
                Value::Object(wrapped)
            }
        }
    }

    /// Build and validate the handler input for a call
    pub fn prepare(&self, args: Vec<Value>) -> Result<Value, ToolError> {
        let input = Self::collapse_arguments(args);
        if let Some(schema) = &self.definition.input_schema {
            schema
                .validate(&input)
                .map_err(|violation| ToolError::invalid_input(self.name(), violation.to_string()))?;
        }
        Ok(input)
    }

    /// Run the handler on validated input
    pub async fn invoke(&self, input: Value) -> Result<Value, ToolError> {
        let start = Instant::now();
        let result = self.definition.handler.call(input).await;
        debug!(
            tool = %self.name(),
            duration_ms = start.elapsed().as_millis() as u64,
            success = result.is_ok(),
            "Tool invocation finished"
        );
        result
    }

    /// Start the handler immediately on the runtime
    ///
    /// The task is detached: it keeps running even if the script stops
    /// waiting for it.
    pub fn spawn(&self, input: Value) -> JoinHandle<Result<Value, ToolError>> {
        let bridge = self.clone();
        debug!(tool = %self.name(), "Tool invocation started");
        tokio::spawn(async move { bridge.invoke(input).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Schema;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn sum(input: Value) -> Result<Value, ToolError> {
        let a = input["a"].as_f64().unwrap_or_default();
        let b = input["b"].as_f64().unwrap_or_default();
        Ok(json!(a + b))
    }

    fn adder() -> ToolBridge {
        ToolBridge::new(ToolDefinition::new("add", sum).with_schema(Schema::object([
            ("a", Schema::Number),
            ("b", Schema::Number),
        ])))
    }

    #[test]
    fn test_collapse_arguments() {
        assert_eq!(ToolBridge::collapse_arguments(vec![]), json!({}));
        assert_eq!(
            ToolBridge::collapse_arguments(vec![json!({"a": 1})]),
            json!({"a": 1})
        );
        assert_eq!(
            ToolBridge::collapse_arguments(vec![json!(4), json!(5)]),
            json!({"args": [4, 5]})
        );
        assert_eq!(
            ToolBridge::collapse_arguments(vec![json!("x")]),
            json!({"args": ["x"]})
        );
        assert_eq!(
            ToolBridge::collapse_arguments(vec![json!([1, 2])]),
            json!({"args": [[1, 2]]})
        );
    }

    #[test]
    fn test_prepare_rejects_invalid_input() {
        let err = adder().prepare(vec![json!({"a": 1, "b": "2"})]).unwrap_err();
        assert!(err.is_input_error());
        assert_eq!(
            err.to_string(),
            "Invalid input for tool 'add': $.b: expected number, got string"
        );
    }

    #[tokio::test]
    async fn test_spawn_runs_handler() {
        let bridge = adder();
        let input = bridge.prepare(vec![json!({"a": 5, "b": 3})]).unwrap();
        let output = bridge.spawn(input).await.unwrap().unwrap();
        assert_eq!(output, json!(8.0));
    }

    #[tokio::test]
    async fn test_handler_not_called_when_validation_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = move |_input: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ToolError>(json!(null))
            }
        };
        let bridge = ToolBridge::new(
            ToolDefinition::new("strict", handler).with_schema(Schema::object([("id", Schema::String)])),
        );
        assert!(bridge.prepare(vec![json!(1)]).is_err());
        let input = bridge.prepare(vec![json!({"id": "x"})]).unwrap();
        bridge.invoke(input).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
