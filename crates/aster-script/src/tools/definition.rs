//! Tool Definitions
//!
//! Host capabilities exposed to scripts. A [`ToolDefinition`] pairs a name and
//! optional input [`Schema`] with an async [`ToolHandler`]; a [`ToolSet`] is the
//! collection handed to one execution.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::error::ToolError;
use super::schema::Schema;

/// Host-side implementation of a tool
///
/// Implemented for any `Fn(Value) -> impl Future<Output = Result<Value, ToolError>>`,
/// so plain async functions can be registered directly.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with input that already passed schema validation
    async fn call(&self, input: Value) -> Result<Value, ToolError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        (self)(input).await
    }
}

/// A tool callable from scripts
#[derive(Clone)]
pub struct ToolDefinition {
    /// Name the tool is bound to inside the sandbox
    pub name: String,
    /// Human-readable description, not interpreted by the engine
    pub description: String,
    /// Input shape checked before the handler runs
    pub input_schema: Option<Schema>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDefinition {
    /// Create a tool without an input schema
    pub fn new(name: impl Into<String>, handler: impl ToolHandler + 'static) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

/// Tools available to one execution, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ToolSet::insert`]
    pub fn with(mut self, tool: ToolDefinition) -> Self {
        self.insert(tool);
        self
    }

    /// Add a tool, returning any tool previously registered under the same name
    pub fn insert(&mut self, tool: ToolDefinition) -> Option<ToolDefinition> {
        self.tools.insert(tool.name.clone(), tool)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool names in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }
}

impl FromIterator<ToolDefinition> for ToolSet {
    fn from_iter<I: IntoIterator<Item = ToolDefinition>>(iter: I) -> Self {
        let mut set = ToolSet::new();
        for tool in iter {
            set.insert(tool);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn echo(input: Value) -> Result<Value, ToolError> {
        Ok(input)
    }

    async fn fail(_input: Value) -> Result<Value, ToolError> {
        Err(ToolError::execution_failed("nope"))
    }

    #[tokio::test]
    async fn test_async_fn_is_a_handler() {
        let tool = ToolDefinition::new("echo", echo);
        let output = tool.handler.call(json!({"x": 1})).await.unwrap();
        assert_eq!(output, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let tool = ToolDefinition::new("fail", fail);
        let err = tool.handler.call(json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn test_builders() {
        let tool = ToolDefinition::new("echo", echo)
            .with_description("Returns its input")
            .with_schema(Schema::Any);
        assert_eq!(tool.description, "Returns its input");
        assert_eq!(tool.input_schema, Some(Schema::Any));
        assert!(format!("{:?}", tool).contains("echo"));
    }

    #[test]
    fn test_tool_set_replaces_duplicates() {
        let mut tools = ToolSet::new()
            .with(ToolDefinition::new("b", echo))
            .with(ToolDefinition::new("a", echo));
        assert_eq!(tools.names(), vec!["a", "b"]);
        assert!(tools.insert(ToolDefinition::new("a", fail)).is_some());
        assert_eq!(tools.len(), 2);
        assert!(tools.get("a").is_some());
        assert!(tools.get("c").is_none());
    }

    #[test]
    fn test_tool_set_from_iterator() {
        let tools: ToolSet = ["x", "y"]
            .into_iter()
            .map(|name| ToolDefinition::new(name, echo))
            .collect();
        assert_eq!(tools.iter().count(), 2);
        assert!(!tools.is_empty());
    }
}
