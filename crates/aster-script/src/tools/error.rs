//! Tool Error Types
//!
//! Errors raised while binding tools into a sandbox or invoking them.
//! Handlers return `Result<Value, ToolError>`; any `anyhow::Error` converts
//! into [`ToolError::Other`] so handler code can use `?` freely.

use thiserror::Error;

/// Tool error types
#[derive(Debug, Error)]
pub enum ToolError {
    /// Input rejected by the tool's schema; the handler was not called
    #[error("Invalid input for tool '{tool}': {reason}")]
    InvalidInput { tool: String, reason: String },

    /// Handler reported a failure
    #[error("{0}")]
    ExecutionFailed(String),

    /// Tool name cannot be bound as a script identifier
    #[error("Invalid tool name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Declared schema is not usable for validation
    #[error("Invalid schema for tool '{tool}': {reason}")]
    InvalidSchema { tool: String, reason: String },

    /// Any other handler error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolError {
    /// Create an InvalidInput error
    pub fn invalid_input(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Create an ExecutionFailed error
    pub fn execution_failed(reason: impl Into<String>) -> Self {
        Self::ExecutionFailed(reason.into())
    }

    /// Create an InvalidName error
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidSchema error
    pub fn invalid_schema(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchema {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error came from input validation
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::InvalidInput { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_error() {
        let err = ToolError::invalid_input("add", "$.a: expected number, got string");
        assert!(err.is_input_error());
        assert_eq!(
            err.to_string(),
            "Invalid input for tool 'add': $.a: expected number, got string"
        );
    }

    #[test]
    fn test_execution_failed_error() {
        let err = ToolError::execution_failed("Tool execution failed");
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
        assert!(!err.is_input_error());
        assert_eq!(err.to_string(), "Tool execution failed");
    }

    #[test]
    fn test_invalid_name_error() {
        let err = ToolError::invalid_name("my-tool", "not a valid identifier");
        assert_eq!(
            err.to_string(),
            "Invalid tool name 'my-tool': not a valid identifier"
        );
    }

    #[test]
    fn test_invalid_schema_error() {
        let err = ToolError::invalid_schema("lookup", "unknown type");
        assert_eq!(
            err.to_string(),
            "Invalid schema for tool 'lookup': unknown type"
        );
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: ToolError = anyhow::anyhow!("connection refused").into();
        assert!(matches!(err, ToolError::Other(_)));
        assert_eq!(err.to_string(), "connection refused");
    }
}
