//! Tools
//!
//! Host capabilities exposed to sandboxed scripts.

mod bridge;
mod definition;
mod error;
mod schema;

pub use bridge::{ToolBridge, ARGS_KEY};
pub use definition::{ToolDefinition, ToolHandler, ToolSet};
pub use error::ToolError;
pub use schema::{Schema, SchemaViolation};
