//! Sandbox configuration
//!
//! Execution limits, loadable from YAML with environment overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Limits applied to every script execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Deadline used when a request does not carry one (ms)
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Scripts larger than this fail before compiling
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
    /// Evaluation step budget
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Maximum nesting of script function calls
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Tool invocations allowed per execution
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    /// `console.log` entries retained per execution
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
    /// Evaluation steps between yields to the async runtime
    #[serde(default = "default_yield_interval")]
    pub yield_interval: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_code_bytes() -> usize {
    256 * 1024
}
fn default_max_steps() -> u64 {
    10_000_000
}
fn default_max_call_depth() -> usize {
    128
}
fn default_max_tool_calls() -> usize {
    1000
}
fn default_max_log_entries() -> usize {
    10_000
}
fn default_yield_interval() -> u64 {
    256
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            max_code_bytes: default_max_code_bytes(),
            max_steps: default_max_steps(),
            max_call_depth: default_max_call_depth(),
            max_tool_calls: default_max_tool_calls(),
            max_log_entries: default_max_log_entries(),
            yield_interval: default_yield_interval(),
        }
    }
}

/// Environment variables that override configured limits
const ENV_OVERRIDES: [(&str, &str); 4] = [
    ("ASTER_SCRIPT_TIMEOUT_MS", "default_timeout_ms"),
    ("ASTER_SCRIPT_MAX_STEPS", "max_steps"),
    ("ASTER_SCRIPT_MAX_TOOL_CALLS", "max_tool_calls"),
    ("ASTER_SCRIPT_MAX_LOG_ENTRIES", "max_log_entries"),
];

impl SandboxConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (env_key, field) in ENV_OVERRIDES {
            let Ok(raw) = std::env::var(env_key) else {
                continue;
            };
            let value: u64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(env_key, format!("'{}' is not a number", raw)))?;
            match field {
                "default_timeout_ms" => self.default_timeout_ms = value,
                "max_steps" => self.max_steps = value,
                "max_tool_calls" => self.max_tool_calls = to_usize(env_key, value)?,
                "max_log_entries" => self.max_log_entries = to_usize(env_key, value)?,
                _ => {}
            }
            tracing::debug!(env = env_key, value, "Applied config override");
        }
        self.validate()
    }

    /// Reject limits that would make every execution fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("default_timeout_ms", self.default_timeout_ms),
            ("max_code_bytes", self.max_code_bytes as u64),
            ("max_steps", self.max_steps),
            ("max_call_depth", self.max_call_depth as u64),
            ("max_tool_calls", self.max_tool_calls as u64),
            ("max_log_entries", self.max_log_entries as u64),
            ("yield_interval", self.yield_interval),
        ];
        for (key, value) in limits {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Deadline for a request, falling back to the default for `None` and zero
    pub fn effective_timeout_ms(&self, requested: Option<u64>) -> u64 {
        match requested {
            Some(ms) if ms > 0 => ms,
            _ => self.default_timeout_ms,
        }
    }
}

fn to_usize(key: &str, value: u64) -> Result<usize, ConfigError> {
    usize::try_from(value).map_err(|_| ConfigError::invalid(key, "value too large"))
}
