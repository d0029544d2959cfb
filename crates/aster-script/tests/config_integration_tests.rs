//! Integration tests for sandbox configuration
//!
//! YAML files, environment overrides and configured limits reaching an
//! execution.

use std::io::Write;

use aster_script::{ConfigError, ExecutionRequest, Executor, SandboxConfig};
use serial_test::serial;
use tempfile::NamedTempFile;

fn yaml_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

// ============================================================================
// Files
// ============================================================================

#[test]
fn test_from_file() {
    let file = yaml_file("default_timeout_ms: 1500\nmax_call_depth: 16\n");
    let config = SandboxConfig::from_file(file.path()).unwrap();
    assert_eq!(config.default_timeout_ms, 1500);
    assert_eq!(config.max_call_depth, 16);
    assert_eq!(config.max_steps, SandboxConfig::default().max_steps);
}

#[test]
fn test_from_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = SandboxConfig::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_from_file_rejects_zero_limit() {
    let file = yaml_file("max_tool_calls: 0\n");
    let err = SandboxConfig::from_file(file.path()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid value for max_tool_calls: must be greater than zero"
    );
}

#[test]
fn test_config_serializes_back_to_yaml() {
    let config = SandboxConfig {
        max_steps: 42,
        ..SandboxConfig::default()
    };
    let yaml = serde_yaml::to_string(&config).unwrap();
    assert_eq!(SandboxConfig::from_yaml_str(&yaml).unwrap(), config);
}

// ============================================================================
// Environment overrides
// ============================================================================

#[test]
#[serial]
fn test_env_overrides() {
    temp_env::with_vars(
        [
            ("ASTER_SCRIPT_TIMEOUT_MS", Some("2500")),
            ("ASTER_SCRIPT_MAX_STEPS", Some(" 9000 ")),
            ("ASTER_SCRIPT_MAX_TOOL_CALLS", Some("7")),
            ("ASTER_SCRIPT_MAX_LOG_ENTRIES", None),
        ],
        || {
            let config = SandboxConfig::from_env().unwrap();
            assert_eq!(config.default_timeout_ms, 2500);
            assert_eq!(config.max_steps, 9000);
            assert_eq!(config.max_tool_calls, 7);
            assert_eq!(config.max_log_entries, 10_000);
        },
    );
}

#[test]
#[serial]
fn test_env_override_not_a_number() {
    temp_env::with_var("ASTER_SCRIPT_MAX_STEPS", Some("lots"), || {
        let err = SandboxConfig::from_env().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for ASTER_SCRIPT_MAX_STEPS: 'lots' is not a number"
        );
    });
}

#[test]
#[serial]
fn test_env_override_zero_rejected() {
    temp_env::with_var("ASTER_SCRIPT_MAX_LOG_ENTRIES", Some("0"), || {
        let err = SandboxConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    });
}

#[test]
#[serial]
fn test_env_overrides_file_values() {
    let file = yaml_file("max_tool_calls: 3\nmax_steps: 100\n");
    temp_env::with_var("ASTER_SCRIPT_MAX_TOOL_CALLS", Some("11"), || {
        let mut config = SandboxConfig::from_file(file.path()).unwrap();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.max_tool_calls, 11);
        assert_eq!(config.max_steps, 100);
    });
}

// ============================================================================
// Limits applied to executions
// ============================================================================

#[tokio::test]
async fn test_configured_call_depth() {
    let config = SandboxConfig::from_yaml_str("max_call_depth: 8").unwrap();
    let executor = Executor::new(config);

    let shallow = executor
        .execute(ExecutionRequest::new(
            "function f(n) { return n === 0 ? 0 : f(n - 1); } f(5)",
        ))
        .await;
    assert_eq!(shallow.output, serde_json::json!(0));

    let deep = executor
        .execute(ExecutionRequest::new(
            "function f(n) { return n === 0 ? 0 : f(n - 1); } f(50)",
        ))
        .await;
    assert_eq!(
        deep.error.as_deref(),
        Some("RangeError: Maximum call stack size exceeded")
    );
}

#[tokio::test]
async fn test_configured_default_timeout() {
    let config = SandboxConfig::from_yaml_str("default_timeout_ms: 40").unwrap();
    let result = Executor::new(config)
        .execute(ExecutionRequest::new("await new Promise(() => {})"))
        .await;
    assert_eq!(
        result.error.as_deref(),
        Some("Execution timeout: script did not settle within 40ms")
    );
}
