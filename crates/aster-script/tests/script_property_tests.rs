//! Property-based tests for script execution
//!
//! Covers arithmetic agreement with host integers, JSON values surviving a
//! trip through a script and a tool, and log capture preserving order.

use aster_script::{execute, ToolBridge, ToolDefinition, ToolError, ToolSet};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn echo(input: Value) -> Result<Value, ToolError> {
    Ok(input)
}

/// Tool set whose `fixture` tool returns `value` and whose `echo` tool
/// returns its input
fn fixture_tools(value: Value) -> ToolSet {
    let fixture = move |_input: Value| {
        let value = value.clone();
        async move { Ok::<_, ToolError>(value) }
    };
    ToolSet::new()
        .with(ToolDefinition::new("fixture", fixture))
        .with(ToolDefinition::new("echo", echo))
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

/// JSON documents using values that convert losslessly: integers, strings,
/// booleans and null, nested in arrays and objects with identifier keys
fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1_000_000i64..1_000_000).prop_map(|n| json!(n)),
        "[a-zA-Z0-9 _.,!?-]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::vec(("[a-z][a-z0-9_]{0,6}", inner), 0..6).prop_map(|entries| {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key, value);
                }
                Value::Object(map)
            }),
        ]
    })
}

fn arb_log_line() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{0,20}"
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Integer arithmetic agrees with the host for values in the safe range
    #[test]
    fn prop_integer_arithmetic_matches_host(
        a in -10_000i64..10_000,
        b in -10_000i64..10_000,
        c in 1i64..1_000,
    ) {
        let code = format!("({a}) + ({b}) * ({c}) - ({a}) % ({c})");
        let expected = a + b * c - a % c;

        let result = runtime().block_on(execute(&code, ToolSet::new(), None));
        prop_assert!(result.error.is_none(), "{:?}", result.error);
        prop_assert_eq!(result.output, json!(expected));
        prop_assert!(result.logs.is_empty());
    }

    /// Tool output imported into a script exports back unchanged
    #[test]
    fn prop_tool_output_round_trips(value in arb_json()) {
        let result = runtime().block_on(execute(
            "await fixture()",
            fixture_tools(value.clone()),
            None,
        ));
        prop_assert!(result.error.is_none(), "{:?}", result.error);
        prop_assert_eq!(result.output, value);
    }

    /// A value passed through a script to a tool and back is unchanged
    #[test]
    fn prop_tool_input_round_trips(value in arb_json()) {
        let code = r#"
            const original = await fixture();
            const returned = await echo({ payload: original });
            returned.payload
        "#;
        let result = runtime().block_on(execute(code, fixture_tools(value.clone()), None));
        prop_assert!(result.error.is_none(), "{:?}", result.error);
        prop_assert_eq!(result.output, value);
    }

    /// JSON.stringify in a script produces text the host parses to the same value
    #[test]
    fn prop_stringify_is_valid_json(value in arb_json()) {
        let result = runtime().block_on(execute(
            "JSON.stringify(await fixture())",
            fixture_tools(value.clone()),
            None,
        ));
        let text = result.output.as_str().map(str::to_string).unwrap_or_default();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(parsed, value);
    }

    /// Every logged line is captured in call order
    #[test]
    fn prop_logs_preserve_order(lines in prop::collection::vec(arb_log_line(), 0..20)) {
        let code = "const lines = await fixture(); for (const line of lines) { console.log(line); } lines.length";
        let result = runtime().block_on(execute(code, fixture_tools(json!(lines.clone())), None));
        prop_assert_eq!(result.output, json!(lines.len()));
        prop_assert_eq!(result.logs, lines);
    }

    /// Positional arguments collapse to `{"args": [...]}` unless a single object is passed
    #[test]
    fn prop_argument_collapsing(args in prop::collection::vec(arb_json(), 0..4)) {
        let collapsed = ToolBridge::collapse_arguments(args.clone());
        match args.as_slice() {
            [] => prop_assert_eq!(collapsed, json!({})),
            [single] if single.is_object() => prop_assert_eq!(&collapsed, single),
            _ => prop_assert_eq!(collapsed, json!({ "args": args })),
        }
    }
}
