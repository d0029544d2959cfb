//! Script Values
//!
//! Runtime representation of script data. Arrays and objects are shared,
//! mutable references so aliasing behaves the way script authors expect.
//! All values are `Send + Sync` so the evaluator can run on any worker.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, Notify};

use super::ast::FunctionDef;
use super::scope::Scope;
use crate::tools::ToolBridge;

pub type ArrayRef = Arc<RwLock<Vec<Value>>>;
pub type ObjectRef = Arc<RwLock<IndexMap<String, Value>>>;

/// Containers nested deeper than this are rejected when converted to JSON
const MAX_CONVERSION_DEPTH: usize = 512;

/// Strings longer than this many characters cannot be built by scripts
pub(crate) const MAX_STRING_LENGTH: usize = 1 << 26;

/// Largest integer a script number represents exactly
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Array(ArrayRef),
    Object(ObjectRef),
    /// Error instance; a plain object carrying at least `name` and `message`
    Error(ObjectRef),
    Function(Arc<Function>),
    Promise(Arc<Promise>),
}

pub enum Function {
    Closure { def: Arc<FunctionDef>, env: Scope },
    /// Language intrinsic addressed by its qualified name, e.g. `Math.max`
    Native(&'static str),
    /// Built-in method bound to its receiver, e.g. `items.push`
    Method { receiver: Value, name: &'static str },
    Tool(Arc<ToolBridge>),
}

impl Function {
    pub fn name(&self) -> String {
        match self {
            Function::Closure { def, .. } => def
                .name
                .as_deref()
                .unwrap_or("anonymous")
                .to_string(),
            Function::Native(name) => name.to_string(),
            Function::Method { name, .. } => name.to_string(),
            Function::Tool(bridge) => bridge.name().to_string(),
        }
    }
}

/// Errors converting a value to JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JsonConversionError {
    #[error("Converting circular structure to JSON")]
    Circular,
    #[error("Maximum nesting depth exceeded while converting to JSON")]
    TooDeep,
}

impl Value {
    pub fn string(text: impl AsRef<str>) -> Self {
        Value::String(Arc::from(text.as_ref()))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
            Value::Array(_) | Value::Object(_) | Value::Error(_) | Value::Promise(_) => "object",
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::String(s) => parse_number(s),
            Value::Array(_) => parse_number(&self.to_display_string()),
            _ => f64::NAN,
        }
    }

    /// Integer conversion used for indices and counts; NaN becomes zero
    pub fn to_integer(&self) -> f64 {
        let n = self.to_number();
        if n.is_nan() {
            0.0
        } else {
            n.trunc()
        }
    }

    /// String conversion as performed by `String(value)` and concatenation
    pub fn to_display_string(&self) -> String {
        let mut seen = Vec::new();
        self.display_inner(&mut seen)
    }

    fn display_inner(&self, seen: &mut Vec<usize>) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::Array(items) => {
                let id = Arc::as_ptr(items) as *const () as usize;
                if seen.contains(&id) || seen.len() >= MAX_CONVERSION_DEPTH {
                    return String::new();
                }
                seen.push(id);
                let items = items.read().clone();
                let mut out = String::new();
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    if !item.is_nullish() {
                        out.push_str(&item.display_inner(seen));
                    }
                    // callers reject text past the limit
                    if out.len() > MAX_STRING_LENGTH {
                        break;
                    }
                }
                seen.pop();
                out
            }
            Value::Object(_) => "[object Object]".to_string(),
            Value::Error(_) => {
                let (name, message) = self.error_parts().unwrap_or_default();
                if message.is_empty() {
                    name
                } else {
                    format!("{}: {}", name, message)
                }
            }
            Value::Function(f) => format!("function {}() {{ [native code] }}", f.name()),
            Value::Promise(_) => "[object Promise]".to_string(),
        }
    }

    /// Rendering used by `console.log`: strings verbatim, containers as pretty JSON
    pub fn to_log_string(&self) -> String {
        match self {
            Value::String(s) => s.to_string(),
            Value::Array(_) | Value::Object(_) => match self.to_json() {
                Ok(Some(json)) => {
                    serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string())
                }
                Ok(None) => "undefined".to_string(),
                Err(JsonConversionError::Circular) => "[Circular]".to_string(),
                Err(JsonConversionError::TooDeep) => "[Nested]".to_string(),
            },
            Value::Function(f) => format!("[Function: {}]", f.name()),
            Value::Promise(_) => "Promise { <pending> }".to_string(),
            other => other.to_display_string(),
        }
    }

    /// Key used when this value indexes an object or array
    pub fn to_property_key(&self) -> String {
        match self {
            Value::String(s) => s.to_string(),
            other => other.to_display_string(),
        }
    }

    /// `name` and `message` of an error instance
    pub fn error_parts(&self) -> Option<(String, String)> {
        let Value::Error(fields) = self else {
            return None;
        };
        let fields = fields.read();
        let name = fields
            .get("name")
            .map(Value::to_display_string)
            .unwrap_or_else(|| "Error".to_string());
        let message = fields
            .get("message")
            .map(Value::to_display_string)
            .unwrap_or_default();
        Some((name, message))
    }

    /// Message reported for a value that escaped the script as an exception
    pub fn describe_thrown(&self) -> String {
        match self.error_parts() {
            Some((name, message)) if name == "Error" => message,
            Some((name, message)) => format!("{}: {}", name, message),
            None => self.to_display_string(),
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) | (Value::Error(a), Value::Error(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Promise(a), Value::Promise(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::String(_))
            | (Value::String(_), Value::Number(_))
            | (Value::Bool(_), _)
            | (_, Value::Bool(_)) => {
                if matches!(self, Value::Bool(_) | Value::Number(_) | Value::String(_))
                    && matches!(other, Value::Bool(_) | Value::Number(_) | Value::String(_))
                {
                    self.to_number() == other.to_number()
                } else {
                    self.strict_equals(other)
                }
            }
            _ => self.strict_equals(other),
        }
    }

    /// Convert to JSON; `None` for values JSON cannot represent (undefined, functions)
    pub fn to_json(&self) -> Result<Option<JsonValue>, JsonConversionError> {
        let mut stack = Vec::new();
        self.to_json_inner(&mut stack)
    }

    fn to_json_inner(
        &self,
        stack: &mut Vec<usize>,
    ) -> Result<Option<JsonValue>, JsonConversionError> {
        let json = match self {
            Value::Undefined | Value::Function(_) => return Ok(None),
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => json_number(*n),
            Value::String(s) => JsonValue::String(s.to_string()),
            Value::Promise(_) => JsonValue::Object(serde_json::Map::new()),
            Value::Array(items) => {
                let id = Arc::as_ptr(items) as *const () as usize;
                enter_container(stack, id)?;
                let items = items.read().clone();
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(item.to_json_inner(stack)?.unwrap_or(JsonValue::Null));
                }
                stack.pop();
                JsonValue::Array(out)
            }
            Value::Object(fields) | Value::Error(fields) => {
                let id = Arc::as_ptr(fields) as *const () as usize;
                enter_container(stack, id)?;
                let fields = fields.read().clone();
                let mut out = serde_json::Map::with_capacity(fields.len());
                for (key, value) in &fields {
                    if let Some(json) = value.to_json_inner(stack)? {
                        out.insert(key.clone(), json);
                    }
                }
                stack.pop();
                JsonValue::Object(out)
            }
        };
        Ok(Some(json))
    }
}

fn enter_container(stack: &mut Vec<usize>, id: usize) -> Result<(), JsonConversionError> {
    if stack.contains(&id) {
        return Err(JsonConversionError::Circular);
    }
    if stack.len() >= MAX_CONVERSION_DEPTH {
        return Err(JsonConversionError::TooDeep);
    }
    stack.push(id);
    Ok(())
}

/// JSON number for a script number; integral values become JSON integers
pub fn json_number(n: f64) -> JsonValue {
    if !n.is_finite() {
        return JsonValue::Null;
    }
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return JsonValue::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Format a number the way scripts print it: `3`, `0.1`, `1e+21`, `NaN`
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        let formatted = format!("{:e}", n);
        return match formatted.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{}e+{}", mantissa, exponent)
            }
            _ => formatted,
        };
    }
    format!("{}", n)
}

/// String to number conversion: surrounding whitespace ignored, empty is zero
/// Whether the concatenation of `parts` stays within [`MAX_STRING_LENGTH`] characters
pub(crate) fn fits_string_limit(parts: &[&str]) -> bool {
    let bytes: usize = parts.iter().map(|part| part.len()).sum();
    bytes <= MAX_STRING_LENGTH
        || parts.iter().map(|part| part.chars().count()).sum::<usize>() <= MAX_STRING_LENGTH
}

pub fn parse_number(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16)
            .map(|v| v as f64)
            .unwrap_or(f64::NAN);
    }
    let valid = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !valid {
        return f64::NAN;
    }
    trimmed.parse().unwrap_or(f64::NAN)
}

// =============================================================================
// Promise
// =============================================================================

/// Future settling to a fulfilled value or a rejection reason
pub type Settlement = BoxFuture<'static, Result<Value, Value>>;

enum PromiseState {
    /// Work still in flight; whoever awaits first drives it
    Pending(Settlement),
    /// Created by `new Promise` and waiting for its resolve/reject callbacks
    Deferred,
    Settled(Result<Value, Value>),
}

pub struct Promise {
    state: Mutex<PromiseState>,
    settled: Notify,
}

impl Promise {
    fn with_state(state: PromiseState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            settled: Notify::new(),
        })
    }

    pub fn resolved(value: Value) -> Arc<Self> {
        Self::with_state(PromiseState::Settled(Ok(value)))
    }

    pub fn rejected(reason: Value) -> Arc<Self> {
        Self::with_state(PromiseState::Settled(Err(reason)))
    }

    pub fn pending(work: Settlement) -> Arc<Self> {
        Self::with_state(PromiseState::Pending(work))
    }

    pub fn deferred() -> Arc<Self> {
        Self::with_state(PromiseState::Deferred)
    }

    /// Promise fulfilled with `value`, adopting its state when it is itself a promise
    pub fn resolve_value(value: Value) -> Arc<Self> {
        match value {
            Value::Promise(promise) => promise,
            other => Self::resolved(other),
        }
    }

    /// Settle a deferred promise; later calls are ignored
    pub async fn complete(&self, outcome: Result<Value, Value>) {
        let mut state = self.state.lock().await;
        if !matches!(*state, PromiseState::Deferred) {
            return;
        }
        *state = match outcome {
            Ok(Value::Promise(inner)) => {
                PromiseState::Pending(async move { inner.settle().await }.boxed())
            }
            other => PromiseState::Settled(other),
        };
        drop(state);
        self.settled.notify_waiters();
    }

    /// Wait for the outcome
    pub async fn settle(&self) -> Result<Value, Value> {
        loop {
            let notified = self.settled.notified();
            {
                let mut state = self.state.lock().await;
                match &mut *state {
                    PromiseState::Settled(outcome) => return outcome.clone(),
                    PromiseState::Pending(work) => {
                        let outcome = work.await;
                        *state = PromiseState::Settled(outcome.clone());
                        return outcome;
                    }
                    PromiseState::Deferred => {}
                }
            }
            notified.await;
        }
    }
}

// =============================================================================
// Debug
// =============================================================================

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Array(items) => write!(f, "Array(len={})", items.read().len()),
            Value::Object(fields) => write!(f, "Object(keys={})", fields.read().len()),
            Value::Error(_) => write!(f, "{}", self.to_display_string()),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::Promise(_) => write!(f, "Promise"),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::Closure { .. } => write!(f, "Closure({})", self.name()),
            Function::Native(name) => write!(f, "Native({})", name),
            Function::Method { name, .. } => write!(f, "Method({})", name),
            Function::Tool(bridge) => write!(f, "Tool({})", bridge.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    fn object(pairs: &[(&str, Value)]) -> Value {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<IndexMap<_, _>>();
        Value::Object(Arc::new(RwLock::new(map)))
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 42 "), 42.0);
        assert_eq!(parse_number(""), 0.0);
        assert_eq!(parse_number("0x10"), 16.0);
        assert!(parse_number("12px").is_nan());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::Number(f64::NAN).truthy());
        assert!(!Value::string("").truthy());
        assert!(Value::string("0").truthy());
        assert!(array(vec![]).truthy());
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(Value::Number(1.0).loose_equals(&Value::string("1")));
        assert!(Value::Bool(true).loose_equals(&Value::Number(1.0)));
        assert!(!Value::Null.loose_equals(&Value::Number(0.0)));
        assert!(!Value::Number(f64::NAN).loose_equals(&Value::Number(f64::NAN)));
    }

    #[test]
    fn test_reference_equality() {
        let a = array(vec![]);
        assert!(a.strict_equals(&a.clone()));
        assert!(!a.strict_equals(&array(vec![])));
    }

    #[test]
    fn test_to_json_rules() {
        let value = object(&[
            ("int", Value::Number(3.0)),
            ("float", Value::Number(2.5)),
            ("inf", Value::Number(f64::INFINITY)),
            ("skip", Value::Undefined),
            (
                "list",
                array(vec![Value::Undefined, Value::string("x"), Value::Bool(true)]),
            ),
        ]);
        assert_eq!(
            value.to_json().unwrap(),
            Some(json!({"int": 3, "float": 2.5, "inf": null, "list": [null, "x", true]}))
        );
        assert_eq!(Value::Undefined.to_json().unwrap(), None);
    }

    #[test]
    fn test_to_json_detects_cycles() {
        let list = Arc::new(RwLock::new(Vec::new()));
        let value = Value::Array(list.clone());
        list.write().push(value.clone());
        assert_eq!(value.to_json(), Err(JsonConversionError::Circular));
        assert_eq!(value.to_log_string(), "[Circular]");
        list.write().clear();
    }

    #[test]
    fn test_shared_reference_is_not_circular() {
        let shared = array(vec![Value::Number(1.0)]);
        let value = array(vec![shared.clone(), shared]);
        assert_eq!(value.to_json().unwrap(), Some(json!([[1], [1]])));
    }

    #[test]
    fn test_display_strings() {
        let nested = array(vec![
            Value::Number(1.0),
            array(vec![Value::Number(2.0), Value::Null]),
        ]);
        assert_eq!(nested.to_display_string(), "1,2,");
        assert_eq!(object(&[]).to_display_string(), "[object Object]");
    }

    #[test]
    fn test_log_string_pretty_prints_containers() {
        let value = object(&[("a", Value::Number(1.0))]);
        assert_eq!(value.to_log_string(), "{\n  \"a\": 1\n}");
        assert_eq!(Value::string("plain").to_log_string(), "plain");
    }

    #[test]
    fn test_describe_thrown() {
        let fields = IndexMap::from([
            ("name".to_string(), Value::string("TypeError")),
            ("message".to_string(), Value::string("bad")),
        ]);
        let err = Value::Error(Arc::new(RwLock::new(fields)));
        assert_eq!(err.describe_thrown(), "TypeError: bad");
        assert_eq!(Value::string("oops").describe_thrown(), "oops");
    }

    #[tokio::test]
    async fn test_promise_settles_pending_work_once() {
        let promise = Promise::pending(async { Ok(Value::Number(7.0)) }.boxed());
        assert!(matches!(promise.settle().await, Ok(Value::Number(n)) if n == 7.0));
        assert!(matches!(promise.settle().await, Ok(Value::Number(n)) if n == 7.0));
    }

    #[tokio::test]
    async fn test_deferred_promise_completes() {
        let promise = Promise::deferred();
        let waiter = {
            let promise = promise.clone();
            tokio::spawn(async move { promise.settle().await })
        };
        tokio::task::yield_now().await;
        promise.complete(Err(Value::string("no"))).await;
        promise.complete(Ok(Value::Null)).await;
        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(Value::String(s)) if &*s == "no"));
    }
}
