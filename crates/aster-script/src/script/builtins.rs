//! Built-in Library
//!
//! Global intrinsics (`Math`, `JSON`, `Object`, `Promise`, the `Error`
//! family, ...) and the methods of arrays, strings, numbers and promises.
//!
//! Intrinsics are addressed by qualified name (`Math.max`) through
//! [`Function::Native`]; methods are bound to their receiver through
//! [`Function::Method`]. Both dispatch here.

use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::heap::Heap;
use super::interpreter::{Abrupt, EvalResult, Interpreter, MAX_ARRAY_LENGTH};
use super::scope::Scope;
use super::value::{
    fits_string_limit, format_number, ArrayRef, Function, ObjectRef, Promise, Settlement, Value,
    MAX_STRING_LENGTH,
};

/// Deepest `Array.prototype.flat` recursion
const MAX_FLAT_DEPTH: f64 = 128.0;

const CONSOLE_METHODS: &[&str] = &[
    "console.log",
    "console.info",
    "console.warn",
    "console.error",
    "console.debug",
];

const MATH_FUNCTIONS: &[&str] = &[
    "Math.abs", "Math.floor", "Math.ceil", "Math.round", "Math.trunc", "Math.sign",
    "Math.sqrt", "Math.cbrt", "Math.pow", "Math.min", "Math.max", "Math.log",
    "Math.log2", "Math.log10", "Math.exp", "Math.sin", "Math.cos", "Math.tan",
    "Math.asin", "Math.acos", "Math.atan", "Math.atan2", "Math.hypot", "Math.random",
];

const MATH_CONSTANTS: &[(&str, f64)] = &[
    ("PI", std::f64::consts::PI),
    ("E", std::f64::consts::E),
    ("LN2", std::f64::consts::LN_2),
    ("LN10", std::f64::consts::LN_10),
    ("LOG2E", std::f64::consts::LOG2_E),
    ("LOG10E", std::f64::consts::LOG10_E),
    ("SQRT2", std::f64::consts::SQRT_2),
    ("SQRT1_2", std::f64::consts::FRAC_1_SQRT_2),
];

const JSON_FUNCTIONS: &[&str] = &["JSON.stringify", "JSON.parse"];

const GLOBAL_FUNCTIONS: &[&str] = &[
    "Object", "Array", "Number", "String", "Boolean", "Promise", "Error", "TypeError",
    "RangeError", "ReferenceError", "SyntaxError", "parseInt", "parseFloat", "isNaN",
    "isFinite",
];

const ERROR_TYPES: &[&str] = &["Error", "TypeError", "RangeError", "ReferenceError", "SyntaxError"];

/// Functions reachable as properties of global constructors
const STATICS: &[&str] = &[
    "Object.keys", "Object.values", "Object.entries", "Object.assign",
    "Object.fromEntries", "Object.freeze", "Array.isArray", "Array.from", "Array.of",
    "Number.isInteger", "Number.isSafeInteger", "Number.isFinite", "Number.isNaN",
    "Number.parseFloat", "Number.parseInt", "String.fromCharCode", "Promise.resolve",
    "Promise.reject", "Promise.all", "Promise.allSettled", "Promise.race",
];

const ARRAY_METHODS: &[&str] = &[
    "push", "pop", "shift", "unshift", "slice", "splice", "concat", "join", "reverse",
    "indexOf", "lastIndexOf", "includes", "map", "filter", "reduce", "reduceRight",
    "forEach", "find", "findIndex", "findLast", "findLastIndex", "some", "every", "sort",
    "flat", "flatMap", "fill", "at", "keys", "values", "entries", "toString",
];

const STRING_METHODS: &[&str] = &[
    "toUpperCase", "toLowerCase", "trim", "trimStart", "trimEnd", "split", "slice",
    "substring", "substr", "indexOf", "lastIndexOf", "includes", "startsWith", "endsWith",
    "replace", "replaceAll", "repeat", "padStart", "padEnd", "charAt", "charCodeAt",
    "codePointAt", "at", "concat", "localeCompare", "toString", "valueOf",
];

const NUMBER_METHODS: &[&str] = &["toFixed", "toString", "toLocaleString", "valueOf"];

const BOOL_METHODS: &[&str] = &["toString", "valueOf"];

const OBJECT_METHODS: &[&str] = &["hasOwnProperty", "toString"];

const PROMISE_METHODS: &[&str] = &["then", "catch", "finally"];

// =============================================================================
// Globals
// =============================================================================

fn native(name: &'static str) -> Value {
    Value::Function(Arc::new(Function::Native(name)))
}

fn method(receiver: Value, name: &'static str) -> Value {
    Value::Function(Arc::new(Function::Method { receiver, name }))
}

fn namespace(heap: &Heap, members: &[&'static str], constants: &[(&str, f64)]) -> Value {
    let mut fields = IndexMap::new();
    for qualified in members {
        if let Some((_, key)) = qualified.split_once('.') {
            fields.insert(key.to_string(), native(*qualified));
        }
    }
    for (key, value) in constants {
        fields.insert(key.to_string(), Value::Number(*value));
    }
    heap.object(fields)
}

/// Bind the language intrinsics into a global scope
pub(crate) fn install(globals: &Scope, heap: &Heap) {
    globals.declare("console", namespace(heap, CONSOLE_METHODS, &[]), false);
    globals.declare("Math", namespace(heap, MATH_FUNCTIONS, MATH_CONSTANTS), false);
    globals.declare("JSON", namespace(heap, JSON_FUNCTIONS, &[]), false);
    for name in GLOBAL_FUNCTIONS {
        globals.declare(name, native(*name), false);
    }
    globals.declare("NaN", Value::Number(f64::NAN), false);
    globals.declare("Infinity", Value::Number(f64::INFINITY), false);
}

/// Property of a global constructor, e.g. `Object.keys` or `Number.EPSILON`
pub(crate) fn native_static(owner: &str, key: &str) -> Option<Value> {
    if let Some(qualified) = STATICS
        .iter()
        .find(|qualified| qualified.split_once('.') == Some((owner, key)))
    {
        return Some(native(*qualified));
    }
    let number = match (owner, key) {
        ("Number", "MAX_SAFE_INTEGER") => 9_007_199_254_740_991.0,
        ("Number", "MIN_SAFE_INTEGER") => -9_007_199_254_740_991.0,
        ("Number", "EPSILON") => f64::EPSILON,
        ("Number", "MAX_VALUE") => f64::MAX,
        ("Number", "MIN_VALUE") => 5e-324,
        ("Number", "POSITIVE_INFINITY") => f64::INFINITY,
        ("Number", "NEGATIVE_INFINITY") => f64::NEG_INFINITY,
        ("Number", "NaN") => f64::NAN,
        (_, "name") => return Some(Value::string(owner)),
        _ => return None,
    };
    Some(Value::Number(number))
}

/// Built-in method of a receiver, bound to it
pub(crate) fn bound_method(receiver: &Value, key: &str) -> Option<Value> {
    let table = match receiver {
        Value::Array(_) => ARRAY_METHODS,
        Value::String(_) => STRING_METHODS,
        Value::Number(_) => NUMBER_METHODS,
        Value::Bool(_) => BOOL_METHODS,
        Value::Object(_) | Value::Error(_) => OBJECT_METHODS,
        Value::Promise(_) => PROMISE_METHODS,
        _ => return None,
    };
    table
        .iter()
        .find(|name| **name == key)
        .map(|name| method(receiver.clone(), *name))
}

pub(crate) fn instance_of(value: &Value, constructor: &Function) -> bool {
    let Function::Native(name) = constructor else {
        return false;
    };
    match *name {
        "Error" => matches!(value, Value::Error(_)),
        "Array" => matches!(value, Value::Array(_)),
        "Promise" => matches!(value, Value::Promise(_)),
        "Object" => matches!(
            value,
            Value::Array(_) | Value::Object(_) | Value::Error(_) | Value::Function(_) | Value::Promise(_)
        ),
        error if ERROR_TYPES.contains(&error) => value
            .error_parts()
            .is_some_and(|(found, _)| found == error),
        _ => false,
    }
}

/// Enumerable keys, in insertion order for objects and index order for arrays
pub(crate) fn own_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(fields) | Value::Error(fields) => fields.read().keys().cloned().collect(),
        Value::Array(items) => (0..items.read().len()).map(|i| i.to_string()).collect(),
        Value::String(text) => (0..text.chars().count()).map(|i| i.to_string()).collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn own_entries(value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Object(fields) | Value::Error(fields) => fields
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        Value::Array(items) => items
            .read()
            .iter()
            .enumerate()
            .map(|(index, item)| (index.to_string(), item.clone()))
            .collect(),
        Value::String(text) => text
            .chars()
            .enumerate()
            .map(|(index, c)| (index.to_string(), Value::string(c.to_string())))
            .collect(),
        _ => Vec::new(),
    }
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn callback_arg(interp: &Interpreter<'_>, args: &[Value], index: usize) -> EvalResult {
    match arg(args, index) {
        callback @ Value::Function(_) => Ok(callback),
        other => Err(interp.type_error(format!(
            "{} is not a function",
            other.to_display_string()
        ))),
    }
}

/// Resolve a possibly negative position against a length
fn relative_index(value: &Value, len: usize, default: usize) -> usize {
    if matches!(value, Value::Undefined) {
        return default;
    }
    let n = value.to_integer();
    if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        n.min(len as f64) as usize
    }
}

// =============================================================================
// Native functions
// =============================================================================

pub(crate) fn call_native<'a>(
    interp: &'a Interpreter<'_>,
    name: &'a str,
    args: Vec<Value>,
) -> BoxFuture<'a, EvalResult> {
    async move {
        if name.starts_with("console.") {
            return console(interp, &args);
        }
        if let Some(function) = name.strip_prefix("Math.") {
            return Ok(Value::Number(math(function, &args)));
        }
        let heap = interp.heap();
        match name {
            "JSON.stringify" => json_stringify(interp, &args),
            "JSON.parse" => {
                let text = arg(&args, 0).to_display_string();
                serde_json::from_str::<JsonValue>(&text)
                    .map(|json| heap.import_json(&json))
                    .map_err(|err| interp.throw("SyntaxError", format!("Invalid JSON: {}", err)))
            }
            "Object" => Ok(match arg(&args, 0) {
                value if value.is_nullish() => heap.object(IndexMap::new()),
                value => value,
            }),
            "Object.keys" => {
                let target = object_arg(interp, &args)?;
                Ok(heap.array(own_keys(&target).into_iter().map(Value::string).collect()))
            }
            "Object.values" => {
                let target = object_arg(interp, &args)?;
                Ok(heap.array(own_entries(&target).into_iter().map(|(_, v)| v).collect()))
            }
            "Object.entries" => {
                let target = object_arg(interp, &args)?;
                let entries = own_entries(&target)
                    .into_iter()
                    .map(|(key, value)| heap.array(vec![Value::string(key), value]))
                    .collect();
                Ok(heap.array(entries))
            }
            "Object.assign" => {
                let target = object_arg(interp, &args)?;
                for source in args.iter().skip(1) {
                    for (key, value) in own_entries(source) {
                        interp.set_property(&target, key, value)?;
                    }
                }
                Ok(target)
            }
            "Object.fromEntries" => {
                let mut fields = IndexMap::new();
                for entry in interp.iterate(&arg(&args, 0))? {
                    if !matches!(entry, Value::Array(_)) {
                        return Err(interp.type_error(format!(
                            "Iterator value {} is not an entry object",
                            entry.to_display_string()
                        )));
                    }
                    let key = interp.get_property(&entry, "0")?.to_property_key();
                    let value = interp.get_property(&entry, "1")?;
                    fields.insert(key, value);
                }
                Ok(heap.object(fields))
            }
            "Object.freeze" => Ok(arg(&args, 0)),
            "Array" => new_array(interp, args),
            "Array.isArray" => Ok(Value::Bool(matches!(arg(&args, 0), Value::Array(_)))),
            "Array.of" => Ok(heap.array(args)),
            "Array.from" => array_from(interp, &args).await,
            "Number" => Ok(Value::Number(args.first().map_or(0.0, Value::to_number))),
            "Number.isInteger" => Ok(Value::Bool(
                matches!(arg(&args, 0), Value::Number(n) if n.is_finite() && n.fract() == 0.0),
            )),
            "Number.isSafeInteger" => Ok(Value::Bool(matches!(
                arg(&args, 0),
                Value::Number(n) if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0
            ))),
            "Number.isFinite" => Ok(Value::Bool(
                matches!(arg(&args, 0), Value::Number(n) if n.is_finite()),
            )),
            "Number.isNaN" => Ok(Value::Bool(matches!(arg(&args, 0), Value::Number(n) if n.is_nan()))),
            "parseFloat" | "Number.parseFloat" => Ok(Value::Number(parse_float(
                &arg(&args, 0).to_display_string(),
            ))),
            "parseInt" | "Number.parseInt" => Ok(Value::Number(parse_int(
                &arg(&args, 0).to_display_string(),
                &arg(&args, 1),
            ))),
            "isNaN" => Ok(Value::Bool(arg(&args, 0).to_number().is_nan())),
            "isFinite" => Ok(Value::Bool(arg(&args, 0).to_number().is_finite())),
            "String" => {
                let text = args.first().map(Value::to_display_string).unwrap_or_default();
                if !fits_string_limit(&[&text]) {
                    return Err(interp.invalid_string_length());
                }
                Ok(Value::string(text))
            }
            "String.fromCharCode" => Ok(Value::string(
                args.iter()
                    .filter_map(|code| char::from_u32(code.to_number() as u32))
                    .collect::<String>(),
            )),
            "Boolean" => Ok(Value::Bool(arg(&args, 0).truthy())),
            "Promise" => Err(interp.type_error(
                "Promise constructor cannot be invoked without 'new'",
            )),
            "Promise.resolve" => Ok(Value::Promise(Promise::resolve_value(arg(&args, 0)))),
            "Promise.reject" => Ok(Value::Promise(Promise::rejected(arg(&args, 0)))),
            "Promise.all" | "Promise.allSettled" | "Promise.race" => {
                promise_combinator(interp, name, &args)
            }
            error if ERROR_TYPES.contains(&error) => Ok(make_error(interp, error, &args)),
            other => Err(interp.type_error(format!("{} is not a function", other))),
        }
    }
    .boxed()
}

/// `new` applied to an intrinsic
pub(crate) async fn construct(interp: &Interpreter<'_>, name: &str, args: Vec<Value>) -> EvalResult {
    match name {
        "Promise" => new_promise(interp, args).await,
        "Array" => new_array(interp, args),
        "Object" | "Number" | "String" | "Boolean" => call_native(interp, name, args).await,
        error if ERROR_TYPES.contains(&error) => Ok(make_error(interp, error, &args)),
        other => Err(interp.type_error(format!("{} is not a constructor", other))),
    }
}

fn console(interp: &Interpreter<'_>, args: &[Value]) -> EvalResult {
    let line = args
        .iter()
        .map(Value::to_log_string)
        .collect::<Vec<_>>()
        .join(" ");
    if interp.log(line) {
        Ok(Value::Undefined)
    } else {
        Err(interp.throw(
            "RangeError",
            format!(
                "Log entry limit of {} exceeded",
                interp.config().max_log_entries
            ),
        ))
    }
}

fn math(function: &str, args: &[Value]) -> f64 {
    let x = args.first().map_or(f64::NAN, Value::to_number);
    let y = args.get(1).map_or(f64::NAN, Value::to_number);
    let numbers = || args.iter().map(Value::to_number);
    match function {
        "abs" => x.abs(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        "round" => {
            let floor = x.floor();
            if x - floor >= 0.5 {
                floor + 1.0
            } else {
                floor
            }
        }
        "trunc" => x.trunc(),
        "sign" => {
            if x.is_nan() || x == 0.0 {
                x
            } else {
                x.signum()
            }
        }
        "sqrt" => x.sqrt(),
        "cbrt" => x.cbrt(),
        "pow" => {
            if y.is_nan() {
                f64::NAN
            } else {
                x.powf(y)
            }
        }
        "min" => numbers().fold(f64::INFINITY, |acc, n| {
            if acc.is_nan() || n.is_nan() {
                f64::NAN
            } else {
                acc.min(n)
            }
        }),
        "max" => numbers().fold(f64::NEG_INFINITY, |acc, n| {
            if acc.is_nan() || n.is_nan() {
                f64::NAN
            } else {
                acc.max(n)
            }
        }),
        "log" => x.ln(),
        "log2" => x.log2(),
        "log10" => x.log10(),
        "exp" => x.exp(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "asin" => x.asin(),
        "acos" => x.acos(),
        "atan" => x.atan(),
        "atan2" => x.atan2(y),
        "hypot" => numbers().map(|n| n * n).sum::<f64>().sqrt(),
        "random" => rand::random::<f64>(),
        _ => f64::NAN,
    }
}

fn json_stringify(interp: &Interpreter<'_>, args: &[Value]) -> EvalResult {
    let indent = match arg(args, 2) {
        Value::Number(n) if n >= 1.0 => " ".repeat(n.min(10.0) as usize),
        Value::String(s) => s.chars().take(10).collect(),
        _ => String::new(),
    };
    let json = match arg(args, 0).to_json() {
        Ok(Some(json)) => json,
        Ok(None) => return Ok(Value::Undefined),
        Err(err) => return Err(interp.type_error(err.to_string())),
    };
    if indent.is_empty() {
        return Ok(Value::string(json.to_string()));
    }
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    json.serialize(&mut serializer)
        .map_err(|err| interp.type_error(err.to_string()))?;
    Ok(Value::string(String::from_utf8_lossy(&out)))
}

fn object_arg(interp: &Interpreter<'_>, args: &[Value]) -> EvalResult {
    match arg(args, 0) {
        value if value.is_nullish() => {
            Err(interp.type_error("Cannot convert undefined or null to object"))
        }
        value => Ok(value),
    }
}

fn new_array(interp: &Interpreter<'_>, args: Vec<Value>) -> EvalResult {
    if let [Value::Number(length)] = args.as_slice() {
        let length = *length;
        if length < 0.0 || length.fract() != 0.0 || length > MAX_ARRAY_LENGTH as f64 {
            return Err(interp.throw("RangeError", "Invalid array length"));
        }
        return Ok(interp
            .heap()
            .array(vec![Value::Undefined; length as usize]));
    }
    Ok(interp.heap().array(args))
}

async fn array_from(interp: &Interpreter<'_>, args: &[Value]) -> EvalResult {
    let source = arg(args, 0);
    let items = match &source {
        Value::Array(_) | Value::String(_) => interp.iterate(&source)?,
        Value::Object(_) => {
            let length = interp.get_property(&source, "length")?.to_integer();
            if length > MAX_ARRAY_LENGTH as f64 {
                return Err(interp.throw("RangeError", "Invalid array length"));
            }
            let mut items = Vec::new();
            for index in 0..length.max(0.0) as usize {
                items.push(interp.get_property(&source, &index.to_string())?);
            }
            items
        }
        other if other.is_nullish() => {
            return Err(interp.type_error(format!(
                "{} is not iterable",
                other.to_display_string()
            )))
        }
        _ => Vec::new(),
    };
    let mapper = arg(args, 1);
    if !matches!(mapper, Value::Function(_)) {
        return Ok(interp.heap().array(items));
    }
    let mut mapped = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        mapped.push(
            interp
                .call_value(&mapper, vec![item, Value::Number(index as f64)])
                .await?,
        );
    }
    Ok(interp.heap().array(mapped))
}

fn make_error(interp: &Interpreter<'_>, name: &str, args: &[Value]) -> Value {
    let message = match arg(args, 0) {
        Value::Undefined => String::new(),
        other => other.to_display_string(),
    };
    let error = interp.heap().error(name, message);
    if let (Value::Error(fields), Value::Object(options)) = (&error, arg(args, 1)) {
        if let Some(cause) = options.read().get("cause").cloned() {
            fields.write().insert("cause".to_string(), cause);
        }
    }
    error
}

/// Digits of a numeric prefix, as `parseInt` reads them
pub(crate) fn parse_int(text: &str, radix: &Value) -> f64 {
    let trimmed = text.trim_start();
    let (negative, mut digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let mut radix = match radix {
        Value::Undefined => 0,
        other => other.to_integer() as i64,
    };
    if radix == 0 || radix == 16 {
        if let Some(rest) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            digits = rest;
            radix = 16;
        }
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let radix = radix as u32;
    let mut value = None;
    for c in digits.chars() {
        let Some(digit) = c.to_digit(radix) else {
            break;
        };
        value = Some(value.unwrap_or(0.0) * radix as f64 + digit as f64);
    }
    match value {
        Some(v) if negative => -v,
        Some(v) => v,
        None => f64::NAN,
    }
}

/// Longest decimal prefix, as `parseFloat` reads it
pub(crate) fn parse_float(text: &str) -> f64 {
    let trimmed = text.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    if trimmed[end..].starts_with("Infinity") {
        return if trimmed.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }
    let mut digits = 0;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
        digits += 1;
    }
    if bytes.get(end) == Some(&b'.') {
        end += 1;
        while bytes.get(end).is_some_and(u8::is_ascii_digit) {
            end += 1;
            digits += 1;
        }
    }
    if digits == 0 {
        return f64::NAN;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exponent_end = end + 1;
        if matches!(bytes.get(exponent_end), Some(b'+' | b'-')) {
            exponent_end += 1;
        }
        if bytes.get(exponent_end).is_some_and(u8::is_ascii_digit) {
            while bytes.get(exponent_end).is_some_and(u8::is_ascii_digit) {
                exponent_end += 1;
            }
            end = exponent_end;
        }
    }
    trimmed[..end].parse().unwrap_or(f64::NAN)
}

// =============================================================================
// Promises
// =============================================================================

async fn new_promise(interp: &Interpreter<'_>, args: Vec<Value>) -> EvalResult {
    let executor = arg(&args, 0);
    if !matches!(executor, Value::Function(_)) {
        return Err(interp.type_error(format!(
            "Promise resolver {} is not a function",
            executor.to_display_string()
        )));
    }
    let promise = Promise::deferred();
    let resolve = method(Value::Promise(promise.clone()), "resolve");
    let reject = method(Value::Promise(promise.clone()), "reject");
    match interp.call_value(&executor, vec![resolve, reject]).await {
        Ok(_) => {}
        Err(Abrupt::Throw(reason)) => promise.complete(Err(reason)).await,
        Err(other) => return Err(other),
    }
    Ok(Value::Promise(promise))
}

async fn settle_item(item: Value) -> Result<Value, Value> {
    match item {
        Value::Promise(promise) => promise.settle().await,
        other => Ok(other),
    }
}

fn promise_combinator(interp: &Interpreter<'_>, name: &str, args: &[Value]) -> EvalResult {
    let items = interp.iterate(&arg(args, 0))?;
    let heap = interp.heap().clone();
    let settlement: Settlement = match name {
        "Promise.all" => async move {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(settle_item(item).await?);
            }
            Ok(heap.array(values))
        }
        .boxed(),
        "Promise.allSettled" => async move {
            let mut outcomes = Vec::with_capacity(items.len());
            for item in items {
                let fields = match settle_item(item).await {
                    Ok(value) => IndexMap::from([
                        ("status".to_string(), Value::string("fulfilled")),
                        ("value".to_string(), value),
                    ]),
                    Err(reason) => IndexMap::from([
                        ("status".to_string(), Value::string("rejected")),
                        ("reason".to_string(), reason),
                    ]),
                };
                outcomes.push(heap.object(fields));
            }
            Ok(heap.array(outcomes))
        }
        .boxed(),
        _ => {
            if items.is_empty() {
                return Ok(Value::Promise(Promise::deferred()));
            }
            let racers: Vec<_> = items.into_iter().map(|item| settle_item(item).boxed()).collect();
            async move { future::select_all(racers).await.0 }.boxed()
        }
    };
    Ok(Value::Promise(Promise::pending(settlement)))
}

async fn promise_method(
    interp: &Interpreter<'_>,
    promise: &Arc<Promise>,
    name: &str,
    args: Vec<Value>,
) -> EvalResult {
    match name {
        "resolve" => {
            promise.complete(Ok(arg(&args, 0))).await;
            Ok(Value::Undefined)
        }
        "reject" => {
            promise.complete(Err(arg(&args, 0))).await;
            Ok(Value::Undefined)
        }
        "then" => chain(interp, promise, arg(&args, 0), arg(&args, 1)).await,
        "catch" => chain(interp, promise, Value::Undefined, arg(&args, 0)).await,
        _ => {
            let outcome = promise.settle().await;
            let callback = arg(&args, 0);
            if matches!(callback, Value::Function(_)) {
                match interp.call_value(&callback, Vec::new()).await {
                    Ok(_) => {}
                    Err(Abrupt::Throw(reason)) => {
                        return Ok(Value::Promise(Promise::rejected(reason)))
                    }
                    Err(other) => return Err(other),
                }
            }
            Ok(Value::Promise(settled(outcome)))
        }
    }
}

fn settled(outcome: Result<Value, Value>) -> Arc<Promise> {
    match outcome {
        Ok(value) => Promise::resolved(value),
        Err(reason) => Promise::rejected(reason),
    }
}

/// `then`/`catch`: waits for the receiver, then runs the matching handler
async fn chain(
    interp: &Interpreter<'_>,
    promise: &Arc<Promise>,
    on_fulfilled: Value,
    on_rejected: Value,
) -> EvalResult {
    let outcome = promise.settle().await;
    let (handler, input) = match &outcome {
        Ok(value) => (on_fulfilled, value.clone()),
        Err(reason) => (on_rejected, reason.clone()),
    };
    if !matches!(handler, Value::Function(_)) {
        return Ok(Value::Promise(settled(outcome)));
    }
    match interp.call_value(&handler, vec![input]).await {
        Ok(value) => Ok(Value::Promise(Promise::resolve_value(value))),
        Err(Abrupt::Throw(reason)) => Ok(Value::Promise(Promise::rejected(reason))),
        Err(other) => Err(other),
    }
}

// =============================================================================
// Methods
// =============================================================================

pub(crate) fn call_method<'a>(
    interp: &'a Interpreter<'_>,
    receiver: &'a Value,
    name: &'static str,
    args: Vec<Value>,
) -> BoxFuture<'a, EvalResult> {
    async move {
        match receiver {
            Value::Array(items) => array_method(interp, receiver, items, name, args).await,
            Value::String(text) => string_method(interp, text, name, args).await,
            Value::Number(n) => number_method(interp, *n, name, &args),
            Value::Bool(b) => Ok(match name {
                "valueOf" => Value::Bool(*b),
                _ => Value::string(b.to_string()),
            }),
            Value::Object(fields) | Value::Error(fields) => {
                Ok(object_method(receiver, fields, name, &args))
            }
            Value::Promise(promise) => promise_method(interp, promise, name, args).await,
            _ => Err(interp.type_error(format!("{} is not a function", name))),
        }
    }
    .boxed()
}

fn object_method(receiver: &Value, fields: &ObjectRef, name: &str, args: &[Value]) -> Value {
    match name {
        "hasOwnProperty" => {
            let key = arg(args, 0).to_property_key();
            Value::Bool(fields.read().contains_key(&key))
        }
        _ => Value::string(receiver.to_display_string()),
    }
}

async fn array_method(
    interp: &Interpreter<'_>,
    receiver: &Value,
    items: &ArrayRef,
    name: &str,
    args: Vec<Value>,
) -> EvalResult {
    match name {
        "forEach" | "map" | "filter" | "find" | "findIndex" | "findLast" | "findLastIndex"
        | "some" | "every" | "flatMap" => array_iteration(interp, receiver, items, name, args).await,
        "reduce" | "reduceRight" => {
            array_reduce(interp, receiver, items, name == "reduceRight", args).await
        }
        "sort" => {
            let comparator = arg(&args, 0);
            if !matches!(comparator, Value::Undefined | Value::Function(_)) {
                return Err(interp.type_error(
                    "The comparison function must be either a function or undefined",
                ));
            }
            let snapshot = items.read().clone();
            let sorted = sort_values(interp, snapshot, &comparator).await?;
            *items.write() = sorted;
            Ok(receiver.clone())
        }
        _ => array_simple(interp, receiver, items, name, args),
    }
}

fn array_simple(
    interp: &Interpreter<'_>,
    receiver: &Value,
    items: &ArrayRef,
    name: &str,
    args: Vec<Value>,
) -> EvalResult {
    let heap = interp.heap();
    match name {
        "push" | "unshift" => {
            let mut guard = items.write();
            if guard.len() + args.len() > MAX_ARRAY_LENGTH {
                return Err(interp.throw("RangeError", "Invalid array length"));
            }
            if name == "push" {
                guard.extend(args);
            } else {
                let mut combined = args;
                combined.extend(guard.drain(..));
                *guard = combined;
            }
            Ok(Value::Number(guard.len() as f64))
        }
        "pop" => Ok(items.write().pop().unwrap_or_default()),
        "shift" => {
            let mut guard = items.write();
            Ok(if guard.is_empty() {
                Value::Undefined
            } else {
                guard.remove(0)
            })
        }
        "slice" => {
            let snapshot = items.read().clone();
            let len = snapshot.len();
            let start = relative_index(&arg(&args, 0), len, 0);
            let end = relative_index(&arg(&args, 1), len, len);
            let slice = snapshot.get(start..end).unwrap_or_default().to_vec();
            Ok(heap.array(slice))
        }
        "splice" => {
            let removed: Vec<Value> = {
                let mut guard = items.write();
                let len = guard.len();
                let start = relative_index(&arg(&args, 0), len, 0);
                let delete_count = match args.len() {
                    0 => 0,
                    1 => len - start,
                    _ => (args[1].to_integer().max(0.0) as usize).min(len - start),
                };
                let inserted: Vec<Value> = args.into_iter().skip(2).collect();
                guard.splice(start..start + delete_count, inserted).collect()
            };
            Ok(heap.array(removed))
        }
        "concat" => {
            let added: usize = args
                .iter()
                .map(|value| match value {
                    Value::Array(other) => other.read().len(),
                    _ => 1,
                })
                .sum();
            if items.read().len() + added > MAX_ARRAY_LENGTH {
                return Err(interp.throw("RangeError", "Invalid array length"));
            }
            let mut out = items.read().clone();
            for value in args {
                match value {
                    Value::Array(other) => out.extend(other.read().iter().cloned()),
                    other => out.push(other),
                }
            }
            Ok(heap.array(out))
        }
        "join" | "toString" => {
            let separator = match arg(&args, 0) {
                Value::Undefined => ",".to_string(),
                other if name == "join" => other.to_display_string(),
                _ => ",".to_string(),
            };
            Ok(Value::string(join(interp, items, &separator)?))
        }
        "reverse" => {
            items.write().reverse();
            Ok(receiver.clone())
        }
        "indexOf" | "includes" => {
            let target = arg(&args, 0);
            let snapshot = items.read().clone();
            let from = relative_index(&arg(&args, 1), snapshot.len(), 0);
            let position = snapshot.iter().skip(from).position(|item| {
                item.strict_equals(&target) || (name == "includes" && both_nan(item, &target))
            });
            Ok(match (name, position) {
                ("includes", found) => Value::Bool(found.is_some()),
                (_, Some(index)) => Value::Number((from + index) as f64),
                (_, None) => Value::Number(-1.0),
            })
        }
        "lastIndexOf" => {
            let target = arg(&args, 0);
            let snapshot = items.read().clone();
            let position = snapshot.iter().rposition(|item| item.strict_equals(&target));
            Ok(Value::Number(position.map_or(-1.0, |index| index as f64)))
        }
        "fill" => {
            let value = arg(&args, 0);
            let mut guard = items.write();
            let len = guard.len();
            let start = relative_index(&arg(&args, 1), len, 0);
            let end = relative_index(&arg(&args, 2), len, len);
            if start < end {
                for slot in &mut guard[start..end] {
                    *slot = value.clone();
                }
            }
            drop(guard);
            Ok(receiver.clone())
        }
        "at" => {
            let guard = items.read();
            let index = arg(&args, 0).to_integer();
            let index = if index < 0.0 {
                guard.len() as f64 + index
            } else {
                index
            };
            Ok(if index < 0.0 {
                Value::Undefined
            } else {
                guard.get(index as usize).cloned().unwrap_or_default()
            })
        }
        "flat" => {
            let depth = match arg(&args, 0) {
                Value::Undefined => 1.0,
                other => other.to_integer(),
            };
            let snapshot = items.read().clone();
            let mut out = Vec::new();
            let mut budget = MAX_ARRAY_LENGTH;
            flatten_into(interp, &mut out, &snapshot, depth.min(MAX_FLAT_DEPTH), &mut budget)?;
            Ok(heap.array(out))
        }
        "keys" => {
            let len = items.read().len();
            Ok(heap.array((0..len).map(|i| Value::Number(i as f64)).collect()))
        }
        "values" => Ok(heap.array(items.read().clone())),
        "entries" => {
            let snapshot = items.read().clone();
            let entries = snapshot
                .into_iter()
                .enumerate()
                .map(|(index, item)| heap.array(vec![Value::Number(index as f64), item]))
                .collect();
            Ok(heap.array(entries))
        }
        other => Err(interp.type_error(format!("{} is not a function", other))),
    }
}

fn both_nan(a: &Value, b: &Value) -> bool {
    matches!((a, b), (Value::Number(x), Value::Number(y)) if x.is_nan() && y.is_nan())
}

fn join(interp: &Interpreter<'_>, items: &ArrayRef, separator: &str) -> EvalResult<String> {
    let snapshot = items.read().clone();
    let separator_length = separator.chars().count();
    let mut out = String::new();
    let mut length = 0;
    for (index, item) in snapshot.iter().enumerate() {
        let text = match item {
            Value::Undefined | Value::Null => String::new(),
            other => other.to_display_string(),
        };
        if index > 0 {
            length += separator_length;
        }
        length += text.chars().count();
        if length > MAX_STRING_LENGTH {
            return Err(interp.invalid_string_length());
        }
        if index > 0 {
            out.push_str(separator);
        }
        out.push_str(&text);
    }
    Ok(out)
}

fn flatten_into(
    interp: &Interpreter<'_>,
    out: &mut Vec<Value>,
    items: &[Value],
    depth: f64,
    budget: &mut usize,
) -> EvalResult<()> {
    for item in items {
        if *budget == 0 {
            return Err(interp.throw("RangeError", "Invalid array length"));
        }
        *budget -= 1;
        match item {
            Value::Array(inner) if depth >= 1.0 => {
                let inner = inner.read().clone();
                flatten_into(interp, out, &inner, depth - 1.0, budget)?;
            }
            other => out.push(other.clone()),
        }
    }
    Ok(())
}

async fn array_iteration(
    interp: &Interpreter<'_>,
    receiver: &Value,
    items: &ArrayRef,
    name: &str,
    args: Vec<Value>,
) -> EvalResult {
    let callback = callback_arg(interp, &args, 0)?;
    let snapshot = items.read().clone();
    let mut indexed: Vec<(usize, Value)> = snapshot.into_iter().enumerate().collect();
    if matches!(name, "findLast" | "findLastIndex") {
        indexed.reverse();
    }

    let mut collected = Vec::new();
    for (index, item) in indexed {
        let result = interp
            .call_value(
                &callback,
                vec![item.clone(), Value::Number(index as f64), receiver.clone()],
            )
            .await?;
        match name {
            "map" => collected.push(result),
            "filter" if result.truthy() => collected.push(item),
            "find" | "findLast" if result.truthy() => return Ok(item),
            "findIndex" | "findLastIndex" if result.truthy() => {
                return Ok(Value::Number(index as f64))
            }
            "some" if result.truthy() => return Ok(Value::Bool(true)),
            "every" if !result.truthy() => return Ok(Value::Bool(false)),
            "flatMap" => match result {
                Value::Array(inner) => collected.extend(inner.read().iter().cloned()),
                other => collected.push(other),
            },
            _ => {}
        }
    }

    Ok(match name {
        "map" | "filter" | "flatMap" => interp.heap().array(collected),
        "findIndex" | "findLastIndex" => Value::Number(-1.0),
        "some" => Value::Bool(false),
        "every" => Value::Bool(true),
        _ => Value::Undefined,
    })
}

async fn array_reduce(
    interp: &Interpreter<'_>,
    receiver: &Value,
    items: &ArrayRef,
    from_right: bool,
    args: Vec<Value>,
) -> EvalResult {
    let callback = callback_arg(interp, &args, 0)?;
    let snapshot = items.read().clone();
    let mut indexed: Vec<(usize, Value)> = snapshot.into_iter().enumerate().collect();
    if from_right {
        indexed.reverse();
    }
    let mut remaining = indexed.into_iter();
    let mut accumulator = match args.get(1) {
        Some(initial) => initial.clone(),
        None => match remaining.next() {
            Some((_, first)) => first,
            None => {
                return Err(interp.type_error("Reduce of empty array with no initial value"))
            }
        },
    };
    for (index, item) in remaining {
        accumulator = interp
            .call_value(
                &callback,
                vec![accumulator, item, Value::Number(index as f64), receiver.clone()],
            )
            .await?;
    }
    Ok(accumulator)
}

/// Stable bottom-up merge sort; `undefined` elements always sort last
async fn sort_values(
    interp: &Interpreter<'_>,
    items: Vec<Value>,
    comparator: &Value,
) -> EvalResult<Vec<Value>> {
    let (mut sorted, undefined): (Vec<Value>, Vec<Value>) = items
        .into_iter()
        .partition(|item| !matches!(item, Value::Undefined));
    let len = sorted.len();
    let mut width = 1;
    while width < len {
        let mut merged = Vec::with_capacity(len);
        let mut start = 0;
        while start < len {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);
            let (mut left, mut right) = (start, mid);
            while left < mid && right < end {
                if sort_compare(interp, &sorted[left], &sorted[right], comparator).await? > 0.0 {
                    merged.push(sorted[right].clone());
                    right += 1;
                } else {
                    merged.push(sorted[left].clone());
                    left += 1;
                }
            }
            merged.extend_from_slice(&sorted[left..mid]);
            merged.extend_from_slice(&sorted[right..end]);
            start = end;
        }
        sorted = merged;
        width *= 2;
    }
    sorted.extend(undefined);
    Ok(sorted)
}

async fn sort_compare(
    interp: &Interpreter<'_>,
    a: &Value,
    b: &Value,
    comparator: &Value,
) -> EvalResult<f64> {
    if matches!(comparator, Value::Undefined) {
        let ordering = a.to_display_string().cmp(&b.to_display_string());
        return Ok(ordering as i8 as f64);
    }
    let result = interp
        .call_value(comparator, vec![a.clone(), b.clone()])
        .await?
        .to_number();
    Ok(if result.is_nan() { 0.0 } else { result })
}

async fn string_method(
    interp: &Interpreter<'_>,
    text: &Arc<str>,
    name: &str,
    args: Vec<Value>,
) -> EvalResult {
    if matches!(name, "replace" | "replaceAll") && matches!(arg(&args, 1), Value::Function(_)) {
        return replace_with(interp, text, name == "replaceAll", &args).await;
    }
    string_simple(interp, text, name, &args)
}

fn find_chars(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| haystack[i..].starts_with(needle))
}

fn rfind_chars(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    let last = from.min(haystack.len() - needle.len());
    (0..=last).rev().find(|&i| haystack[i..].starts_with(needle))
}

fn string_simple(interp: &Interpreter<'_>, text: &Arc<str>, name: &str, args: &[Value]) -> EvalResult {
    let chars = || text.chars().collect::<Vec<char>>();
    let search = || arg(args, 0).to_display_string().chars().collect::<Vec<char>>();
    let string = |s: String| Ok(Value::string(s));

    match name {
        "toUpperCase" => string(text.to_uppercase()),
        "toLowerCase" => string(text.to_lowercase()),
        "trim" => string(text.trim().to_string()),
        "trimStart" => string(text.trim_start().to_string()),
        "trimEnd" => string(text.trim_end().to_string()),
        "toString" | "valueOf" => Ok(Value::String(text.clone())),
        "split" => {
            let limit = match arg(args, 1) {
                Value::Undefined => usize::MAX,
                other => other.to_integer().max(0.0) as usize,
            };
            let parts: Vec<Value> = match arg(args, 0) {
                Value::Undefined => vec![Value::String(text.clone())],
                separator => {
                    let separator = separator.to_display_string();
                    if separator.is_empty() {
                        text.chars()
                            .take(limit)
                            .map(|c| Value::string(c.to_string()))
                            .collect()
                    } else {
                        text.split(separator.as_str())
                            .take(limit)
                            .map(Value::string)
                            .collect()
                    }
                }
            };
            Ok(interp.heap().array(parts))
        }
        "slice" => {
            let chars = chars();
            let start = relative_index(&arg(args, 0), chars.len(), 0);
            let end = relative_index(&arg(args, 1), chars.len(), chars.len());
            string(chars.get(start..end).unwrap_or_default().iter().collect())
        }
        "substring" => {
            let chars = chars();
            let clamp = |value: Value, default: usize| match value {
                Value::Undefined => default,
                other => other.to_integer().clamp(0.0, chars.len() as f64) as usize,
            };
            let start = clamp(arg(args, 0), 0);
            let end = clamp(arg(args, 1), chars.len());
            let (start, end) = if start > end { (end, start) } else { (start, end) };
            string(chars[start..end].iter().collect())
        }
        "substr" => {
            let chars = chars();
            let start = relative_index(&arg(args, 0), chars.len(), 0);
            let length = match arg(args, 1) {
                Value::Undefined => chars.len() - start,
                other => other.to_integer().max(0.0) as usize,
            };
            let end = start.saturating_add(length).min(chars.len());
            string(chars[start..end].iter().collect())
        }
        "indexOf" | "includes" => {
            let chars = chars();
            let from = arg(args, 1).to_integer().clamp(0.0, chars.len() as f64) as usize;
            let found = find_chars(&chars, &search(), from);
            Ok(if name == "includes" {
                Value::Bool(found.is_some())
            } else {
                Value::Number(found.map_or(-1.0, |i| i as f64))
            })
        }
        "lastIndexOf" => {
            let chars = chars();
            let from = match arg(args, 1) {
                Value::Undefined => chars.len(),
                other => other.to_integer().max(0.0) as usize,
            };
            let found = rfind_chars(&chars, &search(), from);
            Ok(Value::Number(found.map_or(-1.0, |i| i as f64)))
        }
        "startsWith" => {
            let chars = chars();
            let position = relative_index(&arg(args, 1), chars.len(), 0);
            Ok(Value::Bool(chars[position..].starts_with(&search())))
        }
        "endsWith" => {
            let chars = chars();
            let end = relative_index(&arg(args, 1), chars.len(), chars.len());
            Ok(Value::Bool(chars[..end].ends_with(&search())))
        }
        "replace" | "replaceAll" => {
            let pattern = arg(args, 0).to_display_string();
            let replacement = arg(args, 1).to_display_string();
            let count = if name == "replaceAll" {
                text.matches(pattern.as_str()).count()
            } else {
                usize::from(text.contains(pattern.as_str()))
            };
            let length = (text.chars().count() + count * replacement.chars().count())
                .saturating_sub(count * pattern.chars().count());
            if length > MAX_STRING_LENGTH {
                return Err(interp.invalid_string_length());
            }
            string(if name == "replaceAll" {
                text.replace(pattern.as_str(), &replacement)
            } else {
                text.replacen(pattern.as_str(), &replacement, 1)
            })
        }
        "repeat" => {
            let count = arg(args, 0).to_integer();
            if count < 0.0 || count.is_infinite() {
                return Err(interp.throw(
                    "RangeError",
                    format!("Invalid count value: {}", format_number(count)),
                ));
            }
            let length = text.chars().count() as f64 * count;
            if length > MAX_STRING_LENGTH as f64 {
                return Err(interp.invalid_string_length());
            }
            string(text.repeat(count as usize))
        }
        "padStart" | "padEnd" => {
            let target = arg(args, 0).to_integer();
            if target > MAX_STRING_LENGTH as f64 {
                return Err(interp.invalid_string_length());
            }
            let filler: Vec<char> = match arg(args, 1) {
                Value::Undefined => vec![' '],
                other => other.to_display_string().chars().collect(),
            };
            let current = text.chars().count();
            let target = target.max(0.0) as usize;
            if target <= current || filler.is_empty() {
                return Ok(Value::String(text.clone()));
            }
            let padding: String = filler.iter().cycle().take(target - current).collect();
            string(if name == "padStart" {
                format!("{}{}", padding, text)
            } else {
                format!("{}{}", text, padding)
            })
        }
        "charAt" => {
            let index = arg(args, 0).to_integer();
            let found = (index >= 0.0)
                .then(|| text.chars().nth(index as usize))
                .flatten();
            string(found.map(String::from).unwrap_or_default())
        }
        "charCodeAt" | "codePointAt" => {
            let index = arg(args, 0).to_integer();
            let found = (index >= 0.0)
                .then(|| text.chars().nth(index as usize))
                .flatten();
            Ok(match (name, found) {
                (_, Some(c)) => Value::Number(c as u32 as f64),
                ("codePointAt", None) => Value::Undefined,
                _ => Value::Number(f64::NAN),
            })
        }
        "at" => {
            let chars = chars();
            let index = arg(args, 0).to_integer();
            let index = if index < 0.0 {
                chars.len() as f64 + index
            } else {
                index
            };
            Ok(if index < 0.0 {
                Value::Undefined
            } else {
                chars
                    .get(index as usize)
                    .map(|c| Value::string(c.to_string()))
                    .unwrap_or_default()
            })
        }
        "concat" => {
            let mut out = text.to_string();
            for value in args {
                let part = value.to_display_string();
                if !fits_string_limit(&[&out, &part]) {
                    return Err(interp.invalid_string_length());
                }
                out.push_str(&part);
            }
            string(out)
        }
        "localeCompare" => {
            let other = arg(args, 0).to_display_string();
            Ok(Value::Number(text.as_ref().cmp(other.as_str()) as i8 as f64))
        }
        other => Err(interp.type_error(format!("{} is not a function", other))),
    }
}

/// `replace`/`replaceAll` with a function computing each replacement
async fn replace_with(
    interp: &Interpreter<'_>,
    text: &Arc<str>,
    all: bool,
    args: &[Value],
) -> EvalResult {
    let pattern = arg(args, 0).to_display_string();
    let replacer = arg(args, 1);
    let mut matches: Vec<usize> = text.match_indices(pattern.as_str()).map(|(at, _)| at).collect();
    if !all {
        matches.truncate(1);
    }
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for at in matches {
        out.push_str(&text[cursor..at]);
        let offset = text[..at].chars().count();
        let replacement = interp
            .call_value(
                &replacer,
                vec![
                    Value::string(&pattern),
                    Value::Number(offset as f64),
                    Value::String(text.clone()),
                ],
            )
            .await?;
        let replacement = replacement.to_display_string();
        if !fits_string_limit(&[&out, &replacement, &text[at..]]) {
            return Err(interp.invalid_string_length());
        }
        out.push_str(&replacement);
        cursor = at + pattern.len();
    }
    out.push_str(&text[cursor..]);
    Ok(Value::string(out))
}

fn number_method(interp: &Interpreter<'_>, n: f64, name: &str, args: &[Value]) -> EvalResult {
    match name {
        "toFixed" => {
            let digits = arg(args, 0).to_integer();
            if !(0.0..=100.0).contains(&digits) {
                return Err(interp.throw(
                    "RangeError",
                    "toFixed() digits argument must be between 0 and 100",
                ));
            }
            Ok(Value::string(to_fixed(n, digits as usize)))
        }
        "toString" => match arg(args, 0) {
            Value::Undefined => Ok(Value::string(format_number(n))),
            radix => {
                let radix = radix.to_integer();
                if !(2.0..=36.0).contains(&radix) {
                    return Err(interp.throw(
                        "RangeError",
                        "toString() radix must be between 2 and 36",
                    ));
                }
                Ok(Value::string(to_radix(n, radix as u32)))
            }
        },
        "toLocaleString" => Ok(Value::string(to_locale_string(n))),
        _ => Ok(Value::Number(n)),
    }
}

/// Fixed-point notation, rounding halves away from zero
pub(crate) fn to_fixed(n: f64, digits: usize) -> String {
    if !n.is_finite() {
        return format_number(n);
    }
    let scaled = (n.abs() * 10f64.powi(digits as i32)).round();
    if scaled >= 1e21 {
        return format!("{:.*}", digits, n);
    }
    let mut text = (scaled as u128).to_string();
    if digits > 0 {
        if text.len() <= digits {
            text = format!("{}{}", "0".repeat(digits + 1 - text.len()), text);
        }
        text.insert(text.len() - digits, '.');
    }
    if n < 0.0 {
        text.insert(0, '-');
    }
    text
}

fn to_radix(n: f64, radix: u32) -> String {
    if radix == 10 || !n.is_finite() || n.fract() != 0.0 {
        return format_number(n);
    }
    let mut value = n.abs();
    if value == 0.0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value >= 1.0 {
        let digit = (value % radix as f64) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('0'));
        value = (value / radix as f64).floor();
    }
    if n < 0.0 {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

/// `en-US` grouping with at most three fraction digits
pub(crate) fn to_locale_string(n: f64) -> String {
    if !n.is_finite() {
        return format_number(n);
    }
    let rounded = (n.abs() * 1000.0).round() / 1000.0;
    let integer = rounded.trunc();
    let digits = format!("{:.0}", integer);
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let fraction = format!("{:.3}", rounded - integer);
    let fraction = fraction
        .split_once('.')
        .map(|(_, f)| f.trim_end_matches('0'))
        .unwrap_or_default();
    let sign = if n < 0.0 && rounded != 0.0 { "-" } else { "" };
    if fraction.is_empty() {
        format!("{}{}", sign, grouped)
    } else {
        format!("{}{}.{}", sign, grouped, fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("42", 42.0; "plain")]
    #[test_case("  -17px", -17.0; "leading space and suffix")]
    #[test_case("0x1F", 31.0; "hex prefix")]
    #[test_case("3.9", 3.0; "stops at dot")]
    fn test_parse_int(text: &str, expected: f64) {
        assert_eq!(parse_int(text, &Value::Undefined), expected);
    }

    #[test]
    fn test_parse_int_radix_and_failures() {
        assert_eq!(parse_int("ff", &Value::Number(16.0)), 255.0);
        assert_eq!(parse_int("101", &Value::Number(2.0)), 5.0);
        assert!(parse_int("abc", &Value::Undefined).is_nan());
        assert!(parse_int("10", &Value::Number(1.0)).is_nan());
    }

    #[test_case("3.14abc", 3.14; "suffix ignored")]
    #[test_case("  .5", 0.5; "leading dot")]
    #[test_case("1e3", 1000.0; "exponent")]
    #[test_case("2e", 2.0; "dangling exponent")]
    #[test_case("-Infinity", f64::NEG_INFINITY; "infinity")]
    fn test_parse_float(text: &str, expected: f64) {
        assert_eq!(parse_float(text), expected);
    }

    #[test]
    fn test_parse_float_rejects_non_numbers() {
        assert!(parse_float("abc").is_nan());
        assert!(parse_float("-").is_nan());
    }

    #[test_case(3.14159, 2, "3.14")]
    #[test_case(2.5, 0, "3")]
    #[test_case(0.004, 2, "0.00")]
    #[test_case(-1.5, 1, "-1.5")]
    #[test_case(10.0, 3, "10.000")]
    fn test_to_fixed(n: f64, digits: usize, expected: &str) {
        assert_eq!(to_fixed(n, digits), expected);
    }

    #[test_case(1234567.891, "1,234,567.891")]
    #[test_case(1000.0, "1,000")]
    #[test_case(-42.5, "-42.5")]
    #[test_case(0.1234, "0.123")]
    fn test_to_locale_string(n: f64, expected: &str) {
        assert_eq!(to_locale_string(n), expected);
    }

    #[test]
    fn test_to_radix() {
        assert_eq!(to_radix(255.0, 16), "ff");
        assert_eq!(to_radix(-5.0, 2), "-101");
        assert_eq!(to_radix(0.0, 8), "0");
    }

    #[test]
    fn test_math() {
        assert_eq!(math("round", &[Value::Number(2.5)]), 3.0);
        assert_eq!(math("round", &[Value::Number(-2.5)]), -2.0);
        assert_eq!(math("max", &[Value::Number(1.0), Value::Number(7.0)]), 7.0);
        assert_eq!(math("min", &[]), f64::INFINITY);
        assert!(math("max", &[Value::Number(1.0), Value::Number(f64::NAN)]).is_nan());
        assert_eq!(math("hypot", &[Value::Number(3.0), Value::Number(4.0)]), 5.0);
    }

    #[test]
    fn test_char_search() {
        let hay: Vec<char> = "héllo héllo".chars().collect();
        let needle: Vec<char> = "llo".chars().collect();
        assert_eq!(find_chars(&hay, &needle, 0), Some(2));
        assert_eq!(find_chars(&hay, &needle, 3), Some(8));
        assert_eq!(rfind_chars(&hay, &needle, hay.len()), Some(8));
        assert_eq!(find_chars(&hay, &[], 4), Some(4));
    }

    #[test]
    fn test_native_statics() {
        assert!(matches!(
            native_static("Object", "keys"),
            Some(Value::Function(_))
        ));
        assert!(matches!(
            native_static("Number", "MAX_SAFE_INTEGER"),
            Some(Value::Number(n)) if n == 9_007_199_254_740_991.0
        ));
        assert!(native_static("Math", "keys").is_none());
    }

    #[test]
    fn test_bound_methods_by_receiver() {
        let text = Value::string("abc");
        assert!(bound_method(&text, "toUpperCase").is_some());
        assert!(bound_method(&text, "push").is_none());
        assert!(bound_method(&Value::Null, "toString").is_none());
    }
}
