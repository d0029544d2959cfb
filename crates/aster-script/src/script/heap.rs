//! Per-execution allocation tracking
//!
//! Script values are reference counted, so closures stored in the scopes
//! they capture form cycles. The heap remembers every container and scope an
//! execution creates and empties them when the execution ends.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;

use super::scope::{Scope, WeakScope};
use super::value::{ObjectRef, Value};

/// Tracked entries are pruned of dead references when the list reaches this size
const MIN_PRUNE_THRESHOLD: usize = 1024;

enum Tracked {
    Array(Weak<RwLock<Vec<Value>>>),
    Object(Weak<RwLock<IndexMap<String, Value>>>),
    Scope(WeakScope),
}

impl Tracked {
    fn is_live(&self) -> bool {
        match self {
            Tracked::Array(weak) => weak.strong_count() > 0,
            Tracked::Object(weak) => weak.strong_count() > 0,
            Tracked::Scope(weak) => weak.is_live(),
        }
    }
}

struct Registry {
    entries: Vec<Tracked>,
    prune_at: usize,
}

pub struct Heap {
    registry: Mutex<Registry>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                entries: Vec::new(),
                prune_at: MIN_PRUNE_THRESHOLD,
            }),
        }
    }

    fn track(&self, entry: Tracked) {
        let mut registry = self.registry.lock();
        if registry.entries.len() >= registry.prune_at {
            registry.entries.retain(Tracked::is_live);
            registry.prune_at = (registry.entries.len() * 2).max(MIN_PRUNE_THRESHOLD);
        }
        registry.entries.push(entry);
    }

    pub fn array(&self, items: Vec<Value>) -> Value {
        let array = Arc::new(RwLock::new(items));
        self.track(Tracked::Array(Arc::downgrade(&array)));
        Value::Array(array)
    }

    fn object_ref(&self, fields: IndexMap<String, Value>) -> ObjectRef {
        let object = Arc::new(RwLock::new(fields));
        self.track(Tracked::Object(Arc::downgrade(&object)));
        object
    }

    pub fn object(&self, fields: IndexMap<String, Value>) -> Value {
        Value::Object(self.object_ref(fields))
    }

    /// Error instance with the given constructor name and message
    pub fn error(&self, name: &str, message: impl Into<String>) -> Value {
        let mut fields = IndexMap::new();
        fields.insert("name".to_string(), Value::string(name));
        fields.insert("message".to_string(), Value::string(message.into()));
        Value::Error(self.object_ref(fields))
    }

    pub fn scope(&self, parent: &Scope) -> Scope {
        let scope = parent.child();
        self.track(Tracked::Scope(scope.downgrade()));
        scope
    }

    /// Register a scope created outside the heap, such as the global scope
    pub fn adopt_scope(&self, scope: &Scope) {
        self.track(Tracked::Scope(scope.downgrade()));
    }

    /// Convert host JSON into script values
    pub fn import_json(&self, json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(s) => Value::string(s),
            JsonValue::Array(items) => {
                self.array(items.iter().map(|item| self.import_json(item)).collect())
            }
            JsonValue::Object(fields) => self.object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), self.import_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn tracked_len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    /// Empty every tracked container and scope, breaking reference cycles
    pub fn release(&self) {
        let entries = std::mem::take(&mut self.registry.lock().entries);

        // Hold every container strongly while clearing so that dropping contents
        // never cascades into a deep recursive drop.
        let mut arrays = Vec::new();
        let mut objects = Vec::new();
        let mut scopes = Vec::new();
        for entry in entries {
            match entry {
                Tracked::Array(weak) => arrays.extend(weak.upgrade()),
                Tracked::Object(weak) => objects.extend(weak.upgrade()),
                Tracked::Scope(weak) => scopes.push(weak),
            }
        }

        let mut garbage: Vec<Value> = Vec::new();
        for scope in &scopes {
            garbage.extend(scope.clear());
        }
        for array in &arrays {
            garbage.append(&mut array.write());
        }
        for object in &objects {
            garbage.extend(object.write().drain(..).map(|(_, value)| value));
        }
        drop(garbage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_import_json_preserves_structure() {
        let heap = Heap::new();
        let value = heap.import_json(&json!({"b": [1, "two", null], "a": {"c": true}}));
        assert_eq!(
            value.to_json().unwrap(),
            Some(json!({"b": [1, "two", null], "a": {"c": true}}))
        );
        assert_eq!(heap.tracked_len(), 3);
    }

    #[test]
    fn test_release_breaks_cycles() {
        let heap = Heap::new();
        let list = heap.array(Vec::new());
        let Value::Array(inner) = &list else {
            unreachable!()
        };
        inner.write().push(list.clone());
        let weak = Arc::downgrade(inner);
        drop(list);
        assert!(weak.upgrade().is_some());
        heap.release();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_release_handles_deep_nesting() {
        let heap = Heap::new();
        let mut value = heap.array(Vec::new());
        for _ in 0..100_000 {
            value = heap.array(vec![value]);
        }
        heap.release();
        drop(value);
    }

    #[test]
    fn test_dead_entries_are_pruned() {
        let heap = Heap::new();
        for _ in 0..5000 {
            let _ = heap.array(Vec::new());
        }
        assert!(heap.tracked_len() < 2048);
    }

    #[test]
    fn test_error_value() {
        let heap = Heap::new();
        let err = heap.error("RangeError", "too big");
        assert_eq!(err.describe_thrown(), "RangeError: too big");
    }
}
