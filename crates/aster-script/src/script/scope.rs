//! Lexical scopes
//!
//! A scope chain of variable bindings. Closures hold a [`Scope`] handle,
//! so scopes are reference counted and interior mutable.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::value::Value;

#[derive(Debug, Clone)]
struct Binding {
    value: Value,
    mutable: bool,
}

#[derive(Debug, Default)]
struct ScopeInner {
    vars: RwLock<HashMap<String, Binding>>,
    parent: Option<Scope>,
}

#[derive(Debug, Clone, Default)]
pub struct Scope(Arc<ScopeInner>);

/// Non-owning handle used to clear a scope once an execution ends
#[derive(Debug, Clone)]
pub struct WeakScope(Weak<ScopeInner>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignError {
    Undeclared,
    Constant,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Scope(Arc::new(ScopeInner {
            vars: RwLock::new(HashMap::new()),
            parent: Some(self.clone()),
        }))
    }

    /// Bind `name` in this scope, replacing an earlier binding of the same name
    pub fn declare(&self, name: &str, value: Value, mutable: bool) {
        self.0
            .vars
            .write()
            .insert(name.to_string(), Binding { value, mutable });
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.0.vars.read().contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(binding) = scope.0.vars.read().get(name) {
                return Some(binding.value.clone());
            }
            current = scope.0.parent.as_ref();
        }
        None
    }

    /// Update the nearest binding of `name`
    pub fn assign(&self, name: &str, value: Value) -> Result<(), AssignError> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(binding) = scope.0.vars.write().get_mut(name) {
                if !binding.mutable {
                    return Err(AssignError::Constant);
                }
                binding.value = value;
                return Ok(());
            }
            current = scope.0.parent.as_ref();
        }
        Err(AssignError::Undeclared)
    }

    pub fn downgrade(&self) -> WeakScope {
        WeakScope(Arc::downgrade(&self.0))
    }
}

impl WeakScope {
    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }

    /// Drop every binding, returning them so the caller controls when they are freed
    pub fn clear(&self) -> Vec<Value> {
        match self.0.upgrade() {
            Some(inner) => inner
                .vars
                .write()
                .drain()
                .map(|(_, binding)| binding.value)
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_parents() {
        let global = Scope::new();
        global.declare("x", Value::Number(1.0), true);
        let inner = global.child().child();
        assert!(matches!(inner.lookup("x"), Some(Value::Number(n)) if n == 1.0));
        assert!(inner.lookup("y").is_none());
    }

    #[test]
    fn test_shadowing() {
        let global = Scope::new();
        global.declare("x", Value::Number(1.0), true);
        let inner = global.child();
        inner.declare("x", Value::Number(2.0), true);
        inner.assign("x", Value::Number(3.0)).unwrap();
        assert!(matches!(inner.lookup("x"), Some(Value::Number(n)) if n == 3.0));
        assert!(matches!(global.lookup("x"), Some(Value::Number(n)) if n == 1.0));
    }

    #[test]
    fn test_assign_errors() {
        let scope = Scope::new();
        scope.declare("c", Value::Null, false);
        assert_eq!(
            scope.assign("c", Value::Null),
            Err(AssignError::Constant)
        );
        assert_eq!(
            scope.assign("missing", Value::Null),
            Err(AssignError::Undeclared)
        );
    }

    #[test]
    fn test_weak_clear() {
        let scope = Scope::new();
        scope.declare("x", Value::Number(1.0), true);
        let weak = scope.downgrade();
        assert_eq!(weak.clear().len(), 1);
        assert!(scope.lookup("x").is_none());
        drop(scope);
        assert!(!weak.is_live());
        assert!(weak.clear().is_empty());
    }
}
