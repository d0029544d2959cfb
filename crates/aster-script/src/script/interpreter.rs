//! Script Evaluator
//!
//! An async tree-walking evaluator. Every expression and statement evaluates
//! to a boxed future, so a script suspends at `await` without blocking the
//! worker thread and the whole run can be raced against a deadline.
//!
//! Control flow other than normal completion travels as [`Abrupt`]:
//! - `Throw` is a script exception, catchable by `try`
//! - `Fatal` is a resource limit violation; it unwinds through `catch` and
//!   `finally` blocks so a script cannot swallow it
//! - `ShortCircuit` ends an optional chain whose base was nullish

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use super::ast::*;
use super::builtins;
use super::heap::Heap;
use super::scope::{AssignError, Scope};
use super::value::{fits_string_limit, Function, Promise, Value};
use crate::config::SandboxConfig;
use crate::sandbox::SandboxContext;
use crate::tools::ToolBridge;

/// Arrays longer than this cannot be created by scripts
pub(crate) const MAX_ARRAY_LENGTH: usize = 10_000_000;

pub(crate) enum Abrupt {
    Throw(Value),
    Fatal(String),
    ShortCircuit,
}

pub(crate) type EvalResult<T = Value> = Result<T, Abrupt>;

enum Completion {
    Normal,
    Return(Value),
    Break,
    Continue,
}

#[derive(Clone, Copy)]
enum BindMode {
    Declare { mutable: bool },
    Assign,
}

/// Target of an update or compound assignment
enum Reference {
    Variable(Arc<str>),
    Property(Value, String),
}

/// Decrements the call depth when a script function returns
struct CallFrame<'a>(&'a AtomicUsize);

impl Drop for CallFrame<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) struct Interpreter<'c> {
    ctx: &'c SandboxContext,
    steps: AtomicU64,
    call_depth: AtomicUsize,
}

impl<'c> Interpreter<'c> {
    pub(crate) fn new(ctx: &'c SandboxContext) -> Self {
        Self {
            ctx,
            steps: AtomicU64::new(0),
            call_depth: AtomicUsize::new(0),
        }
    }

    pub(crate) fn heap(&self) -> &Arc<Heap> {
        &self.ctx.heap
    }

    pub(crate) fn config(&self) -> &SandboxConfig {
        &self.ctx.config
    }

    /// Append a console line; false once the log budget is spent
    pub(crate) fn log(&self, line: String) -> bool {
        self.ctx.logs.push(line)
    }

    pub(crate) fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Exception carrying a fresh error instance
    pub(crate) fn throw(&self, name: &str, message: impl Into<String>) -> Abrupt {
        Abrupt::Throw(self.ctx.heap.error(name, message))
    }

    pub(crate) fn type_error(&self, message: impl Into<String>) -> Abrupt {
        self.throw("TypeError", message)
    }

    // =========================================================================
    // Program
    // =========================================================================

    /// Run a program to completion, returning its JSON output or error message
    pub(crate) async fn run(&self, program: &Program) -> Result<JsonValue, String> {
        let scope = self.ctx.heap.scope(&self.ctx.globals);
        let settled = match self.run_program(program, &scope).await {
            Ok(value) => self.await_value(value).await,
            Err(abrupt) => Err(abrupt),
        };
        match settled {
            Ok(value) => match value.to_json() {
                Ok(json) => Ok(json.unwrap_or(JsonValue::Null)),
                Err(err) => Err(format!("TypeError: {}", err)),
            },
            Err(Abrupt::Throw(value)) => Err(value.describe_thrown()),
            Err(Abrupt::Fatal(message)) => Err(message),
            Err(Abrupt::ShortCircuit) => Ok(JsonValue::Null),
        }
    }

    /// The value of a trailing expression statement is the program's result
    async fn run_program(&self, program: &Program, scope: &Scope) -> EvalResult {
        self.hoist(&program.body, scope);
        let last_index = program
            .body
            .iter()
            .rposition(|stmt| !matches!(stmt, Stmt::Empty));
        let mut result = Value::Undefined;
        for (index, stmt) in program.body.iter().enumerate() {
            self.tick().await?;
            if let (Some(last), Stmt::Expr(expr)) = (last_index, stmt) {
                if index == last {
                    result = self.eval_expr(expr, scope).await?;
                    continue;
                }
            }
            match self.exec_stmt(stmt, scope).await? {
                Completion::Return(value) => return Ok(value),
                Completion::Normal | Completion::Break | Completion::Continue => {}
            }
        }
        Ok(result)
    }

    /// Count one evaluation step, yielding to the runtime periodically
    pub(crate) async fn tick(&self) -> EvalResult<()> {
        let steps = self.steps.fetch_add(1, Ordering::Relaxed) + 1;
        let config = &self.ctx.config;
        if steps > config.max_steps {
            return Err(Abrupt::Fatal(
                "RangeError: Execution step limit exceeded".to_string(),
            ));
        }
        if steps % config.yield_interval.max(1) == 0 {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn enter_call(&self) -> EvalResult<CallFrame<'_>> {
        let depth = self.call_depth.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = CallFrame(&self.call_depth);
        if depth > self.ctx.config.max_call_depth {
            return Err(Abrupt::Fatal(
                "RangeError: Maximum call stack size exceeded".to_string(),
            ));
        }
        Ok(frame)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Declare function declarations before the rest of the block runs
    fn hoist(&self, body: &[Stmt], scope: &Scope) {
        for stmt in body {
            if let Stmt::Function(def) = stmt {
                if let Some(name) = &def.name {
                    scope.declare(name, self.make_closure(def, scope), true);
                }
            }
        }
    }

    fn exec_block<'a>(
        &'a self,
        body: &'a [Stmt],
        scope: &'a Scope,
    ) -> BoxFuture<'a, EvalResult<Completion>> {
        async move {
            self.hoist(body, scope);
            for stmt in body {
                self.tick().await?;
                match self.exec_stmt(stmt, scope).await? {
                    Completion::Normal => {}
                    other => return Ok(other),
                }
            }
            Ok(Completion::Normal)
        }
        .boxed()
    }

    fn exec_stmt<'a>(
        &'a self,
        stmt: &'a Stmt,
        scope: &'a Scope,
    ) -> BoxFuture<'a, EvalResult<Completion>> {
        match stmt {
            Stmt::Expr(expr) => async move {
                self.eval_expr(expr, scope).await?;
                Ok(Completion::Normal)
            }
            .boxed(),
            Stmt::Declare { kind, decls } => self.exec_declare(*kind, decls, scope).boxed(),
            Stmt::Function(_) | Stmt::Empty => future::ready(Ok(Completion::Normal)).boxed(),
            Stmt::Block(body) => async move {
                let inner = self.ctx.heap.scope(scope);
                self.exec_block(body, &inner).await
            }
            .boxed(),
            Stmt::If {
                test,
                consequent,
                alternate,
            } => async move {
                if self.eval_expr(test, scope).await?.truthy() {
                    self.exec_stmt(consequent, scope).await
                } else if let Some(alternate) = alternate {
                    self.exec_stmt(alternate, scope).await
                } else {
                    Ok(Completion::Normal)
                }
            }
            .boxed(),
            Stmt::While { test, body } => self.exec_while(test, body, scope).boxed(),
            Stmt::DoWhile { body, test } => self.exec_do_while(body, test, scope).boxed(),
            Stmt::For {
                init,
                test,
                update,
                body,
            } => self
                .exec_for(init.as_deref(), test.as_ref(), update.as_ref(), body, scope)
                .boxed(),
            Stmt::ForOf {
                kind,
                pattern,
                iterable,
                body,
            } => self.exec_for_of(*kind, pattern, iterable, body, scope).boxed(),
            Stmt::ForIn {
                kind,
                pattern,
                object,
                body,
            } => self.exec_for_in(*kind, pattern, object, body, scope).boxed(),
            Stmt::Return(argument) => async move {
                let value = match argument {
                    Some(expr) => self.eval_expr(expr, scope).await?,
                    None => Value::Undefined,
                };
                Ok(Completion::Return(value))
            }
            .boxed(),
            Stmt::Break => future::ready(Ok(Completion::Break)).boxed(),
            Stmt::Continue => future::ready(Ok(Completion::Continue)).boxed(),
            Stmt::Throw(argument) => async move {
                let value = self.eval_expr(argument, scope).await?;
                Err(Abrupt::Throw(value))
            }
            .boxed(),
            Stmt::Try {
                block,
                param,
                handler,
                finalizer,
            } => self
                .exec_try(
                    block,
                    param.as_ref(),
                    handler.as_deref(),
                    finalizer.as_deref(),
                    scope,
                )
                .boxed(),
        }
    }

    async fn exec_declare(
        &self,
        kind: DeclKind,
        decls: &[(Pattern, Option<Expr>)],
        scope: &Scope,
    ) -> EvalResult<Completion> {
        let mode = BindMode::Declare {
            mutable: kind.is_mutable(),
        };
        for (pattern, init) in decls {
            let value = match init {
                Some(expr) => self.eval_expr(expr, scope).await?,
                None => Value::Undefined,
            };
            self.bind_pattern(pattern, value, mode, scope).await?;
        }
        Ok(Completion::Normal)
    }

    async fn exec_while(&self, test: &Expr, body: &Stmt, scope: &Scope) -> EvalResult<Completion> {
        loop {
            self.tick().await?;
            if !self.eval_expr(test, scope).await?.truthy() {
                return Ok(Completion::Normal);
            }
            match self.exec_stmt(body, scope).await? {
                Completion::Break => return Ok(Completion::Normal),
                Completion::Return(value) => return Ok(Completion::Return(value)),
                Completion::Normal | Completion::Continue => {}
            }
        }
    }

    async fn exec_do_while(
        &self,
        body: &Stmt,
        test: &Expr,
        scope: &Scope,
    ) -> EvalResult<Completion> {
        loop {
            self.tick().await?;
            match self.exec_stmt(body, scope).await? {
                Completion::Break => return Ok(Completion::Normal),
                Completion::Return(value) => return Ok(Completion::Return(value)),
                Completion::Normal | Completion::Continue => {}
            }
            if !self.eval_expr(test, scope).await?.truthy() {
                return Ok(Completion::Normal);
            }
        }
    }

    async fn exec_for(
        &self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
        scope: &Scope,
    ) -> EvalResult<Completion> {
        let loop_scope = self.ctx.heap.scope(scope);
        if let Some(init) = init {
            self.exec_stmt(init, &loop_scope).await?;
        }
        loop {
            self.tick().await?;
            if let Some(test) = test {
                if !self.eval_expr(test, &loop_scope).await?.truthy() {
                    return Ok(Completion::Normal);
                }
            }
            match self.exec_stmt(body, &loop_scope).await? {
                Completion::Break => return Ok(Completion::Normal),
                Completion::Return(value) => return Ok(Completion::Return(value)),
                Completion::Normal | Completion::Continue => {}
            }
            if let Some(update) = update {
                self.eval_expr(update, &loop_scope).await?;
            }
        }
    }

    async fn exec_for_of(
        &self,
        kind: DeclKind,
        pattern: &Pattern,
        iterable: &Expr,
        body: &Stmt,
        scope: &Scope,
    ) -> EvalResult<Completion> {
        let source = self.eval_expr(iterable, scope).await?;
        let items = self.iterate(&source)?;
        self.run_loop_body(kind, pattern, items, body, scope).await
    }

    async fn exec_for_in(
        &self,
        kind: DeclKind,
        pattern: &Pattern,
        object: &Expr,
        body: &Stmt,
        scope: &Scope,
    ) -> EvalResult<Completion> {
        let target = self.eval_expr(object, scope).await?;
        let keys = builtins::own_keys(&target)
            .into_iter()
            .map(Value::string)
            .collect();
        self.run_loop_body(kind, pattern, keys, body, scope).await
    }

    async fn run_loop_body(
        &self,
        kind: DeclKind,
        pattern: &Pattern,
        items: Vec<Value>,
        body: &Stmt,
        scope: &Scope,
    ) -> EvalResult<Completion> {
        let mode = BindMode::Declare {
            mutable: kind.is_mutable(),
        };
        for item in items {
            self.tick().await?;
            let iteration = self.ctx.heap.scope(scope);
            self.bind_pattern(pattern, item, mode, &iteration).await?;
            match self.exec_stmt(body, &iteration).await? {
                Completion::Break => break,
                Completion::Return(value) => return Ok(Completion::Return(value)),
                Completion::Normal | Completion::Continue => {}
            }
        }
        Ok(Completion::Normal)
    }

    async fn exec_try(
        &self,
        block: &[Stmt],
        param: Option<&Pattern>,
        handler: Option<&[Stmt]>,
        finalizer: Option<&[Stmt]>,
        scope: &Scope,
    ) -> EvalResult<Completion> {
        let block_scope = self.ctx.heap.scope(scope);
        let result = match (self.exec_block(block, &block_scope).await, handler) {
            (Err(Abrupt::Throw(error)), Some(handler)) => {
                let catch_scope = self.ctx.heap.scope(scope);
                let bound = match param {
                    Some(param) => {
                        self.bind_pattern(
                            param,
                            error,
                            BindMode::Declare { mutable: true },
                            &catch_scope,
                        )
                        .await
                    }
                    None => Ok(()),
                };
                match bound {
                    Ok(()) => self.exec_block(handler, &catch_scope).await,
                    Err(abrupt) => Err(abrupt),
                }
            }
            (other, _) => other,
        };

        if matches!(result, Err(Abrupt::Fatal(_))) {
            return result;
        }
        if let Some(finalizer) = finalizer {
            let finally_scope = self.ctx.heap.scope(scope);
            match self.exec_block(finalizer, &finally_scope).await? {
                Completion::Normal => {}
                overriding => return Ok(overriding),
            }
        }
        result
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    fn bind_name(&self, name: &str, value: Value, mode: BindMode, scope: &Scope) -> EvalResult<()> {
        match mode {
            BindMode::Declare { mutable } => {
                scope.declare(name, value, mutable);
                Ok(())
            }
            BindMode::Assign => scope.assign(name, value).map_err(|err| match err {
                AssignError::Undeclared => {
                    self.throw("ReferenceError", format!("{} is not defined", name))
                }
                AssignError::Constant => self.type_error("Assignment to constant variable."),
            }),
        }
    }

    fn bind_pattern<'a>(
        &'a self,
        pattern: &'a Pattern,
        value: Value,
        mode: BindMode,
        scope: &'a Scope,
    ) -> BoxFuture<'a, EvalResult<()>> {
        async move {
            match pattern {
                Pattern::Ident(name) => self.bind_name(name, value, mode, scope),
                Pattern::Expr(target) => {
                    let reference = self.resolve_reference(target, scope).await?;
                    self.put_reference(&reference, value, scope)
                }
                Pattern::Array { elems, rest } => {
                    let items = self.iterate(&value)?;
                    for (index, elem) in elems.iter().enumerate() {
                        if let Some(elem) = elem {
                            let item = items.get(index).cloned().unwrap_or_default();
                            self.bind_elem(elem, item, mode, scope).await?;
                        }
                    }
                    if let Some(rest) = rest {
                        let remaining = items.get(elems.len()..).unwrap_or_default().to_vec();
                        let remaining = self.ctx.heap.array(remaining);
                        self.bind_pattern(rest, remaining, mode, scope).await?;
                    }
                    Ok(())
                }
                Pattern::Object { props, rest } => {
                    if value.is_nullish() {
                        return Err(self.type_error(format!(
                            "Cannot destructure '{}' as it is {}.",
                            value.to_display_string(),
                            value.to_display_string()
                        )));
                    }
                    let mut used = Vec::with_capacity(props.len());
                    for (key, elem) in props {
                        let key = self.prop_key(key, scope).await?;
                        let item = self.get_property(&value, &key)?;
                        used.push(key);
                        self.bind_elem(elem, item, mode, scope).await?;
                    }
                    if let Some(rest) = rest {
                        let remaining: IndexMap<String, Value> = builtins::own_entries(&value)
                            .into_iter()
                            .filter(|(key, _)| !used.contains(key))
                            .collect();
                        let remaining = self.ctx.heap.object(remaining);
                        self.bind_name(rest, remaining, mode, scope)?;
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }

    async fn bind_elem(
        &self,
        elem: &PatternElem,
        value: Value,
        mode: BindMode,
        scope: &Scope,
    ) -> EvalResult<()> {
        let value = match (&elem.default, value) {
            (Some(default), Value::Undefined) => self.eval_expr(default, scope).await?,
            (_, value) => value,
        };
        self.bind_pattern(&elem.target, value, mode, scope).await
    }

    async fn resolve_reference(&self, target: &Expr, scope: &Scope) -> EvalResult<Reference> {
        match target {
            Expr::Ident(name) => Ok(Reference::Variable(name.clone())),
            Expr::Member {
                object, property, ..
            } => {
                let object = self.eval_expr(object, scope).await?;
                let key = self.member_key(property, scope).await?;
                Ok(Reference::Property(object, key))
            }
            _ => Err(self.throw("SyntaxError", "Invalid assignment target")),
        }
    }

    fn get_reference(&self, reference: &Reference, scope: &Scope) -> EvalResult {
        match reference {
            Reference::Variable(name) => self.lookup(name, scope),
            Reference::Property(object, key) => self.get_property(object, key),
        }
    }

    fn put_reference(&self, reference: &Reference, value: Value, scope: &Scope) -> EvalResult<()> {
        match reference {
            Reference::Variable(name) => self.bind_name(name, value, BindMode::Assign, scope),
            Reference::Property(object, key) => self.set_property(object, key.clone(), value),
        }
    }

    fn lookup(&self, name: &str, scope: &Scope) -> EvalResult {
        scope
            .lookup(name)
            .ok_or_else(|| self.throw("ReferenceError", format!("{} is not defined", name)))
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    pub(crate) fn eval_expr<'a>(
        &'a self,
        expr: &'a Expr,
        scope: &'a Scope,
    ) -> BoxFuture<'a, EvalResult> {
        match expr {
            Expr::Number(n) => future::ready(Ok(Value::Number(*n))).boxed(),
            Expr::String(s) => future::ready(Ok(Value::String(s.clone()))).boxed(),
            Expr::Bool(b) => future::ready(Ok(Value::Bool(*b))).boxed(),
            Expr::Null => future::ready(Ok(Value::Null)).boxed(),
            Expr::Undefined => future::ready(Ok(Value::Undefined)).boxed(),
            Expr::Ident(name) => future::ready(self.lookup(name, scope)).boxed(),
            Expr::Function(def) => future::ready(Ok(self.make_closure(def, scope))).boxed(),
            Expr::Template { quasis, exprs } => self.eval_template(quasis, exprs, scope).boxed(),
            Expr::Array(elements) => async move {
                let items = self.eval_elements(elements, scope).await?;
                Ok(self.ctx.heap.array(items))
            }
            .boxed(),
            Expr::Object(props) => self.eval_object(props, scope).boxed(),
            Expr::Unary { op, arg } => self.eval_unary(*op, arg, scope).boxed(),
            Expr::Update { op, prefix, target } => {
                self.eval_update(*op, *prefix, target, scope).boxed()
            }
            Expr::Binary { op, left, right } => async move {
                let left = self.eval_expr(left, scope).await?;
                let right = self.eval_expr(right, scope).await?;
                self.binary_op(*op, left, right)
            }
            .boxed(),
            Expr::Logical { op, left, right } => async move {
                let left = self.eval_expr(left, scope).await?;
                let short_circuit = match op {
                    LogicalOp::And => !left.truthy(),
                    LogicalOp::Or => left.truthy(),
                    LogicalOp::Nullish => !left.is_nullish(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval_expr(right, scope).await
                }
            }
            .boxed(),
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => async move {
                if self.eval_expr(test, scope).await?.truthy() {
                    self.eval_expr(consequent, scope).await
                } else {
                    self.eval_expr(alternate, scope).await
                }
            }
            .boxed(),
            Expr::Assign { op, target, value } => self.eval_assign(*op, target, value, scope).boxed(),
            Expr::Member {
                object,
                property,
                optional,
            } => async move {
                let object = self.eval_expr(object, scope).await?;
                if *optional && object.is_nullish() {
                    return Err(Abrupt::ShortCircuit);
                }
                let key = self.member_key(property, scope).await?;
                self.get_property(&object, &key)
            }
            .boxed(),
            Expr::Call {
                callee,
                args,
                optional,
            } => self.eval_call(callee, args, *optional, scope).boxed(),
            Expr::New { callee, args } => async move {
                let constructor = self.eval_expr(callee, scope).await?;
                let args = self.eval_elements(args, scope).await?;
                match &constructor {
                    Value::Function(function) => match &**function {
                        Function::Native(name) => builtins::construct(self, *name, args).await,
                        _ => Err(self.type_error(format!(
                            "{} is not a constructor",
                            describe_callee(callee)
                        ))),
                    },
                    _ => Err(self.type_error(format!(
                        "{} is not a constructor",
                        describe_callee(callee)
                    ))),
                }
            }
            .boxed(),
            Expr::Await(arg) => async move {
                let value = self.eval_expr(arg, scope).await?;
                self.await_value(value).await
            }
            .boxed(),
            Expr::Sequence(items) => async move {
                let mut last = Value::Undefined;
                for item in items {
                    last = self.eval_expr(item, scope).await?;
                }
                Ok(last)
            }
            .boxed(),
            Expr::OptionalChain(inner) => async move {
                match self.eval_expr(inner, scope).await {
                    Err(Abrupt::ShortCircuit) => Ok(Value::Undefined),
                    other => other,
                }
            }
            .boxed(),
        }
    }

    fn make_closure(&self, def: &Arc<FunctionDef>, scope: &Scope) -> Value {
        Value::Function(Arc::new(Function::Closure {
            def: def.clone(),
            env: scope.clone(),
        }))
    }

    pub(crate) async fn await_value(&self, value: Value) -> EvalResult {
        match value {
            Value::Promise(promise) => promise.settle().await.map_err(Abrupt::Throw),
            other => Ok(other),
        }
    }

    async fn eval_template(&self, quasis: &[String], exprs: &[Expr], scope: &Scope) -> EvalResult {
        let mut out = String::new();
        for (index, quasi) in quasis.iter().enumerate() {
            out.push_str(quasi);
            if let Some(expr) = exprs.get(index) {
                let value = self.eval_expr(expr, scope).await?;
                let text = value.to_display_string();
                if !fits_string_limit(&[&out, &text]) {
                    return Err(self.invalid_string_length());
                }
                out.push_str(&text);
            }
        }
        Ok(Value::string(out))
    }

    async fn eval_elements(&self, elements: &[ArrayElement], scope: &Scope) -> EvalResult<Vec<Value>> {
        let mut items = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                ArrayElement::Item(expr) => items.push(self.eval_expr(expr, scope).await?),
                ArrayElement::Spread(expr) => {
                    let source = self.eval_expr(expr, scope).await?;
                    let incoming = match &source {
                        Value::Array(other) => other.read().len(),
                        Value::String(text) => text.chars().count(),
                        _ => 0,
                    };
                    if items.len() + incoming > MAX_ARRAY_LENGTH {
                        return Err(self.throw("RangeError", "Invalid array length"));
                    }
                    items.extend(self.iterate(&source)?);
                }
                ArrayElement::Hole => items.push(Value::Undefined),
            }
        }
        Ok(items)
    }

    async fn eval_object(&self, props: &[Property], scope: &Scope) -> EvalResult {
        let mut fields = IndexMap::with_capacity(props.len());
        for prop in props {
            match prop {
                Property::KeyValue(key, expr) => {
                    let key = self.prop_key(key, scope).await?;
                    let value = self.eval_expr(expr, scope).await?;
                    fields.insert(key, value);
                }
                Property::Spread(expr) => {
                    let source = self.eval_expr(expr, scope).await?;
                    fields.extend(builtins::own_entries(&source));
                }
            }
        }
        Ok(self.ctx.heap.object(fields))
    }

    async fn prop_key(&self, key: &PropKey, scope: &Scope) -> EvalResult<String> {
        match key {
            PropKey::Static(name) => Ok(name.to_string()),
            PropKey::Computed(expr) => Ok(self.eval_expr(expr, scope).await?.to_property_key()),
        }
    }

    async fn member_key(&self, property: &MemberProp, scope: &Scope) -> EvalResult<String> {
        match property {
            MemberProp::Static(name) => Ok(name.to_string()),
            MemberProp::Computed(expr) => Ok(self.eval_expr(expr, scope).await?.to_property_key()),
        }
    }

    async fn eval_unary(&self, op: UnaryOp, arg: &Expr, scope: &Scope) -> EvalResult {
        match op {
            UnaryOp::Typeof => {
                if let Expr::Ident(name) = arg {
                    return Ok(match scope.lookup(name) {
                        Some(value) => Value::string(value.type_of()),
                        None => Value::string("undefined"),
                    });
                }
                let value = self.eval_expr(arg, scope).await?;
                Ok(Value::string(value.type_of()))
            }
            UnaryOp::Delete => {
                if let Expr::Member {
                    object, property, ..
                } = arg
                {
                    let object = self.eval_expr(object, scope).await?;
                    let key = self.member_key(property, scope).await?;
                    match &object {
                        Value::Object(fields) | Value::Error(fields) => {
                            fields.write().shift_remove(&key);
                        }
                        Value::Array(items) => {
                            if let Some(index) = array_index(&key) {
                                if let Some(slot) = items.write().get_mut(index) {
                                    *slot = Value::Undefined;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Value::Bool(true))
            }
            _ => {
                let value = self.eval_expr(arg, scope).await?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    _ => Value::Undefined,
                })
            }
        }
    }

    async fn eval_update(
        &self,
        op: UpdateOp,
        prefix: bool,
        target: &Expr,
        scope: &Scope,
    ) -> EvalResult {
        let reference = self.resolve_reference(target, scope).await?;
        let old = self.get_reference(&reference, scope)?.to_number();
        let new = match op {
            UpdateOp::Increment => old + 1.0,
            UpdateOp::Decrement => old - 1.0,
        };
        self.put_reference(&reference, Value::Number(new), scope)?;
        Ok(Value::Number(if prefix { new } else { old }))
    }

    async fn eval_assign(
        &self,
        op: AssignOp,
        target: &AssignTarget,
        value: &Expr,
        scope: &Scope,
    ) -> EvalResult {
        let reference = match target {
            AssignTarget::Pattern(pattern) => {
                let value = self.eval_expr(value, scope).await?;
                self.bind_pattern(pattern, value.clone(), BindMode::Assign, scope)
                    .await?;
                return Ok(value);
            }
            AssignTarget::Ident(name) => Reference::Variable(name.clone()),
            AssignTarget::Member { object, property } => {
                let object = self.eval_expr(object, scope).await?;
                let key = self.member_key(property, scope).await?;
                Reference::Property(object, key)
            }
        };

        let result = match (op, op.binary()) {
            (_, Some(binary)) => {
                let current = self.get_reference(&reference, scope)?;
                let rhs = self.eval_expr(value, scope).await?;
                self.binary_op(binary, current, rhs)?
            }
            (AssignOp::Assign, None) => self.eval_expr(value, scope).await?,
            (logical, None) => {
                let current = self.get_reference(&reference, scope)?;
                let keep = match logical {
                    AssignOp::Nullish => !current.is_nullish(),
                    AssignOp::Or => current.truthy(),
                    _ => !current.truthy(),
                };
                if keep {
                    return Ok(current);
                }
                self.eval_expr(value, scope).await?
            }
        };
        self.put_reference(&reference, result.clone(), scope)?;
        Ok(result)
    }

    pub(crate) fn invalid_string_length(&self) -> Abrupt {
        self.throw("RangeError", "Invalid string length")
    }

    /// `+`: concatenation when either side is a string or reference value
    fn add(&self, left: &Value, right: &Value) -> EvalResult {
        let is_stringy = |value: &Value| {
            matches!(
                value,
                Value::String(_)
                    | Value::Array(_)
                    | Value::Object(_)
                    | Value::Error(_)
                    | Value::Function(_)
                    | Value::Promise(_)
            )
        };
        if !is_stringy(left) && !is_stringy(right) {
            return Ok(Value::Number(left.to_number() + right.to_number()));
        }
        let (left, right) = (left.to_display_string(), right.to_display_string());
        if !fits_string_limit(&[&left, &right]) {
            return Err(self.invalid_string_length());
        }
        let mut out = String::with_capacity(left.len() + right.len());
        out.push_str(&left);
        out.push_str(&right);
        Ok(Value::string(out))
    }

    pub(crate) fn binary_op(&self, op: BinaryOp, left: Value, right: Value) -> EvalResult {
        use std::cmp::Ordering as Cmp;

        let value = match op {
            BinaryOp::Add => self.add(&left, &right)?,
            BinaryOp::Sub => Value::Number(left.to_number() - right.to_number()),
            BinaryOp::Mul => Value::Number(left.to_number() * right.to_number()),
            BinaryOp::Div => Value::Number(left.to_number() / right.to_number()),
            BinaryOp::Rem => Value::Number(left.to_number() % right.to_number()),
            BinaryOp::Exp => {
                let exponent = right.to_number();
                let base = left.to_number();
                Value::Number(if exponent.is_nan() {
                    f64::NAN
                } else {
                    base.powf(exponent)
                })
            }
            BinaryOp::Eq => Value::Bool(left.loose_equals(&right)),
            BinaryOp::NotEq => Value::Bool(!left.loose_equals(&right)),
            BinaryOp::StrictEq => Value::Bool(left.strict_equals(&right)),
            BinaryOp::StrictNotEq => Value::Bool(!left.strict_equals(&right)),
            BinaryOp::Lt => Value::Bool(matches!(compare(&left, &right), Some(Cmp::Less))),
            BinaryOp::LtEq => Value::Bool(matches!(
                compare(&left, &right),
                Some(Cmp::Less | Cmp::Equal)
            )),
            BinaryOp::Gt => Value::Bool(matches!(compare(&left, &right), Some(Cmp::Greater))),
            BinaryOp::GtEq => Value::Bool(matches!(
                compare(&left, &right),
                Some(Cmp::Greater | Cmp::Equal)
            )),
            BinaryOp::In => {
                let key = left.to_property_key();
                match &right {
                    Value::Object(fields) | Value::Error(fields) => {
                        Value::Bool(fields.read().contains_key(&key))
                    }
                    Value::Array(items) => Value::Bool(
                        key == "length"
                            || array_index(&key).is_some_and(|index| index < items.read().len()),
                    ),
                    other => {
                        return Err(self.type_error(format!(
                            "Cannot use 'in' operator to search for '{}' in {}",
                            key,
                            other.to_display_string()
                        )))
                    }
                }
            }
            BinaryOp::InstanceOf => match &right {
                Value::Function(function) => Value::Bool(builtins::instance_of(&left, function)),
                _ => {
                    return Err(
                        self.type_error("Right-hand side of 'instanceof' is not callable")
                    )
                }
            },
        };
        Ok(value)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    async fn eval_call(
        &self,
        callee: &Expr,
        args: &[ArrayElement],
        optional: bool,
        scope: &Scope,
    ) -> EvalResult {
        let function = self.eval_expr(callee, scope).await?;
        if optional && function.is_nullish() {
            return Err(Abrupt::ShortCircuit);
        }
        let args = self.eval_elements(args, scope).await?;
        match &function {
            Value::Function(function) => self.call_function(function, args).await,
            _ => Err(self.type_error(format!("{} is not a function", describe_callee(callee)))),
        }
    }

    /// Invoke a callable value, e.g. a callback passed to a built-in
    pub(crate) async fn call_value(&self, callee: &Value, args: Vec<Value>) -> EvalResult {
        match callee {
            Value::Function(function) => self.call_function(function, args).await,
            other => Err(self.type_error(format!(
                "{} is not a function",
                other.to_display_string()
            ))),
        }
    }

    fn call_function<'a>(
        &'a self,
        function: &'a Function,
        args: Vec<Value>,
    ) -> BoxFuture<'a, EvalResult> {
        match function {
            Function::Closure { def, env } => self.call_closure(def, env, args).boxed(),
            Function::Native(name) => builtins::call_native(self, *name, args),
            Function::Method { receiver, name } => {
                builtins::call_method(self, receiver, *name, args)
            }
            Function::Tool(bridge) => future::ready(self.call_tool(bridge, args)).boxed(),
        }
    }

    async fn call_closure(
        &self,
        def: &Arc<FunctionDef>,
        env: &Scope,
        args: Vec<Value>,
    ) -> EvalResult {
        let _frame = self.enter_call()?;
        self.tick().await?;
        let scope = self.ctx.heap.scope(env);
        let outcome = self.run_closure_body(def, &scope, args).await;
        if !def.is_async {
            return outcome;
        }
        match outcome {
            Ok(value) => Ok(Value::Promise(Promise::resolve_value(value))),
            Err(Abrupt::Throw(reason)) => Ok(Value::Promise(Promise::rejected(reason))),
            Err(other) => Err(other),
        }
    }

    async fn run_closure_body(
        &self,
        def: &Arc<FunctionDef>,
        scope: &Scope,
        args: Vec<Value>,
    ) -> EvalResult {
        if let (false, Some(name)) = (def.is_arrow, &def.name) {
            if scope.lookup(name).is_none() {
                scope.declare(name, self.make_closure(def, scope), true);
            }
        }
        let mode = BindMode::Declare { mutable: true };
        let mut args = args.into_iter();
        for param in &def.params {
            let value = args.next().unwrap_or_default();
            self.bind_elem(param, value, mode, scope).await?;
        }
        if let Some(rest) = &def.rest {
            let remaining = self.ctx.heap.array(args.collect());
            self.bind_pattern(rest, remaining, mode, scope).await?;
        }
        match &def.body {
            FunctionBody::Expr(expr) => self.eval_expr(expr, scope).await,
            FunctionBody::Block(body) => match self.exec_block(body, scope).await? {
                Completion::Return(value) => Ok(value),
                _ => Ok(Value::Undefined),
            },
        }
    }

    /// Start a tool call; the returned promise settles with the handler's result
    fn call_tool(&self, bridge: &Arc<ToolBridge>, args: Vec<Value>) -> EvalResult {
        let limit = self.ctx.config.max_tool_calls;
        if self.ctx.tool_calls.fetch_add(1, Ordering::Relaxed) >= limit {
            return Err(self.throw(
                "RangeError",
                format!("Tool call limit of {} exceeded", limit),
            ));
        }

        let mut inputs = Vec::with_capacity(args.len());
        for arg in &args {
            match arg.to_json() {
                Ok(json) => inputs.push(json.unwrap_or(JsonValue::Null)),
                Err(err) => return Err(self.type_error(err.to_string())),
            }
        }
        let input = bridge
            .prepare(inputs)
            .map_err(|err| self.throw("ToolInputError", err.to_string()))?;

        let name = bridge.name().to_string();
        let heap = self.ctx.heap.clone();
        let handle = bridge.spawn(input);
        let settlement = async move {
            match handle.await {
                Ok(Ok(output)) => Ok(heap.import_json(&output)),
                Ok(Err(err)) => Err(heap.error("Error", format!("Tool '{}' failed: {}", name, err))),
                Err(err) => Err(heap.error("Error", format!("Tool '{}' failed: {}", name, err))),
            }
        };
        Ok(Value::Promise(Promise::pending(settlement.boxed())))
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub(crate) fn get_property(&self, object: &Value, key: &str) -> EvalResult {
        let found = match object {
            Value::Undefined | Value::Null => {
                return Err(self.type_error(format!(
                    "Cannot read properties of {} (reading '{}')",
                    object.to_display_string(),
                    key
                )))
            }
            Value::Array(items) => {
                if key == "length" {
                    return Ok(Value::Number(items.read().len() as f64));
                }
                array_index(key).map(|index| items.read().get(index).cloned().unwrap_or_default())
            }
            Value::String(text) => {
                if key == "length" {
                    return Ok(Value::Number(text.chars().count() as f64));
                }
                array_index(key).map(|index| {
                    text.chars()
                        .nth(index)
                        .map(|c| Value::string(c.to_string()))
                        .unwrap_or_default()
                })
            }
            Value::Object(fields) | Value::Error(fields) => fields.read().get(key).cloned(),
            Value::Function(function) => match &**function {
                Function::Native(name) => builtins::native_static(name, key),
                _ if key == "name" => Some(Value::string(function.name())),
                _ => None,
            },
            Value::Bool(_) | Value::Number(_) | Value::Promise(_) => None,
        };
        Ok(found
            .or_else(|| builtins::bound_method(object, key))
            .unwrap_or_default())
    }

    pub(crate) fn set_property(&self, object: &Value, key: String, value: Value) -> EvalResult<()> {
        match object {
            Value::Undefined | Value::Null => Err(self.type_error(format!(
                "Cannot set properties of {} (setting '{}')",
                object.to_display_string(),
                key
            ))),
            Value::Array(items) => {
                if key == "length" {
                    let length = value.to_number();
                    if length < 0.0 || length.fract() != 0.0 || length > MAX_ARRAY_LENGTH as f64 {
                        return Err(self.throw("RangeError", "Invalid array length"));
                    }
                    items.write().resize(length as usize, Value::Undefined);
                } else if let Some(index) = array_index(&key) {
                    if index >= MAX_ARRAY_LENGTH {
                        return Err(self.throw("RangeError", "Invalid array length"));
                    }
                    let mut items = items.write();
                    if index >= items.len() {
                        items.resize(index + 1, Value::Undefined);
                    }
                    items[index] = value;
                }
                Ok(())
            }
            Value::Object(fields) | Value::Error(fields) => {
                fields.write().insert(key, value);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Elements produced by iterating a value with `for…of` or spread
    pub(crate) fn iterate(&self, value: &Value) -> EvalResult<Vec<Value>> {
        match value {
            Value::Array(items) => Ok(items.read().clone()),
            Value::String(text) => Ok(text.chars().map(|c| Value::string(c.to_string())).collect()),
            other => Err(self.type_error(format!(
                "{} is not iterable",
                match other {
                    Value::Object(_) | Value::Error(_) => "object".to_string(),
                    _ => other.to_display_string(),
                }
            ))),
        }
    }
}

/// Canonical array index for a property key
pub(crate) fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => left.to_number().partial_cmp(&right.to_number()),
    }
}

/// Source-like name of a callee for error messages
fn describe_callee(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.to_string(),
        Expr::Member {
            object,
            property: MemberProp::Static(name),
            ..
        } => format!("{}.{}", describe_callee(object), name),
        Expr::Member { object, .. } => format!("{}[...]", describe_callee(object)),
        Expr::OptionalChain(inner) => describe_callee(inner),
        _ => "expression".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse;
    use crate::sandbox::LogBuffer;
    use crate::tools::ToolSet;
    use serde_json::json;

    async fn eval_with(source: &str, config: SandboxConfig) -> (Result<JsonValue, String>, Vec<String>) {
        let logs = LogBuffer::new(config.max_log_entries);
        let ctx = SandboxContext::build(&ToolSet::new(), &config, logs.clone()).unwrap();
        let program = parse(source).unwrap();
        let result = Interpreter::new(&ctx).run(&program).await;
        ctx.release();
        (result, logs.snapshot())
    }

    async fn eval(source: &str) -> Result<JsonValue, String> {
        eval_with(source, SandboxConfig::default()).await.0
    }

    #[tokio::test]
    async fn test_last_expression_is_result() {
        assert_eq!(eval("let x = 2; x * 21").await, Ok(json!(42)));
        assert_eq!(eval("let x = 2;").await, Ok(json!(null)));
        assert_eq!(eval("1; 2;;").await, Ok(json!(2)));
    }

    #[tokio::test]
    async fn test_top_level_return() {
        assert_eq!(eval("return 5; 6").await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn test_closures_capture_scope() {
        let source = r#"
            function counter() {
                let n = 0;
                return () => ++n;
            }
            const next = counter();
            next(); next();
            next()
        "#;
        assert_eq!(eval(source).await, Ok(json!(3)));
    }

    #[tokio::test]
    async fn test_function_hoisting_and_recursion() {
        let source = "const r = fact(5); function fact(n) { return n <= 1 ? 1 : n * fact(n - 1) } r";
        assert_eq!(eval(source).await, Ok(json!(120)));
    }

    #[tokio::test]
    async fn test_loops_with_break_and_continue() {
        let source = r#"
            let total = 0;
            for (let i = 0; i < 10; i++) {
                if (i % 2) continue;
                if (i > 6) break;
                total += i;
            }
            let j = 0;
            while (true) { j++; if (j == 3) break }
            do { j++ } while (j < 5);
            [total, j]
        "#;
        assert_eq!(eval(source).await, Ok(json!([12, 5])));
    }

    #[tokio::test]
    async fn test_for_of_and_for_in() {
        let source = r#"
            const out = [];
            for (const [k, v] of Object.entries({a: 1, b: 2})) out.push(k + v);
            for (const k in {x: 1, y: 2}) out.push(k);
            for (const c of "hi") out.push(c);
            out
        "#;
        assert_eq!(eval(source).await, Ok(json!(["a1", "b2", "x", "y", "h", "i"])));
    }

    #[tokio::test]
    async fn test_destructuring() {
        let source = r#"
            const { a, b: { c = 3 } = {}, ...rest } = { a: 1, d: 4, e: 5 };
            let [x, , y = 9, ...others] = [1, 2, undefined, 4, 5];
            [a, c, rest, x, y, others]
        "#;
        assert_eq!(
            eval(source).await,
            Ok(json!([1, 3, {"d": 4, "e": 5}, 1, 9, [4, 5]]))
        );
    }

    #[tokio::test]
    async fn test_swap_by_destructuring_assignment() {
        assert_eq!(eval("let a = 1, b = 2; [a, b] = [b, a]; [a, b]").await, Ok(json!([2, 1])));
    }

    #[tokio::test]
    async fn test_try_catch_finally() {
        let source = r#"
            const log = [];
            try {
                log.push("try");
                null.x;
            } catch (e) {
                log.push(e.name);
            } finally {
                log.push("finally");
            }
            log
        "#;
        assert_eq!(eval(source).await, Ok(json!(["try", "TypeError", "finally"])));
    }

    #[tokio::test]
    async fn test_finally_return_overrides() {
        let source = "function f() { try { return 1 } finally { return 2 } } f()";
        assert_eq!(eval(source).await, Ok(json!(2)));
    }

    #[tokio::test]
    async fn test_const_reassignment_is_type_error() {
        assert_eq!(
            eval("const x = 1; x = 2").await,
            Err("TypeError: Assignment to constant variable.".to_string())
        );
    }

    #[tokio::test]
    async fn test_undefined_variable() {
        assert_eq!(
            eval("missing + 1").await,
            Err("ReferenceError: missing is not defined".to_string())
        );
        assert_eq!(eval("typeof missing").await, Ok(json!("undefined")));
    }

    #[tokio::test]
    async fn test_optional_chaining_and_nullish() {
        let source = r#"
            const o = { a: { b: null } };
            [o?.a?.b?.c, o.x?.y.z, o.a.b ?? "default", o.missing?.(), o.a?.["b"]]
        "#;
        assert_eq!(eval(source).await, Ok(json!([null, null, "default", null, null])));
    }

    #[tokio::test]
    async fn test_calling_non_function() {
        assert_eq!(
            eval("const o = {}; o.run()").await,
            Err("TypeError: o.run is not a function".to_string())
        );
    }

    #[tokio::test]
    async fn test_compound_and_logical_assignment() {
        let source = r#"
            const o = { n: 1, list: [] };
            o.n += 4; o.n **= 2; o.m ??= 7; o.n ||= 100; o.z &&= 1;
            o.list[2] = "x";
            o
        "#;
        assert_eq!(
            eval(source).await,
            Ok(json!({"n": 25, "list": [null, null, "x"], "m": 7}))
        );
    }

    #[tokio::test]
    async fn test_string_concatenation_and_templates() {
        let source = r#"const n = 3; `n=${n}, list=${[1, 2]}` + " " + (1 + "1") + (null + 1)"#;
        assert_eq!(eval(source).await, Ok(json!("n=3, list=1,2 111")));
    }

    #[tokio::test]
    async fn test_equality_semantics() {
        let source = r#"[1 == "1", 1 === "1", null == undefined, NaN === NaN, [] === [], "b" > "a"]"#;
        assert_eq!(eval(source).await, Ok(json!([true, false, true, false, false, true])));
    }

    #[tokio::test]
    async fn test_async_function_returns_promise() {
        let source = r#"
            async function double(x) { return x * 2 }
            const p = double(4);
            [typeof p, await p]
        "#;
        assert_eq!(eval(source).await, Ok(json!(["object", 8])));
    }

    #[tokio::test]
    async fn test_rejected_async_function() {
        let source = "async function f() { throw new RangeError('bad') } await f()";
        assert_eq!(eval(source).await, Err("RangeError: bad".to_string()));
    }

    #[tokio::test]
    async fn test_thrown_non_error_is_stringified() {
        assert_eq!(eval("throw 42").await, Err("42".to_string()));
        assert_eq!(eval("throw { code: 1 }").await, Err("[object Object]".to_string()));
    }

    #[tokio::test]
    async fn test_step_limit_is_not_catchable() {
        let config = SandboxConfig {
            max_steps: 1000,
            ..SandboxConfig::default()
        };
        let source = "while (true) { try { while (true) {} } catch (e) {} }";
        let (result, _) = eval_with(source, config).await;
        assert_eq!(result, Err("RangeError: Execution step limit exceeded".to_string()));
    }

    #[tokio::test]
    async fn test_call_depth_limit() {
        let config = SandboxConfig {
            max_call_depth: 32,
            ..SandboxConfig::default()
        };
        let source = "function f(n) { return f(n + 1) } f(0)";
        let (result, _) = eval_with(source, config).await;
        assert_eq!(result, Err("RangeError: Maximum call stack size exceeded".to_string()));
    }

    #[tokio::test]
    async fn test_circular_output_is_type_error() {
        let result = eval("const a = []; a.push(a); a").await;
        assert_eq!(
            result,
            Err("TypeError: Converting circular structure to JSON".to_string())
        );
    }

    #[tokio::test]
    async fn test_console_log_rendering() {
        let (result, logs) = eval_with(
            r#"console.log("a", 1, [1], { k: "v" }, undefined, null)"#,
            SandboxConfig::default(),
        )
        .await;
        assert_eq!(result, Ok(json!(null)));
        assert_eq!(logs, vec!["a 1 [\n  1\n] {\n  \"k\": \"v\"\n} undefined null"]);
    }

    #[test]
    fn test_array_index() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("12"), Some(12));
        assert_eq!(array_index("01"), None);
        assert_eq!(array_index("-1"), None);
        assert_eq!(array_index("length"), None);
    }
}
