//! The built-in script engine.
//!
//! Scripts are an opaque string as far as the protocol is concerned; this
//! module provides the default engine: a small expression/statement language
//! with graph capability calls, evaluated by a tree-walking interpreter.
//!
//! Two independent cancellation mechanisms reach into a running evaluation:
//! a soft [`CancellationToken`] polled cooperatively at statement
//! boundaries, and a hard elapsed-time deadline checked every
//! [`INTERRUPT_CHECK_CADENCE`] interpreter operations so that even a tight
//! loop with no suspension point gets aborted.

mod ast;
mod interp;
mod lexer;
mod parser;

pub use ast::TypeTag;
pub use ast::{FuncDef, Program};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::graph::GraphBackend;
use crate::settings::Settings;
use crate::value::Value;

/// How many interpreter operations run between checks of the hard interrupt
/// deadline.
pub const INTERRUPT_CHECK_CADENCE: u64 = 1024;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Script compilation failed: {0}")]
    Compile(String),
    #[error("Not authorized to call this method: {0}")]
    SandboxViolation(String),
    #[error("{0}")]
    Runtime(String),
    /// The soft evaluation timeout fired. The dispatcher composes the
    /// user-facing message since it knows the threshold and request id.
    #[error("script evaluation cancelled")]
    Cancelled,
    #[error("Timeout during script evaluation triggered by TimedInterruptGuard")]
    Interrupted,
}

/// A bound value: either plain data or a callable definition.
#[derive(Debug, Clone)]
pub(crate) enum Cell {
    Data(Value),
    /// A half-open integer range, kept lazy so huge ranges stream instead of
    /// materializing.
    Range { start: i64, end: i64 },
    Func(Arc<FuncDef>),
    /// The graph capability object, injected as `g`.
    Graph,
}

impl Cell {
    pub(crate) fn type_tag(&self) -> TypeTag {
        match self {
            Cell::Data(Value::Int(_)) => TypeTag::Int,
            Cell::Data(Value::Double(_)) => TypeTag::Double,
            Cell::Data(Value::Str(_)) => TypeTag::Str,
            Cell::Data(Value::Bool(_)) => TypeTag::Bool,
            _ => TypeTag::Any,
        }
    }
}

/// Named bindings for one evaluation scope. Sessions keep one of these alive
/// across requests; sessionless execution builds a fresh one per request.
#[derive(Debug, Default, Clone)]
pub struct Bindings {
    cells: HashMap<String, Cell>,
    /// Declared types, tracked only when the engine runs in interpreter mode.
    types: HashMap<String, TypeTag>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_value(&mut self, name: impl Into<String>, value: Value) {
        self.cells.insert(name.into(), Cell::Data(value));
    }

    /// Returns the bound data value, if the name is bound to plain data.
    pub fn get_value(&self, name: &str) -> Option<&Value> {
        match self.cells.get(name) {
            Some(Cell::Data(value)) => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cells.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub(crate) fn insert_cell(&mut self, name: String, cell: Cell) {
        self.cells.insert(name, cell);
    }

    pub(crate) fn get_cell(&self, name: &str) -> Option<&Cell> {
        self.cells.get(name)
    }

    pub(crate) fn declared_type(&self, name: &str) -> Option<TypeTag> {
        self.types.get(name).copied()
    }

    pub(crate) fn declare_type(&mut self, name: String, tag: TypeTag) {
        self.types.insert(name, tag);
    }
}

/// Everything an evaluation needs besides the script itself.
pub struct EvalContext<'a> {
    pub bindings: &'a mut Bindings,
    pub graph: Option<Arc<dyn GraphBackend>>,
    /// Soft-timeout token; cancelled externally when the evaluation budget
    /// expires.
    pub cancel: CancellationToken,
}

impl<'a> EvalContext<'a> {
    pub fn new(bindings: &'a mut Bindings) -> Self {
        Self {
            bindings,
            graph: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphBackend>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The lazy sequence of results one evaluation produces. Restart is not
/// supported; the response channel pulls each item exactly once.
#[derive(Debug)]
pub enum ResultIter {
    Empty,
    Single(Option<Value>),
    List(std::vec::IntoIter<Value>),
    Range { next: i64, end: i64 },
}

impl Iterator for ResultIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ResultIter::Empty => None,
            ResultIter::Single(slot) => slot.take(),
            ResultIter::List(iter) => iter.next(),
            ResultIter::Range { next, end } => {
                if next < end {
                    let item = Value::Int(*next);
                    *next += 1;
                    Some(item)
                } else {
                    None
                }
            }
        }
    }
}

/// Compiles and evaluates scripts under a capability sandbox.
pub struct ScriptEngine {
    deny_list: HashSet<String>,
    interpreter_mode: bool,
    timed_interrupt: Option<Duration>,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::from_settings(&Settings::default())
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            deny_list: settings.sandbox_deny_list.iter().cloned().collect(),
            interpreter_mode: settings.interpreter_mode,
            timed_interrupt: settings.timed_interrupt(),
        }
    }

    pub fn interpreter_mode(&self) -> bool {
        self.interpreter_mode
    }

    /// Parses the script and applies the sandbox check. Nothing executes
    /// here; a denied call fails compilation before the script ever runs.
    pub fn compile(&self, script: &str) -> Result<Program, ScriptError> {
        let program = parser::parse(script)?;
        self.check_sandbox(&program)?;
        Ok(program)
    }

    /// Evaluates a script to its lazy result sequence. Cancellation via the
    /// context's token or the timed interrupt guard surfaces as
    /// [`ScriptError::Cancelled`] / [`ScriptError::Interrupted`]; either way
    /// the bindings are left untouched by the failed evaluation's declared
    /// locals.
    pub fn evaluate(
        &self,
        script: &str,
        ctx: EvalContext<'_>,
    ) -> Result<ResultIter, ScriptError> {
        let program = self.compile(script)?;
        interp::run(&program, self, ctx)
    }

    pub(crate) fn timed_interrupt_limit(&self) -> Option<Duration> {
        self.timed_interrupt
    }

    fn check_sandbox(&self, program: &Program) -> Result<(), ScriptError> {
        let mut called = Vec::new();
        for stmt in &program.stmts {
            collect_calls_stmt(stmt, &mut called);
        }
        for name in called {
            if self.deny_list.contains(&name) {
                return Err(ScriptError::SandboxViolation(name));
            }
        }
        Ok(())
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_calls_stmt(stmt: &ast::Stmt, out: &mut Vec<String>) {
    match stmt {
        ast::Stmt::FuncDef(def) => {
            for stmt in &def.body {
                collect_calls_stmt(stmt, out);
            }
        }
        ast::Stmt::Declare { init, .. } => collect_calls_expr(init, out),
        ast::Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            collect_calls_expr(cond, out);
            for stmt in then_body.iter().chain(else_body) {
                collect_calls_stmt(stmt, out);
            }
        }
        ast::Stmt::While { cond, body } => {
            collect_calls_expr(cond, out);
            for stmt in body {
                collect_calls_stmt(stmt, out);
            }
        }
        ast::Stmt::Expr(expr) => collect_calls_expr(expr, out),
    }
}

fn collect_calls_expr(expr: &ast::Expr, out: &mut Vec<String>) {
    match expr {
        ast::Expr::Call { name, args } => {
            out.push(name.clone());
            for arg in args {
                collect_calls_expr(arg, out);
            }
        }
        ast::Expr::MethodCall { recv, name, args } => {
            out.push(name.clone());
            collect_calls_expr(recv, out);
            for arg in args {
                collect_calls_expr(arg, out);
            }
        }
        ast::Expr::Assign { value, .. } => collect_calls_expr(value, out),
        ast::Expr::Unary { expr, .. } => collect_calls_expr(expr, out),
        ast::Expr::Binary { lhs, rhs, .. } => {
            collect_calls_expr(lhs, out);
            collect_calls_expr(rhs, out);
        }
        ast::Expr::Property { recv, .. } => collect_calls_expr(recv, out),
        ast::Expr::Index { recv, index } => {
            collect_calls_expr(recv, out);
            collect_calls_expr(index, out);
        }
        ast::Expr::List(items) => {
            for item in items {
                collect_calls_expr(item, out);
            }
        }
        ast::Expr::MapLit(entries) => {
            for (_, item) in entries {
                collect_calls_expr(item, out);
            }
        }
        ast::Expr::Range { start, end, .. } => {
            collect_calls_expr(start, out);
            collect_calls_expr(end, out);
        }
        ast::Expr::Closure(def) => {
            for stmt in &def.body {
                collect_calls_stmt(stmt, out);
            }
        }
        ast::Expr::Literal(_) | ast::Expr::Ident(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_denies_listed_calls_at_compile_time() {
        let engine = ScriptEngine::new();
        let err = engine.compile("exit(0)").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Not authorized to call this method: exit"
        );
    }

    #[test]
    fn sandbox_checks_inside_nested_bodies() {
        let engine = ScriptEngine::new();
        assert!(engine.compile("while(true){ exec('rm') }").is_err());
        assert!(engine.compile("def f(x){ load(x) }; 1").is_err());
    }

    #[test]
    fn undenied_calls_compile() {
        let engine = ScriptEngine::new();
        assert!(engine.compile("sleep(1)").is_ok());
    }

    #[test]
    fn result_iter_range_is_lazy_and_ordered() {
        let iter = ResultIter::Range { next: 0, end: 5 };
        let items: Vec<_> = iter.collect();
        assert_eq!(
            items,
            (0..5).map(Value::Int).collect::<Vec<_>>()
        );
    }
}
