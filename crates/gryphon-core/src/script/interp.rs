//! Tree-walking evaluator for parsed scripts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::graph::GraphBackend;
use crate::value::{Value, VertexRef};

use super::ast::{BinaryOp, Expr, FuncDef, Lit, Program, Stmt, TypeTag, UnaryOp};
use super::{Bindings, Cell, EvalContext, INTERRUPT_CHECK_CADENCE, ResultIter, ScriptEngine, ScriptError};

/// Guards against runaway recursion blowing the native stack.
const MAX_CALL_DEPTH: usize = 64;

/// Granularity of the cancellation checks inside `sleep`.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

pub(super) fn run(
    program: &Program,
    engine: &ScriptEngine,
    ctx: EvalContext<'_>,
) -> Result<ResultIter, ScriptError> {
    let mut interp = Interp {
        globals: ctx.bindings,
        declared: HashMap::new(),
        declared_types: HashMap::new(),
        frames: Vec::new(),
        graph: ctx.graph,
        cancel: ctx.cancel,
        deadline: engine.timed_interrupt_limit().map(|limit| Instant::now() + limit),
        ops: 0,
    };

    let mut last = None;
    for stmt in &program.stmts {
        last = interp.exec_stmt(stmt)?;
    }

    // Declared locals and their types only outlive the evaluation when the
    // engine runs in interpreter mode.
    if engine.interpreter_mode() {
        for (name, cell) in interp.declared.drain() {
            interp.globals.insert_cell(name, cell);
        }
        for (name, tag) in interp.declared_types.drain() {
            interp.globals.declare_type(name, tag);
        }
    }

    Ok(match last {
        None => ResultIter::Empty,
        Some(Cell::Data(Value::List(items))) => ResultIter::List(items.into_iter()),
        Some(Cell::Data(value)) => ResultIter::Single(Some(value)),
        Some(Cell::Range { start, end }) => ResultIter::Range { next: start, end },
        Some(Cell::Func(_) | Cell::Graph) => ResultIter::Empty,
    })
}

struct Interp<'a> {
    globals: &'a mut Bindings,
    /// Locals declared at the top level of this evaluation.
    declared: HashMap<String, Cell>,
    declared_types: HashMap<String, TypeTag>,
    /// Call frames; only the innermost one is visible to the running function.
    frames: Vec<HashMap<String, Cell>>,
    graph: Option<Arc<dyn GraphBackend>>,
    cancel: tokio_util::sync::CancellationToken,
    deadline: Option<Instant>,
    ops: u64,
}

impl Interp<'_> {
    /// Counts one interpreter operation and checks the hard deadline at the
    /// configured cadence. This is the only interruption point a pathological
    /// loop cannot avoid.
    fn tick(&mut self) -> Result<(), ScriptError> {
        self.ops += 1;
        if self.ops % INTERRUPT_CHECK_CADENCE == 0 {
            if let Some(deadline) = self.deadline
                && Instant::now() >= deadline
            {
                return Err(ScriptError::Interrupted);
            }
        }
        Ok(())
    }

    fn check_cancelled(&mut self) -> Result<(), ScriptError> {
        if self.cancel.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(ScriptError::Interrupted);
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Option<Cell>, ScriptError> {
        self.check_cancelled()?;
        self.tick()?;
        match stmt {
            Stmt::FuncDef(def) => {
                let name = def
                    .name
                    .clone()
                    .ok_or_else(|| ScriptError::Runtime("function definition without a name".to_string()))?;
                self.bind(name, Cell::Func(Arc::clone(def)));
                Ok(None)
            }
            Stmt::Declare { name, ty, init } => {
                let cell = self.eval(init)?;
                let cell = coerce_declared(cell, *ty)?;
                let tag = if *ty == TypeTag::Any {
                    cell.type_tag()
                } else {
                    *ty
                };
                if let Some(frame) = self.frames.last_mut() {
                    frame.insert(name.clone(), cell.clone());
                } else {
                    self.declared.insert(name.clone(), cell.clone());
                    self.declared_types.insert(name.clone(), tag);
                }
                Ok(Some(cell))
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let branch = if self.eval_bool(cond)? {
                    then_body
                } else {
                    else_body
                };
                for stmt in branch {
                    self.exec_stmt(stmt)?;
                }
                Ok(None)
            }
            Stmt::While { cond, body } => {
                while self.eval_bool(cond)? {
                    self.check_cancelled()?;
                    for stmt in body {
                        self.exec_stmt(stmt)?;
                    }
                }
                Ok(None)
            }
            Stmt::Expr(expr) => Ok(Some(self.eval(expr)?)),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Cell, ScriptError> {
        self.tick()?;
        match expr {
            Expr::Literal(lit) => Ok(Cell::Data(match lit {
                Lit::Null => Value::Null,
                Lit::Bool(b) => Value::Bool(*b),
                Lit::Int(i) => Value::Int(*i),
                Lit::Double(d) => Value::Double(*d),
                Lit::Str(s) => Value::Str(s.clone()),
            })),
            Expr::Ident(name) => self.lookup(name),
            Expr::Assign { name, value } => {
                let cell = self.eval(value)?;
                self.assign(name, cell.clone())?;
                Ok(cell)
            }
            Expr::Unary { op, expr } => {
                let value = self.eval_value(expr)?;
                match (op, value) {
                    (UnaryOp::Neg, Value::Int(i)) => Ok(Cell::Data(Value::Int(
                        i.checked_neg()
                            .ok_or_else(|| ScriptError::Runtime("integer overflow".to_string()))?,
                    ))),
                    (UnaryOp::Neg, Value::Double(d)) => Ok(Cell::Data(Value::Double(-d))),
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Cell::Data(Value::Bool(!b))),
                    (op, value) => Err(ScriptError::Runtime(format!(
                        "cannot apply {} to {}",
                        match op {
                            UnaryOp::Neg => "-",
                            UnaryOp::Not => "!",
                        },
                        value.type_name()
                    ))),
                }
            }
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs),
            Expr::Call { name, args } => self.call_function(name, args),
            Expr::MethodCall { recv, name, args } => {
                let recv = self.eval(recv)?;
                self.call_method(recv, name, args)
            }
            Expr::Property { recv, name } => {
                let recv = self.eval_value(recv)?;
                self.property(&recv, name)
            }
            Expr::Index { recv, index } => {
                let recv = self.eval(recv)?;
                let index = self.eval_value(index)?;
                self.index(recv, &index)
            }
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_value(item)?);
                }
                Ok(Cell::Data(Value::List(out)))
            }
            Expr::MapLit(entries) => {
                let mut out = BTreeMap::new();
                for (key, item) in entries {
                    let value = self.eval_value(item)?;
                    out.insert(key.clone(), value);
                }
                Ok(Cell::Data(Value::Map(out)))
            }
            Expr::Range {
                start,
                end,
                inclusive,
            } => {
                let start = self.eval_int(start)?;
                let end = self.eval_int(end)?;
                let end = if *inclusive {
                    end.checked_add(1)
                        .ok_or_else(|| ScriptError::Runtime("integer overflow".to_string()))?
                } else {
                    end
                };
                Ok(Cell::Range { start, end })
            }
            Expr::Closure(def) => Ok(Cell::Func(Arc::clone(def))),
        }
    }

    /// Evaluates to plain data, materializing ranges.
    fn eval_value(&mut self, expr: &Expr) -> Result<Value, ScriptError> {
        let cell = self.eval(expr)?;
        self.cell_value(cell)
    }

    fn cell_value(&mut self, cell: Cell) -> Result<Value, ScriptError> {
        match cell {
            Cell::Data(value) => Ok(value),
            Cell::Range { start, end } => {
                let mut items = Vec::new();
                let mut next = start;
                while next < end {
                    self.tick()?;
                    items.push(Value::Int(next));
                    next += 1;
                }
                Ok(Value::List(items))
            }
            Cell::Func(_) => Err(ScriptError::Runtime(
                "cannot use a function as a value".to_string(),
            )),
            Cell::Graph => Err(ScriptError::Runtime(
                "cannot use the graph as a value".to_string(),
            )),
        }
    }

    fn eval_bool(&mut self, expr: &Expr) -> Result<bool, ScriptError> {
        match self.eval_value(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(ScriptError::Runtime(format!(
                "condition must be a bool, got {}",
                other.type_name()
            ))),
        }
    }

    fn eval_int(&mut self, expr: &Expr) -> Result<i64, ScriptError> {
        match self.eval_value(expr)? {
            Value::Int(i) => Ok(i),
            other => Err(ScriptError::Runtime(format!(
                "expected an int, got {}",
                other.type_name()
            ))),
        }
    }

    fn lookup(&mut self, name: &str) -> Result<Cell, ScriptError> {
        if let Some(frame) = self.frames.last()
            && let Some(cell) = frame.get(name)
        {
            return Ok(cell.clone());
        }
        if let Some(cell) = self.declared.get(name) {
            return Ok(cell.clone());
        }
        if let Some(cell) = self.globals.get_cell(name) {
            return Ok(cell.clone());
        }
        if name == "g" && self.graph.is_some() {
            return Ok(Cell::Graph);
        }
        Err(ScriptError::Runtime(format!("No such property: {name}")))
    }

    /// Writes a name. Assignments inside a function stay in its frame; at the
    /// top level they update a declared local (with its type enforced) or
    /// fall through to the persistent bindings.
    fn assign(&mut self, name: &str, cell: Cell) -> Result<(), ScriptError> {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), cell);
            return Ok(());
        }
        if self.declared.contains_key(name) {
            let tag = self.declared_types.get(name).copied().unwrap_or(TypeTag::Any);
            let cell = check_assign(cell, tag, name)?;
            self.declared.insert(name.to_string(), cell);
            return Ok(());
        }
        if let Some(tag) = self.globals.declared_type(name) {
            let cell = check_assign(cell, tag, name)?;
            self.globals.insert_cell(name.to_string(), cell);
            return Ok(());
        }
        self.globals.insert_cell(name.to_string(), cell);
        Ok(())
    }

    fn bind(&mut self, name: String, cell: Cell) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name, cell);
        } else {
            // Function definitions always persist, even outside interpreter
            // mode.
            self.globals.insert_cell(name, cell);
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Cell, ScriptError> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let left = self.eval_bool(lhs)?;
            let short = match op {
                BinaryOp::And => !left,
                _ => left,
            };
            if short {
                return Ok(Cell::Data(Value::Bool(left)));
            }
            let right = self.eval_bool(rhs)?;
            return Ok(Cell::Data(Value::Bool(right)));
        }

        let left = self.eval_value(lhs)?;
        let right = self.eval_value(rhs)?;
        let result = match op {
            BinaryOp::Eq => Value::Bool(loose_eq(&left, &right)),
            BinaryOp::NotEq => Value::Bool(!loose_eq(&left, &right)),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                let ord = compare(&left, &right)?;
                Value::Bool(match op {
                    BinaryOp::Lt => ord.is_lt(),
                    BinaryOp::LtEq => ord.is_le(),
                    BinaryOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                })
            }
            BinaryOp::Add => add(left, right)?,
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                arith(op, left, right)?
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };
        Ok(Cell::Data(result))
    }

    fn call_function(&mut self, name: &str, args: &[Expr]) -> Result<Cell, ScriptError> {
        match name {
            "sleep" => {
                let [ms] = args else {
                    return Err(ScriptError::Runtime(
                        "sleep expects one argument".to_string(),
                    ));
                };
                let ms = self.eval_int(ms)?;
                let ms = u64::try_from(ms)
                    .map_err(|_| ScriptError::Runtime("sleep duration must be non-negative".to_string()))?;
                self.sleep(Duration::from_millis(ms))?;
                return Ok(Cell::Data(Value::Null));
            }
            "range" => {
                let [start, end] = args else {
                    return Err(ScriptError::Runtime(
                        "range expects two arguments".to_string(),
                    ));
                };
                let start = self.eval_int(start)?;
                let end = self.eval_int(end)?;
                return Ok(Cell::Range { start, end });
            }
            "len" => {
                let [arg] = args else {
                    return Err(ScriptError::Runtime("len expects one argument".to_string()));
                };
                let len = match self.eval(arg)? {
                    Cell::Range { start, end } => (end - start).max(0),
                    cell => match self.cell_value(cell)? {
                        Value::List(items) => items.len() as i64,
                        Value::Map(entries) => entries.len() as i64,
                        Value::Str(s) => s.chars().count() as i64,
                        other => {
                            return Err(ScriptError::Runtime(format!(
                                "len is not defined for {}",
                                other.type_name()
                            )));
                        }
                    },
                };
                return Ok(Cell::Data(Value::Int(len)));
            }
            _ => {}
        }

        let cell = self.lookup(name).map_err(|_| {
            ScriptError::Runtime(format!("No signature of method: {name}"))
        })?;
        match cell {
            Cell::Func(def) => self.call_func_def(&def, args),
            _ => Err(ScriptError::Runtime(format!(
                "No signature of method: {name}"
            ))),
        }
    }

    fn call_func_def(&mut self, def: &FuncDef, args: &[Expr]) -> Result<Cell, ScriptError> {
        if args.len() != def.params.len() {
            let name = def.name.as_deref().unwrap_or("<closure>");
            return Err(ScriptError::Runtime(format!(
                "function '{}' expects {} arguments, got {}",
                name,
                def.params.len(),
                args.len()
            )));
        }
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(ScriptError::Runtime("call depth limit exceeded".to_string()));
        }
        let mut frame = HashMap::with_capacity(def.params.len());
        for (param, arg) in def.params.iter().zip(args) {
            let cell = self.eval(arg)?;
            frame.insert(param.clone(), cell);
        }
        self.frames.push(frame);
        let mut last = None;
        let result = def.body.iter().try_fold((), |(), stmt| {
            last = self.exec_stmt(stmt)?;
            Ok::<(), ScriptError>(())
        });
        self.frames.pop();
        result?;
        // The last evaluated expression is the implicit return value.
        Ok(last.unwrap_or(Cell::Data(Value::Null)))
    }

    /// Sleeps in short slices so cancellation and the interrupt deadline are
    /// observed mid-sleep.
    fn sleep(&mut self, total: Duration) -> Result<(), ScriptError> {
        let wake = Instant::now() + total;
        loop {
            self.check_cancelled()?;
            let now = Instant::now();
            if now >= wake {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(wake - now));
        }
    }

    fn call_method(&mut self, recv: Cell, name: &str, args: &[Expr]) -> Result<Cell, ScriptError> {
        match recv {
            Cell::Graph => self.call_graph_method(name, args),
            Cell::Func(def) if name == "call" => self.call_func_def(&def, args),
            Cell::Data(Value::Vertex(v)) => self.call_vertex_method(v, name, args),
            Cell::Data(Value::Edge(e)) => {
                let args = self.eval_args(args)?;
                match (name, args.as_slice()) {
                    ("property", [Value::Str(key)]) => Ok(Cell::Data(
                        e.properties.get(key).cloned().unwrap_or(Value::Null),
                    )),
                    ("property", [Value::Str(key), value]) => {
                        self.graph()?
                            .set_edge_property(e.id, key, value.clone())
                            .map_err(runtime)?;
                        let updated = self.graph()?.edge(e.id).map_err(runtime)?;
                        Ok(Cell::Data(
                            updated.map(Value::Edge).unwrap_or(Value::Null),
                        ))
                    }
                    ("removeProperty", [Value::Str(key)]) => {
                        let old = self
                            .graph()?
                            .remove_edge_property(e.id, key)
                            .map_err(runtime)?;
                        Ok(Cell::Data(old.unwrap_or(Value::Null)))
                    }
                    ("remove", []) => {
                        self.graph()?.remove_edge(e.id).map_err(runtime)?;
                        Ok(Cell::Data(Value::Null))
                    }
                    _ => Err(no_signature(name, "edge")),
                }
            }
            Cell::Data(Value::List(items)) => {
                let args = self.eval_args(args)?;
                match (name, args.as_slice()) {
                    ("size", []) => Ok(Cell::Data(Value::Int(items.len() as i64))),
                    ("isEmpty", []) => Ok(Cell::Data(Value::Bool(items.is_empty()))),
                    ("contains", [needle]) => {
                        Ok(Cell::Data(Value::Bool(items.contains(needle))))
                    }
                    _ => Err(no_signature(name, "list")),
                }
            }
            Cell::Data(Value::Map(entries)) => {
                let args = self.eval_args(args)?;
                match (name, args.as_slice()) {
                    ("size", []) => Ok(Cell::Data(Value::Int(entries.len() as i64))),
                    ("get", [Value::Str(key)]) => Ok(Cell::Data(
                        entries.get(key).cloned().unwrap_or(Value::Null),
                    )),
                    ("containsKey", [Value::Str(key)]) => {
                        Ok(Cell::Data(Value::Bool(entries.contains_key(key))))
                    }
                    _ => Err(no_signature(name, "map")),
                }
            }
            Cell::Data(Value::Str(s)) => {
                let args = self.eval_args(args)?;
                match (name, args.as_slice()) {
                    ("length" | "size", []) => {
                        Ok(Cell::Data(Value::Int(s.chars().count() as i64)))
                    }
                    _ => Err(no_signature(name, "string")),
                }
            }
            Cell::Range { start, end } => {
                let args = self.eval_args(args)?;
                match (name, args.as_slice()) {
                    ("size", []) => Ok(Cell::Data(Value::Int((end - start).max(0)))),
                    ("toList", []) => {
                        let value = self.cell_value(Cell::Range { start, end })?;
                        Ok(Cell::Data(value))
                    }
                    _ => Err(no_signature(name, "range")),
                }
            }
            Cell::Data(other) => Err(no_signature(name, other.type_name())),
            Cell::Func(_) => Err(no_signature(name, "closure")),
        }
    }

    fn call_graph_method(&mut self, name: &str, args: &[Expr]) -> Result<Cell, ScriptError> {
        let args = self.eval_args(args)?;
        match (name, args.as_slice()) {
            ("addVertex", rest) => {
                // Optional leading label, then alternating key/value pairs.
                let (label, pairs) = if rest.len() % 2 == 1 {
                    match &rest[0] {
                        Value::Str(label) => (label.as_str(), &rest[1..]),
                        other => {
                            return Err(ScriptError::Runtime(format!(
                                "vertex label must be a string, got {}",
                                other.type_name()
                            )));
                        }
                    }
                } else {
                    ("vertex", rest)
                };
                let vertex = self.graph()?.add_vertex(label).map_err(runtime)?;
                for pair in pairs.chunks(2) {
                    let Value::Str(key) = &pair[0] else {
                        return Err(ScriptError::Runtime(format!(
                            "property key must be a string, got {}",
                            pair[0].type_name()
                        )));
                    };
                    self.graph()?
                        .set_vertex_property(vertex.id, key, pair[1].clone())
                        .map_err(runtime)?;
                }
                Ok(Cell::Data(self.refreshed_vertex(vertex.id)?))
            }
            ("addEdge", [Value::Str(label), out_v, in_v]) => {
                let out_v = element_id(out_v)?;
                let in_v = element_id(in_v)?;
                let edge = self.graph()?.add_edge(label, out_v, in_v).map_err(runtime)?;
                Ok(Cell::Data(Value::Edge(edge)))
            }
            ("vertex", [id]) => {
                let id = element_id(id)?;
                let found = self.graph()?.vertex(id).map_err(runtime)?;
                Ok(Cell::Data(found.map(Value::Vertex).unwrap_or(Value::Null)))
            }
            ("edge", [id]) => {
                let id = element_id(id)?;
                let found = self.graph()?.edge(id).map_err(runtime)?;
                Ok(Cell::Data(found.map(Value::Edge).unwrap_or(Value::Null)))
            }
            ("vertices" | "V", []) => {
                let all = self.graph()?.vertices().map_err(runtime)?;
                Ok(Cell::Data(Value::List(
                    all.into_iter().map(Value::Vertex).collect(),
                )))
            }
            ("edges" | "E", []) => {
                let all = self.graph()?.edges().map_err(runtime)?;
                Ok(Cell::Data(Value::List(
                    all.into_iter().map(Value::Edge).collect(),
                )))
            }
            _ => Err(no_signature(name, "graph")),
        }
    }

    fn call_vertex_method(
        &mut self,
        vertex: VertexRef,
        name: &str,
        args: &[Expr],
    ) -> Result<Cell, ScriptError> {
        let args = self.eval_args(args)?;
        match (name, args.as_slice()) {
            ("property", [Value::Str(key)]) => Ok(Cell::Data(
                vertex.properties.get(key).cloned().unwrap_or(Value::Null),
            )),
            ("property", [Value::Str(key), value]) => {
                self.graph()?
                    .set_vertex_property(vertex.id, key, value.clone())
                    .map_err(runtime)?;
                Ok(Cell::Data(self.refreshed_vertex(vertex.id)?))
            }
            ("removeProperty", [Value::Str(key)]) => {
                let old = self
                    .graph()?
                    .remove_vertex_property(vertex.id, key)
                    .map_err(runtime)?;
                Ok(Cell::Data(old.unwrap_or(Value::Null)))
            }
            ("metaProperty", [Value::Str(key), Value::Str(meta_key), value]) => {
                self.graph()?
                    .set_meta_property(vertex.id, key, meta_key, value.clone())
                    .map_err(runtime)?;
                Ok(Cell::Data(self.refreshed_vertex(vertex.id)?))
            }
            ("removeMetaProperty", [Value::Str(key), Value::Str(meta_key)]) => {
                let old = self
                    .graph()?
                    .remove_meta_property(vertex.id, key, meta_key)
                    .map_err(runtime)?;
                Ok(Cell::Data(old.unwrap_or(Value::Null)))
            }
            ("addEdge", [Value::Str(label), in_v]) => {
                let in_v = element_id(in_v)?;
                let edge = self
                    .graph()?
                    .add_edge(label, vertex.id, in_v)
                    .map_err(runtime)?;
                Ok(Cell::Data(Value::Edge(edge)))
            }
            ("remove", []) => {
                self.graph()?.remove_vertex(vertex.id).map_err(runtime)?;
                Ok(Cell::Data(Value::Null))
            }
            _ => Err(no_signature(name, "vertex")),
        }
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>, ScriptError> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            out.push(self.eval_value(arg)?);
        }
        Ok(out)
    }

    fn graph(&self) -> Result<&Arc<dyn GraphBackend>, ScriptError> {
        self.graph.as_ref().ok_or_else(|| {
            ScriptError::Runtime("no graph is configured for this evaluation".to_string())
        })
    }

    fn refreshed_vertex(&self, id: u64) -> Result<Value, ScriptError> {
        let found = self.graph()?.vertex(id).map_err(runtime)?;
        Ok(found.map(Value::Vertex).unwrap_or(Value::Null))
    }

    fn property(&mut self, recv: &Value, name: &str) -> Result<Cell, ScriptError> {
        let value = match recv {
            Value::Vertex(v) => match name {
                "id" => Value::Int(v.id as i64),
                "label" => Value::Str(v.label.clone()),
                key => v.properties.get(key).cloned().unwrap_or(Value::Null),
            },
            Value::Edge(e) => match name {
                "id" => Value::Int(e.id as i64),
                "label" => Value::Str(e.label.clone()),
                "outV" => Value::Int(e.out_v as i64),
                "inV" => Value::Int(e.in_v as i64),
                key => e.properties.get(key).cloned().unwrap_or(Value::Null),
            },
            Value::Map(entries) => entries.get(name).cloned().unwrap_or(Value::Null),
            other => {
                return Err(ScriptError::Runtime(format!(
                    "No such property: {name} for {}",
                    other.type_name()
                )));
            }
        };
        Ok(Cell::Data(value))
    }

    fn index(&mut self, recv: Cell, index: &Value) -> Result<Cell, ScriptError> {
        let value = match (recv, index) {
            (Cell::Range { start, end }, Value::Int(i)) => {
                let at = start.checked_add(*i);
                match at {
                    Some(at) if *i >= 0 && at < end => Value::Int(at),
                    _ => {
                        return Err(ScriptError::Runtime(format!("index out of bounds: {i}")));
                    }
                }
            }
            (Cell::Data(Value::List(items)), Value::Int(i)) => {
                let at = usize::try_from(*i)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned();
                at.ok_or_else(|| ScriptError::Runtime(format!("index out of bounds: {i}")))?
            }
            (Cell::Data(Value::Str(s)), Value::Int(i)) => {
                let ch = usize::try_from(*i).ok().and_then(|i| s.chars().nth(i));
                match ch {
                    Some(ch) => Value::Str(ch.to_string()),
                    None => {
                        return Err(ScriptError::Runtime(format!("index out of bounds: {i}")));
                    }
                }
            }
            (Cell::Data(Value::Map(entries)), Value::Str(key)) => {
                entries.get(key).cloned().unwrap_or(Value::Null)
            }
            (recv, index) => {
                let recv = self.cell_value(recv)?;
                return Err(ScriptError::Runtime(format!(
                    "cannot index {} with {}",
                    recv.type_name(),
                    index.type_name()
                )));
            }
        };
        Ok(Cell::Data(value))
    }
}

fn runtime(err: crate::error::Error) -> ScriptError {
    ScriptError::Runtime(err.to_string())
}

fn no_signature(name: &str, recv: &str) -> ScriptError {
    ScriptError::Runtime(format!("No signature of method: {recv}.{name}"))
}

fn element_id(value: &Value) -> Result<u64, ScriptError> {
    match value {
        Value::Int(i) if *i >= 0 => Ok(*i as u64),
        Value::Vertex(v) => Ok(v.id),
        other => Err(ScriptError::Runtime(format!(
            "expected an element id or vertex, got {}",
            other.type_name()
        ))),
    }
}

/// Checks a declaration initializer against its declared type, coercing int
/// to double where the declaration asks for one.
fn coerce_declared(cell: Cell, ty: TypeTag) -> Result<Cell, ScriptError> {
    if ty == TypeTag::Any {
        return Ok(cell);
    }
    match (&cell, ty) {
        (Cell::Data(Value::Int(_)), TypeTag::Int)
        | (Cell::Data(Value::Double(_)), TypeTag::Double)
        | (Cell::Data(Value::Str(_)), TypeTag::Str)
        | (Cell::Data(Value::Bool(_)), TypeTag::Bool) => Ok(cell),
        (Cell::Data(Value::Int(i)), TypeTag::Double) => Ok(Cell::Data(Value::Double(*i as f64))),
        _ => Err(cast_error(&cell, ty)),
    }
}

fn check_assign(cell: Cell, tag: TypeTag, _name: &str) -> Result<Cell, ScriptError> {
    coerce_declared(cell, tag)
}

fn cast_error(cell: &Cell, ty: TypeTag) -> ScriptError {
    let from = match cell {
        Cell::Data(value) => value.type_name().to_string(),
        Cell::Range { .. } => "range".to_string(),
        Cell::Func(_) => "closure".to_string(),
        Cell::Graph => "graph".to_string(),
    };
    ScriptError::Runtime(format!("Cannot cast value of type {from} to {}", ty.name()))
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(l), Value::Double(r)) | (Value::Double(r), Value::Int(l)) => *l as f64 == *r,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ScriptError> {
    use std::cmp::Ordering;
    let ord = match (left, right) {
        (Value::Int(l), Value::Int(r)) => l.cmp(r),
        (Value::Str(l), Value::Str(r)) => l.cmp(r),
        (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
            let l = as_f64(left);
            let r = as_f64(right);
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        }
        _ => {
            return Err(ScriptError::Runtime(format!(
                "cannot compare {} with {}",
                left.type_name(),
                right.type_name()
            )));
        }
    };
    Ok(ord)
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Double(d) => *d,
        _ => f64::NAN,
    }
}

fn add(left: Value, right: Value) -> Result<Value, ScriptError> {
    Ok(match (left, right) {
        (Value::Int(l), Value::Int(r)) => Value::Int(
            l.checked_add(r)
                .ok_or_else(|| ScriptError::Runtime("integer overflow".to_string()))?,
        ),
        (Value::Str(l), r) => Value::Str(format!("{l}{r}")),
        (l @ (Value::Int(_) | Value::Double(_)), r @ (Value::Int(_) | Value::Double(_))) => {
            Value::Double(as_f64(&l) + as_f64(&r))
        }
        (Value::List(mut l), Value::List(r)) => {
            l.extend(r);
            Value::List(l)
        }
        (l, r) => {
            return Err(ScriptError::Runtime(format!(
                "cannot add {} and {}",
                l.type_name(),
                r.type_name()
            )));
        }
    })
}

fn arith(op: BinaryOp, left: Value, right: Value) -> Result<Value, ScriptError> {
    let overflow = || ScriptError::Runtime("integer overflow".to_string());
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => {
            let result = match op {
                BinaryOp::Sub => l.checked_sub(r).ok_or_else(overflow)?,
                BinaryOp::Mul => l.checked_mul(r).ok_or_else(overflow)?,
                BinaryOp::Div => {
                    if r == 0 {
                        return Err(ScriptError::Runtime("Division by zero".to_string()));
                    }
                    l.checked_div(r).ok_or_else(overflow)?
                }
                BinaryOp::Rem => {
                    if r == 0 {
                        return Err(ScriptError::Runtime("Division by zero".to_string()));
                    }
                    l.checked_rem(r).ok_or_else(overflow)?
                }
                _ => unreachable!("arith covers -, *, /, %"),
            };
            Ok(Value::Int(result))
        }
        (l @ (Value::Int(_) | Value::Double(_)), r @ (Value::Int(_) | Value::Double(_))) => {
            let l = as_f64(&l);
            let r = as_f64(&r);
            let result = match op {
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div => l / r,
                BinaryOp::Rem => l % r,
                _ => unreachable!("arith covers -, *, /, %"),
            };
            Ok(Value::Double(result))
        }
        (l, r) => Err(ScriptError::Runtime(format!(
            "cannot apply arithmetic to {} and {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use tokio_util::sync::CancellationToken;

    use crate::graph::{GraphBackend, MemoryGraph};
    use crate::script::{Bindings, EvalContext, ResultIter, ScriptEngine, ScriptError};
    use crate::settings::Settings;
    use crate::value::Value;

    fn eval_one(engine: &ScriptEngine, bindings: &mut Bindings, script: &str) -> Value {
        let iter = engine
            .evaluate(script, EvalContext::new(bindings))
            .unwrap();
        let mut items: Vec<_> = iter.collect();
        assert_eq!(items.len(), 1, "expected one result from '{script}'");
        items.remove(0)
    }

    fn eval_all(engine: &ScriptEngine, bindings: &mut Bindings, script: &str) -> Vec<Value> {
        engine
            .evaluate(script, EvalContext::new(bindings))
            .unwrap()
            .collect()
    }

    #[test]
    fn arithmetic_and_precedence() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        assert_eq!(eval_one(&engine, &mut b, "1 + 1"), Value::Int(2));
        assert_eq!(eval_one(&engine, &mut b, "2 + 3 * 4"), Value::Int(14));
        assert_eq!(eval_one(&engine, &mut b, "(2 + 3) * 4"), Value::Int(20));
        assert_eq!(eval_one(&engine, &mut b, "7 / 2"), Value::Int(3));
        assert_eq!(eval_one(&engine, &mut b, "7.0 / 2"), Value::Double(3.5));
        assert_eq!(eval_one(&engine, &mut b, "'a' + 1"), Value::Str("a1".into()));
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        let err = engine
            .evaluate("1 / 0", EvalContext::new(&mut b))
            .unwrap_err();
        assert!(matches!(err, ScriptError::Runtime(_)));
        assert_eq!(err.to_string(), "Division by zero");
    }

    #[test]
    fn bare_assignments_persist_in_bindings() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        eval_one(&engine, &mut b, "x = 41");
        assert_eq!(eval_one(&engine, &mut b, "x + 1"), Value::Int(42));
        assert_eq!(b.get_value("x"), Some(&Value::Int(41)));
    }

    #[test]
    fn function_definitions_persist_across_evaluations() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        eval_all(&engine, &mut b, "def subtractAway(x, y) { x - y }; []");
        assert_eq!(
            eval_one(&engine, &mut b, "subtractAway(10, 4)"),
            Value::Int(6)
        );
    }

    #[test]
    fn closures_are_callable_values() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        // A closure is not a data result, so the assignment yields nothing.
        assert!(eval_all(&engine, &mut b, "multiplyIt = { x, y -> x * y }").is_empty());
        assert_eq!(eval_one(&engine, &mut b, "multiplyIt(6, 7)"), Value::Int(42));
        assert_eq!(
            eval_one(&engine, &mut b, "multiplyIt.call(2, 3)"),
            Value::Int(6)
        );
    }

    #[test]
    fn declared_locals_do_not_persist_without_interpreter_mode() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        eval_one(&engine, &mut b, "def x = 1");
        let err = engine
            .evaluate("x", EvalContext::new(&mut b))
            .unwrap_err();
        assert_eq!(err.to_string(), "No such property: x");
    }

    #[test]
    fn interpreter_mode_persists_declared_locals_and_types() {
        let engine = ScriptEngine::from_settings(&Settings {
            interpreter_mode: true,
            ..Settings::default()
        });
        let mut b = Bindings::new();
        eval_one(&engine, &mut b, "def x = 1");
        eval_one(&engine, &mut b, "int y = x + 1");
        assert_eq!(eval_one(&engine, &mut b, "x + y"), Value::Int(3));

        // The inferred type is enforced on later assignments.
        let err = engine
            .evaluate("x = 'nope'", EvalContext::new(&mut b))
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot cast value of type string to int");
    }

    #[test]
    fn typed_declaration_rejects_mismatched_initializer() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        let err = engine
            .evaluate("int x = 'a'", EvalContext::new(&mut b))
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot cast value of type string to int");
    }

    #[test]
    fn list_results_unroll_into_multiple_items() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        let items = eval_all(&engine, &mut b, "[1, 2, 3]");
        assert_eq!(items, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn inclusive_and_exclusive_ranges() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        assert_eq!(eval_all(&engine, &mut b, "[0..4]").len(), 5);
        assert_eq!(eval_all(&engine, &mut b, "(0..<4)").len(), 4);
    }

    #[test]
    fn large_range_result_stays_lazy() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        let start = Instant::now();
        let iter = engine
            .evaluate("(0..<100000)", EvalContext::new(&mut b))
            .unwrap();
        assert!(start.elapsed().as_millis() < 500);
        assert!(matches!(iter, ResultIter::Range { .. }));
        assert_eq!(iter.count(), 100_000);
    }

    #[test]
    fn empty_list_yields_no_items() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        assert!(eval_all(&engine, &mut b, "[]").is_empty());
    }

    #[test]
    fn map_literals_and_indexing() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        assert_eq!(
            eval_one(&engine, &mut b, "m = [name: 'marko', age: 29]; m['name']"),
            Value::Str("marko".into())
        );
        assert_eq!(eval_one(&engine, &mut b, "m.age"), Value::Int(29));
        assert_eq!(eval_one(&engine, &mut b, "m.size()"), Value::Int(2));
    }

    #[test]
    fn while_loop_and_comparison() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        let result = eval_one(
            &engine,
            &mut b,
            "total = 0\nn = 0\nwhile (n < 10) { total = total + n; n = n + 1 }\ntotal",
        );
        assert_eq!(result, Value::Int(45));
    }

    #[test]
    fn cancelled_token_aborts_a_sleep() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        let err = engine
            .evaluate(
                "sleep(10000)",
                EvalContext::new(&mut b).with_cancel(cancel),
            )
            .unwrap_err();
        assert!(matches!(err, ScriptError::Cancelled));
        assert!(start.elapsed().as_secs() < 2);
    }

    #[test]
    fn timed_interrupt_stops_a_tight_loop() {
        let engine = ScriptEngine::from_settings(&Settings {
            timed_interrupt_ms: Some(100),
            ..Settings::default()
        });
        let mut b = Bindings::new();
        let start = Instant::now();
        let err = engine
            .evaluate("while (true) { }", EvalContext::new(&mut b))
            .unwrap_err();
        assert!(matches!(err, ScriptError::Interrupted));
        assert_eq!(
            err.to_string(),
            "Timeout during script evaluation triggered by TimedInterruptGuard"
        );
        assert!(start.elapsed().as_secs() < 5);
    }

    #[test]
    fn graph_scripts_mutate_and_read() {
        let engine = ScriptEngine::new();
        let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        let mut b = Bindings::new();

        let vertex = eval_one_with_graph(
            &engine,
            &mut b,
            &graph,
            "v = g.addVertex('person', 'name', 'marko'); v",
        );
        let Value::Vertex(v) = vertex else {
            panic!("expected a vertex, got {vertex:?}");
        };
        assert_eq!(v.label, "person");
        assert_eq!(v.properties.get("name"), Some(&Value::Str("marko".into())));

        assert_eq!(
            eval_one_with_graph(&engine, &mut b, &graph, "v.property('name')"),
            Value::Str("marko".into())
        );

        let count = eval_one_with_graph(
            &engine,
            &mut b,
            &graph,
            "g.addVertex('software', 'name', 'lop'); g.V().size()",
        );
        assert_eq!(count, Value::Int(2));
    }

    #[test]
    fn graph_edges_from_script() {
        let engine = ScriptEngine::new();
        let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        let mut b = Bindings::new();
        let weight = eval_one_with_graph(
            &engine,
            &mut b,
            &graph,
            "a = g.addVertex()\n\
             b = g.addVertex()\n\
             e = g.addEdge('knows', a, b)\n\
             e = e.property('weight', 0.5)\n\
             e.property('weight')",
        );
        assert_eq!(weight, Value::Double(0.5));
    }

    #[test]
    fn scripts_without_a_graph_cannot_see_g() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        let err = engine
            .evaluate("g.addVertex()", EvalContext::new(&mut b))
            .unwrap_err();
        assert_eq!(err.to_string(), "No such property: g");
    }

    #[test]
    fn unknown_method_reports_no_signature() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        let err = engine
            .evaluate("'abc'.frobnicate()", EvalContext::new(&mut b))
            .unwrap_err();
        assert_eq!(err.to_string(), "No signature of method: string.frobnicate");
    }

    #[test]
    fn recursion_depth_is_bounded() {
        let engine = ScriptEngine::new();
        let mut b = Bindings::new();
        let err = engine
            .evaluate("def f(x) { f(x) }; f(1)", EvalContext::new(&mut b))
            .unwrap_err();
        assert_eq!(err.to_string(), "call depth limit exceeded");
    }

    fn eval_one_with_graph(
        engine: &ScriptEngine,
        bindings: &mut Bindings,
        graph: &Arc<dyn GraphBackend>,
        script: &str,
    ) -> Value {
        let ctx = EvalContext::new(bindings).with_graph(Arc::clone(graph));
        let mut items: Vec<_> = engine.evaluate(script, ctx).unwrap().collect();
        assert_eq!(items.len(), 1, "expected one result from '{script}'");
        items.remove(0)
    }
}
