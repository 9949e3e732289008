use std::sync::Arc;

/// Inferred or declared type of a binding; tracked per session when the
/// engine runs in interpreter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Int,
    Double,
    Str,
    Bool,
    Any,
}

impl TypeTag {
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Int => "int",
            TypeTag::Double => "double",
            TypeTag::Str => "string",
            TypeTag::Bool => "bool",
            TypeTag::Any => "def",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "int" | "long" => Some(TypeTag::Int),
            "double" | "float" => Some(TypeTag::Double),
            "string" | "String" => Some(TypeTag::Str),
            "bool" | "boolean" => Some(TypeTag::Bool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lit {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

/// A function or closure body shared between the AST and bound values.
#[derive(Debug, PartialEq)]
pub struct FuncDef {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Lit),
    Ident(String),
    Assign {
        name: String,
        value: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Free function call: builtin, user-defined function, or closure bound
    /// to a name.
    Call {
        name: String,
        args: Vec<Expr>,
    },
    MethodCall {
        recv: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Property {
        recv: Box<Expr>,
        name: String,
    },
    Index {
        recv: Box<Expr>,
        index: Box<Expr>,
    },
    List(Vec<Expr>),
    MapLit(Vec<(String, Expr)>),
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
        inclusive: bool,
    },
    Closure(Arc<FuncDef>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `def name(params) { body }`
    FuncDef(Arc<FuncDef>),
    /// `def x = e` or `int x = e`; the declaration site of a typed local.
    Declare {
        name: String,
        ty: TypeTag,
        init: Expr,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Expr(Expr),
}

/// A parsed, sandbox-checked script ready for evaluation.
#[derive(Debug, PartialEq)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}
