//! Expression AST nodes

use super::{Span, Spanned, Type};
use serde::{Deserialize, Serialize};

/// Expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Integer literal
    IntLit(i64),
    /// Float literal
    FloatLit(f64),
    /// Boolean literal
    BoolLit(bool),
    /// String literal (escapes already processed by the lexer)
    StringLit(String),
    /// Character literal
    CharLit(char),
    /// Null pointer literal
    Null,
    /// Unit value
    Unit,

    /// Variable reference
    Var(String),

    /// Binary operation
    Binary {
        left: Box<Spanned<Expr>>,
        op: BinOp,
        right: Box<Spanned<Expr>>,
    },

    /// Unary operation
    Unary {
        op: UnOp,
        expr: Box<Spanned<Expr>>,
    },

    /// Conditional: if cond { then_branch } else { else_branch }
    If {
        cond: Box<Spanned<Expr>>,
        then_branch: Box<Spanned<Expr>>,
        else_branch: Box<Spanned<Expr>>,
    },

    /// Let binding: `let [var] name = value; body`
    ///
    /// Blocks are desugared into right-nested chains of these; an
    /// expression statement becomes a binding named `_`.
    Let {
        name: String,
        mutable: bool,
        ty: Option<Spanned<Type>>,
        value: Box<Spanned<Expr>>,
        body: Box<Spanned<Expr>>,
    },

    /// Assignment to a `var` binding: name = value
    Assign {
        name: String,
        value: Box<Spanned<Expr>>,
    },

    /// While loop, with optional `invariant` clause for verification
    While {
        cond: Box<Spanned<Expr>>,
        invariant: Option<Box<Spanned<Expr>>>,
        body: Box<Spanned<Expr>>,
    },

    /// For loop over a range: for var in iter { body }
    For {
        var: String,
        iter: Box<Spanned<Expr>>,
        body: Box<Spanned<Expr>>,
    },

    /// Infinite loop; exit with break (optionally carrying a value)
    Loop {
        body: Box<Spanned<Expr>>,
    },

    /// Break from loop: break or break value
    Break {
        value: Option<Box<Spanned<Expr>>>,
    },

    /// Continue to next iteration
    Continue,

    /// Early return: return or return value
    Return {
        value: Option<Box<Spanned<Expr>>>,
    },

    /// Range expression: start..end, start..<end, start..=end
    Range {
        start: Box<Spanned<Expr>>,
        end: Box<Spanned<Expr>>,
        kind: RangeKind,
    },

    /// Function call
    Call {
        func: String,
        args: Vec<Spanned<Expr>>,
    },

    /// Method call: receiver.method(args)
    MethodCall {
        receiver: Box<Spanned<Expr>>,
        method: String,
        args: Vec<Spanned<Expr>>,
    },

    /// Return value reference (postconditions only)
    Ret,

    /// Refinement self-reference for `T{it OP expr}`
    It,

    /// Pre-state reference in postconditions: old(expr)
    Old(Box<Spanned<Expr>>),

    /// Struct initialization: new StructName { field: value, ... }
    StructInit {
        name: String,
        fields: Vec<(Spanned<String>, Spanned<Expr>)>,
    },

    /// Field access: expr.field
    FieldAccess {
        expr: Box<Spanned<Expr>>,
        field: Spanned<String>,
    },

    /// Field store statement: set expr.field = value
    FieldAssign {
        object: Box<Spanned<Expr>>,
        field: Spanned<String>,
        value: Box<Spanned<Expr>>,
    },

    /// Tuple field access: expr.0, expr.1
    TupleField {
        expr: Box<Spanned<Expr>>,
        index: usize,
    },

    /// Enum variant: EnumName::Variant or EnumName::Variant(args)
    EnumVariant {
        enum_name: String,
        variant: String,
        args: Vec<Spanned<Expr>>,
    },

    /// Match expression
    Match {
        expr: Box<Spanned<Expr>>,
        arms: Vec<MatchArm>,
    },

    /// Create reference: &expr
    Ref(Box<Spanned<Expr>>),

    /// Create mutable reference: &mut expr
    RefMut(Box<Spanned<Expr>>),

    /// Dereference: *expr
    Deref(Box<Spanned<Expr>>),

    /// Array literal: [elem1, elem2, ...]
    ArrayLit(Vec<Spanned<Expr>>),

    /// Tuple expression: (expr1, expr2, ...)
    Tuple(Vec<Spanned<Expr>>),

    /// Index access: `expr[index]`
    Index {
        expr: Box<Spanned<Expr>>,
        index: Box<Spanned<Expr>>,
    },

    /// Index store statement: `set expr[index] = value`
    IndexAssign {
        array: Box<Spanned<Expr>>,
        index: Box<Spanned<Expr>>,
        value: Box<Spanned<Expr>>,
    },

    /// Closure: |params| body
    Closure {
        params: Vec<ClosureParam>,
        ret_ty: Option<Box<Spanned<Type>>>,
        body: Box<Spanned<Expr>>,
    },

    /// Type cast: expr as Type
    Cast {
        expr: Box<Spanned<Expr>>,
        ty: Spanned<Type>,
    },

    /// Reserved thread-spawn form: spawn { body }
    ///
    /// Parses everywhere a block parses; the checker rejects it.
    Spawn {
        body: Box<Spanned<Expr>>,
    },
}

impl Expr {
    /// Whether this expression never produces a value in its own block.
    pub fn is_diverging(&self) -> bool {
        matches!(
            self,
            Expr::Break { .. } | Expr::Continue | Expr::Return { .. }
        )
    }
}

/// Range kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeKind {
    /// start..end (exclusive)
    Exclusive,
    /// start..=end (inclusive)
    Inclusive,
}

/// A single arm in a match expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub pattern: Spanned<Pattern>,
    /// Optional pattern guard (`pat if expr =>`)
    pub guard: Option<Spanned<Expr>>,
    pub body: Spanned<Expr>,
}

/// Closure parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosureParam {
    pub name: Spanned<String>,
    pub ty: Option<Spanned<Type>>,
}

/// Pattern for match expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    /// Wildcard pattern: _
    Wildcard,
    /// Variable binding: name
    Var(String),
    /// Literal pattern: 42, true, "s"
    Literal(LiteralPattern),
    /// Enum variant pattern: EnumName::Variant(p, ...)
    EnumVariant {
        enum_name: String,
        variant: String,
        bindings: Vec<Spanned<Pattern>>,
    },
    /// Tuple pattern: (p1, p2, ...)
    Tuple(Vec<Spanned<Pattern>>),
}

/// Literal patterns for match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralPattern {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Band,
    Bor,
    Bxor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod
        )
    }
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Band => "band",
            BinOp::Bor => "bor",
            BinOp::Bxor => "bxor",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        };
        write!(f, "{s}")
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    /// Numeric negation
    Neg,
    /// Logical not
    Not,
    /// Bitwise not
    Bnot,
}

impl std::fmt::Display for UnOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnOp::Neg => "-",
            UnOp::Not => "not",
            UnOp::Bnot => "bnot",
        };
        write!(f, "{s}")
    }
}

/// Build a right-nested let chain out of a statement list and tail.
///
/// This is the single desugaring used by every block-producing site in
/// the parser, so `{ let x = a; f(x); tail }` has the same shape whether
/// it appears as a function body, a loop body or a match arm.
pub fn nest_block(
    stmts: Vec<BlockStmt>,
    tail: Spanned<Expr>,
) -> Spanned<Expr> {
    let mut acc = tail;
    for stmt in stmts.into_iter().rev() {
        let span = stmt.span.merge(acc.span);
        acc = Spanned::new(
            Expr::Let {
                name: stmt.name,
                mutable: stmt.mutable,
                ty: stmt.ty,
                value: Box::new(stmt.value),
                body: Box::new(acc),
            },
            span,
        );
    }
    acc
}

/// A single statement inside a block, pre-desugaring.
#[derive(Debug, Clone)]
pub struct BlockStmt {
    /// Binding name; `_` for expression statements.
    pub name: String,
    pub mutable: bool,
    pub ty: Option<Spanned<Type>>,
    pub value: Spanned<Expr>,
    pub span: Span,
}

impl BlockStmt {
    /// An expression statement: evaluated for effect, bound to `_`.
    pub fn discard(value: Spanned<Expr>) -> Self {
        let span = value.span;
        Self {
            name: "_".to_string(),
            mutable: false,
            ty: None,
            value,
            span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spanned<T>(node: T) -> Spanned<T> {
        Spanned::new(node, Span::new(0, 0))
    }

    #[test]
    fn test_nest_block_empty_stmts() {
        let tail = spanned(Expr::IntLit(1));
        let nested = nest_block(vec![], tail);
        assert_eq!(nested.node, Expr::IntLit(1));
    }

    #[test]
    fn test_nest_block_right_nested() {
        // { let x = 1; let y = 2; x } -> Let(x, 1, Let(y, 2, x))
        let stmts = vec![
            BlockStmt {
                name: "x".into(),
                mutable: false,
                ty: None,
                value: spanned(Expr::IntLit(1)),
                span: Span::new(0, 0),
            },
            BlockStmt {
                name: "y".into(),
                mutable: false,
                ty: None,
                value: spanned(Expr::IntLit(2)),
                span: Span::new(0, 0),
            },
        ];
        let nested = nest_block(stmts, spanned(Expr::Var("x".into())));
        match nested.node {
            Expr::Let { name, body, .. } => {
                assert_eq!(name, "x");
                match body.node {
                    Expr::Let { name, body, .. } => {
                        assert_eq!(name, "y");
                        assert_eq!(body.node, Expr::Var("x".into()));
                    }
                    other => panic!("expected inner Let, got {other:?}"),
                }
            }
            other => panic!("expected outer Let, got {other:?}"),
        }
    }

    #[test]
    fn test_nest_block_discard_statement() {
        let stmts = vec![BlockStmt::discard(spanned(Expr::Call {
            func: "println".into(),
            args: vec![spanned(Expr::IntLit(7))],
        }))];
        let nested = nest_block(stmts, spanned(Expr::IntLit(0)));
        match nested.node {
            Expr::Let { name, .. } => assert_eq!(name, "_"),
            other => panic!("expected Let, got {other:?}"),
        }
    }

    #[test]
    fn test_binop_classes() {
        assert!(BinOp::Eq.is_comparison());
        assert!(BinOp::And.is_logical());
        assert!(BinOp::Add.is_arithmetic());
        assert!(!BinOp::Add.is_comparison());
    }

    #[test]
    fn test_diverging() {
        assert!(Expr::Continue.is_diverging());
        assert!(Expr::Return { value: None }.is_diverging());
        assert!(!Expr::IntLit(0).is_diverging());
    }
}
