//! Type AST nodes

use serde::{Deserialize, Serialize};

use super::{Expr, Spanned};

/// Type representation
///
/// This is the surface-level type language. The checker resolves every
/// `Var` before a program is handed to lowering; `Refined` survives until
/// obligation collection and is erased at MIR lowering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
    /// Boolean
    Bool,
    /// Heap string (three-field record at runtime)
    String,
    /// Unit type ()
    Unit,
    /// Never type (diverging expressions: break, continue, return)
    Never,
    /// Fixed-size array [T; N]
    Array(Box<Type>, usize),
    /// Slice &[T]
    Slice(Box<Type>),
    /// Shared reference &T
    Ref(Box<Type>),
    /// Mutable reference &mut T
    RefMut(Box<Type>),
    /// Raw nullable pointer *T
    Ptr(Box<Type>),
    /// Nullable T?
    Nullable(Box<Type>),
    /// Tuple (T1, T2, ...)
    Tuple(Vec<Type>),
    /// Named struct or enum
    Named(String),
    /// Generic application S<T1, ...>
    Generic { name: String, args: Vec<Type> },
    /// Function type fn(T...) -> T
    Fn { params: Vec<Type>, ret: Box<Type> },
    /// Trait object
    TraitObject(String),
    /// Inference variable, checker-internal
    Var(u32),
    /// Refinement: base type constrained by predicates over `it`
    Refined {
        base: Box<Type>,
        constraints: Vec<Spanned<Expr>>,
    },
}

impl Type {
    /// Strip refinement wrappers down to the base type.
    pub fn base(&self) -> &Type {
        match self {
            Type::Refined { base, .. } => base.base(),
            other => other,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.base(),
            Type::I8 | Type::I16 | Type::I32 | Type::I64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self.base(), Type::F32 | Type::F64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self.base(), Type::Nullable(_) | Type::Ptr(_))
    }

    /// Whether values of this type are represented as a pointer at the
    /// LLVM level (structs, strings, arrays, references, raw pointers).
    pub fn is_pointer_like(&self) -> bool {
        matches!(
            self.base(),
            Type::String
                | Type::Named(_)
                | Type::Generic { .. }
                | Type::Array(..)
                | Type::Slice(_)
                | Type::Ref(_)
                | Type::RefMut(_)
                | Type::Ptr(_)
                | Type::TraitObject(_)
        )
    }

    /// The base struct name of a (possibly generic, possibly referenced)
    /// struct type, if any. Used to key `var_struct_types`.
    pub fn struct_base_name(&self) -> Option<&str> {
        match self.base() {
            Type::Named(name) => Some(name),
            Type::Generic { name, .. } => Some(name),
            Type::Ref(inner) | Type::RefMut(inner) | Type::Ptr(inner) | Type::Nullable(inner) => {
                inner.struct_base_name()
            }
            _ => None,
        }
    }

    /// True if the type contains no unresolved inference variables.
    pub fn is_resolved(&self) -> bool {
        match self {
            Type::Var(_) => false,
            Type::Array(t, _)
            | Type::Slice(t)
            | Type::Ref(t)
            | Type::RefMut(t)
            | Type::Ptr(t)
            | Type::Nullable(t) => t.is_resolved(),
            Type::Tuple(ts) => ts.iter().all(Type::is_resolved),
            Type::Generic { args, .. } => args.iter().all(Type::is_resolved),
            Type::Fn { params, ret } => {
                params.iter().all(Type::is_resolved) && ret.is_resolved()
            }
            Type::Refined { base, .. } => base.is_resolved(),
            _ => true,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::I8 => write!(f, "i8"),
            Type::I16 => write!(f, "i16"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::F32 => write!(f, "f32"),
            Type::F64 => write!(f, "f64"),
            Type::Bool => write!(f, "bool"),
            Type::String => write!(f, "String"),
            Type::Unit => write!(f, "()"),
            Type::Never => write!(f, "!"),
            Type::Array(t, n) => write!(f, "[{t}; {n}]"),
            Type::Slice(t) => write!(f, "&[{t}]"),
            Type::Ref(t) => write!(f, "&{t}"),
            Type::RefMut(t) => write!(f, "&mut {t}"),
            Type::Ptr(t) => write!(f, "*{t}"),
            Type::Nullable(t) => write!(f, "{t}?"),
            Type::Tuple(ts) => {
                write!(f, "(")?;
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
            Type::Named(name) => write!(f, "{name}"),
            Type::Generic { name, args } => {
                write!(f, "{name}<")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ">")
            }
            Type::Fn { params, ret } => {
                write!(f, "fn(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ") -> {ret}")
            }
            Type::TraitObject(name) => write!(f, "dyn {name}"),
            Type::Var(n) => write!(f, "?{n}"),
            Type::Refined { base, constraints } => {
                write!(f, "{base}{{{} constraint(s)}}", constraints.len())
            }
        }
    }
}
