//! AST to SMT-LIB2 translation
//!
//! Contract clauses and (restricted) function bodies become first-order
//! terms: let bindings unfold into the environment, conditionals become
//! `ite`, and calls to pure or verified functions become uninterpreted
//! function applications. Anything effectful or unbounded is rejected
//! with `Unsupported`, which the verifier reports as an inconclusive
//! obligation rather than a proof.

use std::collections::HashMap;

use crate::ast::{BinOp, Expr, FnDef, Spanned, Type, UnOp};

use super::generate::{sanitize_name, SmtLibGenerator, SmtSort};

/// Why a term could not be translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtError {
    Unsupported(String),
}

impl std::fmt::Display for SmtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmtError::Unsupported(what) => write!(f, "unsupported in SMT translation: {what}"),
        }
    }
}

/// Maps a surface type to the sort used for reasoning. Pointer-kinded
/// values are opaque Int handles.
pub fn type_to_sort(ty: &Type) -> SmtSort {
    match ty.base() {
        Type::Bool => SmtSort::Bool,
        Type::F32 | Type::F64 => SmtSort::Real,
        _ => SmtSort::Int,
    }
}

/// Translator state for one function's obligations.
#[derive(Debug, Default)]
pub struct SmtTranslator {
    /// Substitution environment: source name -> SMT term
    env: Vec<HashMap<String, String>>,
    /// Callees that may appear as uninterpreted functions
    pure_fns: HashMap<String, (Vec<SmtSort>, SmtSort)>,
}

impl SmtTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callee usable as an uninterpreted function (pure, or
    /// already verified so its postcondition may be assumed).
    pub fn allow_fn(&mut self, name: &str, params: Vec<SmtSort>, ret: SmtSort) {
        self.pure_fns.insert(name.to_string(), (params, ret));
    }

    /// Declare the parameters and `ret` for a function's obligations.
    pub fn setup_function(&mut self, f: &FnDef, generator: &mut SmtLibGenerator) {
        for p in &f.params {
            generator.declare_var(&p.name.node, type_to_sort(&p.ty.node));
        }
        generator.declare_var("ret", type_to_sort(&f.ret_ty.node));
    }

    pub fn push_env(&mut self) {
        self.env.push(HashMap::new());
    }

    pub fn pop_env(&mut self) {
        self.env.pop();
    }

    pub fn bind(&mut self, name: &str, term: String) {
        if self.env.is_empty() {
            self.env.push(HashMap::new());
        }
        if let Some(scope) = self.env.last_mut() {
            scope.insert(name.to_string(), term);
        }
    }

    fn lookup(&self, name: &str) -> Option<&String> {
        self.env.iter().rev().find_map(|s| s.get(name))
    }

    /// Translate a contract clause. `it_subst` replaces the refinement
    /// self-reference when translating refinement predicates.
    pub fn translate_with_it(
        &self,
        expr: &Spanned<Expr>,
        generator: &mut SmtLibGenerator,
        it_subst: Option<&str>,
    ) -> Result<String, SmtError> {
        self.translate_inner(&expr.node, generator, it_subst)
    }

    /// Translate a contract clause or pure expression.
    pub fn translate(
        &self,
        expr: &Spanned<Expr>,
        generator: &mut SmtLibGenerator,
    ) -> Result<String, SmtError> {
        self.translate_inner(&expr.node, generator, None)
    }

    fn translate_inner(
        &self,
        expr: &Expr,
        generator: &mut SmtLibGenerator,
        it_subst: Option<&str>,
    ) -> Result<String, SmtError> {
        match expr {
            Expr::IntLit(n) => Ok(if *n < 0 {
                format!("(- {})", -n)
            } else {
                n.to_string()
            }),
            Expr::BoolLit(b) => Ok(b.to_string()),
            // Debug formatting keeps the decimal point, which SMT-LIB
            // needs to read the literal as a Real.
            Expr::FloatLit(x) => Ok(format!("{x:?}")),
            Expr::Unit => Ok("0".to_string()),

            Expr::Var(name) => Ok(self
                .lookup(name)
                .cloned()
                .unwrap_or_else(|| sanitize_name(name))),

            // A bound `ret` (callee-post assumption contexts) wins over
            // the ambient return variable.
            Expr::Ret => Ok(self
                .lookup("ret")
                .cloned()
                .unwrap_or_else(|| "ret".to_string())),

            Expr::It => it_subst
                .map(String::from)
                .ok_or_else(|| SmtError::Unsupported("`it` outside refinement".into())),

            // Parameters are immutable across the call, so the
            // pre-state value is the value.
            Expr::Old(inner) => self.translate_inner(&inner.node, generator, it_subst),

            Expr::Binary { left, op, right } => {
                let l = self.translate_inner(&left.node, generator, it_subst)?;
                let r = self.translate_inner(&right.node, generator, it_subst)?;
                let smt = match op {
                    BinOp::Add => format!("(+ {l} {r})"),
                    BinOp::Sub => format!("(- {l} {r})"),
                    BinOp::Mul => format!("(* {l} {r})"),
                    BinOp::Div => format!("(div {l} {r})"),
                    BinOp::Mod => format!("(mod {l} {r})"),
                    BinOp::Eq => format!("(= {l} {r})"),
                    BinOp::Ne => format!("(not (= {l} {r}))"),
                    BinOp::Lt => format!("(< {l} {r})"),
                    BinOp::Gt => format!("(> {l} {r})"),
                    BinOp::Le => format!("(<= {l} {r})"),
                    BinOp::Ge => format!("(>= {l} {r})"),
                    BinOp::And => format!("(and {l} {r})"),
                    BinOp::Or => format!("(or {l} {r})"),
                    BinOp::Band | BinOp::Bor | BinOp::Bxor | BinOp::Shl | BinOp::Shr => {
                        return Err(SmtError::Unsupported(format!("bitwise operator `{op}`")));
                    }
                };
                Ok(smt)
            }

            Expr::Unary { op, expr: inner } => {
                let e = self.translate_inner(&inner.node, generator, it_subst)?;
                match op {
                    UnOp::Neg => Ok(format!("(- {e})")),
                    UnOp::Not => Ok(format!("(not {e})")),
                    UnOp::Bnot => Err(SmtError::Unsupported("bitwise not".into())),
                }
            }

            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let c = self.translate_inner(&cond.node, generator, it_subst)?;
                let t = self.translate_inner(&then_branch.node, generator, it_subst)?;
                let e = self.translate_inner(&else_branch.node, generator, it_subst)?;
                Ok(format!("(ite {c} {t} {e})"))
            }

            Expr::Let {
                name, value, body, ..
            } => {
                // Unfold the binding into the environment; the clone is
                // local so outer translations stay untouched.
                let v = self.translate_inner(&value.node, generator, it_subst)?;
                let mut nested = SmtTranslator {
                    env: self.env.clone(),
                    pure_fns: self.pure_fns.clone(),
                };
                nested.push_env();
                nested.bind(name, v);
                nested.translate_inner(&body.node, generator, it_subst)
            }

            Expr::Call { func, args } => {
                let Some((params, ret)) = self.pure_fns.get(func).cloned() else {
                    return Err(SmtError::Unsupported(format!(
                        "call to impure or unverified function `{func}`"
                    )));
                };
                generator.declare_fun(func, &params, ret);
                let mut parts = Vec::with_capacity(args.len());
                for a in args {
                    parts.push(self.translate_inner(&a.node, generator, it_subst)?);
                }
                if parts.is_empty() {
                    Ok(sanitize_name(func))
                } else {
                    Ok(format!("({} {})", sanitize_name(func), parts.join(" ")))
                }
            }

            Expr::While { .. } | Expr::For { .. } | Expr::Loop { .. } => Err(
                SmtError::Unsupported("loop without a usable invariant".into()),
            ),
            Expr::Assign { .. } => Err(SmtError::Unsupported("mutation".into())),
            Expr::Match { .. } => Err(SmtError::Unsupported("match expression".into())),
            Expr::MethodCall { .. } => Err(SmtError::Unsupported("method call".into())),
            Expr::FieldAccess { .. } | Expr::FieldAssign { .. } => {
                Err(SmtError::Unsupported("field access".into()))
            }
            other => Err(SmtError::Unsupported(format!(
                "expression form {:?}",
                std::mem::discriminant(other)
            ))),
        }
    }
}
