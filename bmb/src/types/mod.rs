//! Type checking
//!
//! Hindley-Milner inference over function bodies with bidirectional
//! propagation at annotated boundaries. Generic functions and structs are
//! monomorphized here; refinement predicates stay attached to types and
//! are discharged later by the SMT verifier.

pub mod exhaustiveness;

use std::collections::HashMap;

use crate::ast::*;
use crate::error::{CompileError, CompileWarning};
use crate::util::find_similar_name;

/// Function signature after generics are resolved
#[derive(Debug, Clone)]
pub struct FnSig {
    pub params: Vec<(String, Type)>,
    pub ret: Type,
    pub is_pure: bool,
}

/// Everything downstream phases need from the checker.
///
/// `program` contains the original non-generic items plus every
/// monomorphized instance; generic templates are gone. Expression types
/// live in a span-keyed side table, which realizes the per-node inferred
/// type slot without threading a parallel tree.
#[derive(Debug)]
pub struct CheckedProgram {
    pub program: Program,
    /// Signatures for every concrete function, user and monomorphized
    pub fn_sigs: HashMap<String, FnSig>,
    /// Ordered (field, type) lists for every concrete struct
    pub struct_defs: HashMap<String, Vec<(String, Type)>>,
    /// Enum name -> ordered variants (name, payload types)
    pub enum_defs: HashMap<String, Vec<(String, Vec<Type>)>>,
    /// Per-function map of variable name -> base struct name
    pub var_struct_types: HashMap<String, HashMap<String, String>>,
    /// Inferred type of every expression, keyed by its span
    pub expr_types: HashMap<Span, Type>,
    /// Call span -> monomorphized callee name (for generic calls)
    pub mono_calls: HashMap<Span, String>,
    /// Struct-literal span -> monomorphized struct name
    pub mono_structs: HashMap<Span, String>,
    /// Method-call span -> flattened impl function name
    pub method_calls: HashMap<Span, String>,
    /// Non-fatal diagnostics gathered during checking
    pub warnings: Vec<CompileWarning>,
}

impl CheckedProgram {
    /// The recorded type of an expression, fully resolved.
    pub fn type_of(&self, span: Span) -> Option<&Type> {
        self.expr_types.get(&span)
    }
}

#[derive(Debug, Clone)]
struct VarInfo {
    ty: Type,
    mutable: bool,
    span: Span,
    used: bool,
    mutated: bool,
}

/// What `ret` / `it` / `old(..)` mean while checking a contract clause.
#[derive(Debug, Clone)]
enum ContractCtx {
    /// Not inside a contract
    None,
    /// Precondition: only params visible
    Pre,
    /// Postcondition: `ret` has the given type
    Post { ret: Type },
    /// Refinement predicate: `it` has the given type
    Refinement { it: Type },
}

/// Type checker
pub struct TypeChecker {
    // Global tables
    functions: HashMap<String, FnSig>,
    generic_functions: HashMap<String, FnDef>,
    structs: HashMap<String, StructDef>,
    generic_structs: HashMap<String, StructDef>,
    enums: HashMap<String, EnumDef>,
    traits: HashMap<String, TraitDef>,
    /// target type name -> method name -> sig
    impl_methods: HashMap<String, HashMap<String, FnSig>>,

    // Inference state
    subst: HashMap<u32, Type>,
    next_var: u32,

    // Per-function state
    scopes: Vec<HashMap<String, VarInfo>>,
    current_ret: Type,
    current_fn: String,
    contract_ctx: ContractCtx,
    loop_break_types: Vec<Option<Type>>,

    // Outputs
    pub errors: Vec<CompileError>,
    pub warnings: Vec<CompileWarning>,
    expr_types: HashMap<Span, Type>,
    var_struct_types: HashMap<String, HashMap<String, String>>,
    mono_calls: HashMap<Span, String>,
    mono_structs: HashMap<Span, String>,
    method_calls: HashMap<Span, String>,
    /// (template, type args) -> instance name; the whole-module memo
    mono_fn_memo: HashMap<(String, String), String>,
    mono_struct_memo: HashMap<(String, String), String>,
    /// Instances produced by monomorphization, appended to the program
    mono_items: Vec<Item>,
    /// Worklist of monomorphized functions still to check
    mono_pending: Vec<FnDef>,
}

impl Default for TypeChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeChecker {
    pub fn new() -> Self {
        Self {
            functions: builtin_signatures(),
            generic_functions: HashMap::new(),
            structs: HashMap::new(),
            generic_structs: HashMap::new(),
            enums: HashMap::new(),
            traits: HashMap::new(),
            impl_methods: HashMap::new(),
            subst: HashMap::new(),
            next_var: 0,
            scopes: Vec::new(),
            current_ret: Type::Unit,
            current_fn: String::new(),
            contract_ctx: ContractCtx::None,
            loop_break_types: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            expr_types: HashMap::new(),
            var_struct_types: HashMap::new(),
            mono_calls: HashMap::new(),
            mono_structs: HashMap::new(),
            method_calls: HashMap::new(),
            mono_fn_memo: HashMap::new(),
            mono_struct_memo: HashMap::new(),
            mono_items: Vec::new(),
            mono_pending: Vec::new(),
        }
    }

    /// Check a whole program. Errors accumulate per function; any error
    /// means no `CheckedProgram` is produced.
    pub fn check_program(
        mut self,
        program: &Program,
    ) -> std::result::Result<CheckedProgram, (Vec<CompileError>, Vec<CompileWarning>)> {
        self.collect_items(program);

        for item in &program.items {
            match item {
                Item::FnDef(f) => {
                    if f.type_params.is_empty() {
                        self.check_function(f);
                    }
                }
                Item::ImplBlock(block) => {
                    for method in &block.methods {
                        self.check_function(method);
                    }
                }
                _ => {}
            }
        }

        // Drain the monomorphization worklist; checking an instance may
        // enqueue further instances.
        while let Some(instance) = self.mono_pending.pop() {
            self.check_function(&instance);
            self.mono_items.push(Item::FnDef(instance));
        }

        if !self.errors.is_empty() {
            return Err((self.errors, self.warnings));
        }

        // Assemble the output program: original concrete items plus
        // monomorphized instances; generic templates dropped, impl
        // blocks flattened into plain functions.
        let mut items: Vec<Item> = Vec::new();
        for item in &program.items {
            match item {
                Item::FnDef(f) if !f.type_params.is_empty() => {}
                Item::StructDef(s) if !s.type_params.is_empty() => {}
                Item::EnumDef(e) if !e.type_params.is_empty() => {}
                Item::Use(_) => {}
                Item::ImplBlock(block) => {
                    for method in &block.methods {
                        if let Some(target) = block.target.node.struct_base_name() {
                            let mut flat = method.clone();
                            flat.name = Spanned::new(
                                format!("{target}_{}", method.name.node),
                                method.name.span,
                            );
                            items.push(Item::FnDef(flat));
                        }
                    }
                }
                other => items.push(other.clone()),
            }
        }
        items.extend(std::mem::take(&mut self.mono_items));

        let mut struct_defs: HashMap<String, Vec<(String, Type)>> = HashMap::new();
        for (name, def) in &self.structs {
            struct_defs.insert(
                name.clone(),
                def.fields
                    .iter()
                    .map(|f| (f.name.node.clone(), f.ty.node.clone()))
                    .collect(),
            );
        }
        // Field indices for generic instances resolve through the base
        // name as well.
        for (name, def) in &self.generic_structs {
            struct_defs.insert(
                name.clone(),
                def.fields
                    .iter()
                    .map(|f| (f.name.node.clone(), f.ty.node.clone()))
                    .collect(),
            );
        }

        let mut enum_defs: HashMap<String, Vec<(String, Vec<Type>)>> = HashMap::new();
        for (name, def) in &self.enums {
            enum_defs.insert(
                name.clone(),
                def.variants
                    .iter()
                    .map(|v| {
                        (
                            v.name.node.clone(),
                            v.fields.iter().map(|t| t.node.clone()).collect(),
                        )
                    })
                    .collect(),
            );
        }

        let expr_types = self
            .expr_types
            .iter()
            .map(|(span, ty)| (*span, self.finalize(ty)))
            .collect();

        Ok(CheckedProgram {
            program: Program { items },
            fn_sigs: self.functions,
            struct_defs,
            enum_defs,
            var_struct_types: self.var_struct_types,
            expr_types,
            mono_calls: self.mono_calls,
            mono_structs: self.mono_structs,
            method_calls: self.method_calls,
            warnings: self.warnings,
        })
    }

    fn collect_items(&mut self, program: &Program) {
        for item in &program.items {
            match item {
                Item::StructDef(s) => {
                    if s.type_params.is_empty() {
                        self.structs.insert(s.name.node.clone(), s.clone());
                    } else {
                        self.generic_structs.insert(s.name.node.clone(), s.clone());
                    }
                }
                Item::EnumDef(e) => {
                    self.enums.insert(e.name.node.clone(), e.clone());
                }
                Item::TraitDef(t) => {
                    self.traits.insert(t.name.node.clone(), t.clone());
                }
                _ => {}
            }
        }
        // Second pass: function signatures can reference any type.
        for item in &program.items {
            match item {
                Item::FnDef(f) => {
                    if f.type_params.is_empty() {
                        let sig = FnSig {
                            params: f
                                .params
                                .iter()
                                .map(|p| (p.name.node.clone(), p.ty.node.clone()))
                                .collect(),
                            ret: f.ret_ty.node.clone(),
                            is_pure: f.is_pure(),
                        };
                        if self.functions.insert(f.name.node.clone(), sig).is_some() {
                            self.warnings.push(CompileWarning::Generic {
                                message: format!(
                                    "function `{}` shadows an earlier definition",
                                    f.name.node
                                ),
                                span: Some(f.name.span),
                            });
                        }
                    } else {
                        self.generic_functions.insert(f.name.node.clone(), f.clone());
                    }
                }
                Item::ImplBlock(block) => {
                    if !self.traits.contains_key(&block.trait_name.node) {
                        self.errors.push(CompileError::type_error(
                            format!("unknown trait `{}`", block.trait_name.node),
                            block.trait_name.span,
                        ));
                    }
                    let Some(target_name) = block.target.node.struct_base_name().map(String::from)
                    else {
                        self.errors.push(CompileError::type_error(
                            "impl target must be a named type",
                            block.target.span,
                        ));
                        continue;
                    };
                    for m in &block.methods {
                        let sig = FnSig {
                            params: m
                                .params
                                .iter()
                                .map(|p| (p.name.node.clone(), p.ty.node.clone()))
                                .collect(),
                            ret: m.ret_ty.node.clone(),
                            is_pure: m.is_pure(),
                        };
                        // The flattened name is what lowering calls.
                        self.functions
                            .insert(format!("{target_name}_{}", m.name.node), sig.clone());
                        self.impl_methods
                            .entry(target_name.clone())
                            .or_default()
                            .insert(m.name.node.clone(), sig);
                    }
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Function checking
    // ------------------------------------------------------------------

    fn check_function(&mut self, f: &FnDef) {
        self.scopes.clear();
        self.push_scope();
        self.current_ret = f.ret_ty.node.clone();
        self.current_fn = f.name.node.clone();
        self.loop_break_types.clear();

        let mut fn_var_structs: HashMap<String, String> = HashMap::new();

        for p in &f.params {
            // Registering the base struct name here is what makes later
            // field access on generic-typed parameters resolve correct
            // field indices instead of field 0.
            if let Some(base) = p.ty.node.struct_base_name() {
                fn_var_structs.insert(p.name.node.clone(), base.to_string());
            }
            self.bind(p.name.node.clone(), p.ty.node.clone(), false, p.name.span);
        }
        self.var_struct_types
            .insert(f.name.node.clone(), fn_var_structs);

        // spawn is parser-accepted, checker-rejected
        if let Some(span) = find_spawn(&f.body) {
            self.errors.push(CompileError::type_error(
                "`spawn` is reserved and not supported in this edition",
                span,
            ));
        }

        // Contract clauses check as booleans in their own contexts.
        self.contract_ctx = ContractCtx::Pre;
        for pre in &f.pre {
            self.check_bool_clause(pre, "precondition");
        }
        self.contract_ctx = ContractCtx::Post {
            ret: f.ret_ty.node.clone(),
        };
        for post in &f.post {
            self.check_bool_clause(post, "postcondition");
        }
        for contract in &f.contracts {
            self.check_bool_clause(&contract.condition, "contract clause");
        }
        if let Some(measure) = f.decreases().cloned() {
            self.contract_ctx = ContractCtx::Pre;
            let ty = self.check_expr(&measure);
            if self.unify(&ty, &Type::I64, measure.span).is_err() {
                let shown = self.finalize(&ty);
                self.errors.push(CompileError::type_error(
                    format!("@decreases measure must be i64, got {shown}"),
                    measure.span,
                ));
            }
        }
        // Refinement predicates on parameter and return types
        for p in &f.params {
            if let Type::Refined { base, constraints } = &p.ty.node {
                self.contract_ctx = ContractCtx::Refinement {
                    it: (**base).clone(),
                };
                for c in constraints {
                    self.check_bool_clause(c, "refinement");
                }
            }
        }
        if let Type::Refined { base, constraints } = &f.ret_ty.node {
            self.contract_ctx = ContractCtx::Refinement {
                it: (**base).clone(),
            };
            for c in constraints {
                self.check_bool_clause(c, "refinement");
            }
        }
        self.contract_ctx = ContractCtx::None;

        // Body, propagated bidirectionally against the return annotation.
        let body_ty = self.check_expr(&f.body);
        let want = f.ret_ty.node.clone();
        if self.finalize(&body_ty).base() != &Type::Never
            && self.unify(&body_ty, &want, f.body.span).is_err()
        {
            let ret_shown = self.finalize(&want);
            let body_shown = self.finalize(&body_ty);
            self.errors.push(CompileError::type_error(
                format!(
                    "function `{}` returns {ret_shown}, body has type {body_shown}",
                    f.name.node,
                ),
                f.body.span,
            ));
        }

        self.pop_scope_with_warnings();
    }

    fn check_bool_clause(&mut self, clause: &Spanned<Expr>, what: &str) {
        let ty = self.check_expr(clause);
        if self.unify(&ty, &Type::Bool, clause.span).is_err() {
            let shown = self.finalize(&ty);
            self.errors.push(CompileError::type_error(
                format!("{what} must be bool, got {shown}"),
                clause.span,
            ));
        }
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope_with_warnings(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            let mut entries: Vec<_> = scope.into_iter().collect();
            entries.sort_by(|a, b| a.1.span.start.cmp(&b.1.span.start));
            for (name, info) in entries {
                if name.starts_with('_') {
                    continue;
                }
                if !info.used {
                    self.warnings.push(CompileWarning::UnusedBinding {
                        name: name.clone(),
                        span: info.span,
                    });
                }
                if info.mutable && !info.mutated {
                    self.warnings
                        .push(CompileWarning::UnusedMut { name, span: info.span });
                }
            }
        }
    }

    fn bind(&mut self, name: String, ty: Type, mutable: bool, span: Span) {
        if !name.starts_with('_') {
            let mut original = None;
            for outer in self.scopes.iter().rev().skip(1) {
                if let Some(orig) = outer.get(&name) {
                    original = Some(orig.span);
                    break;
                }
            }
            if let Some(original_span) = original {
                self.warnings.push(CompileWarning::ShadowBinding {
                    name: name.clone(),
                    span,
                    original_span,
                });
            }
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(
                name,
                VarInfo {
                    ty,
                    mutable,
                    span,
                    used: false,
                    mutated: false,
                },
            );
        }
    }

    fn lookup(&mut self, name: &str) -> Option<VarInfo> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(info) = scope.get_mut(name) {
                info.used = true;
                return Some(info.clone());
            }
        }
        None
    }

    fn mark_mutated(&mut self, name: &str) {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(info) = scope.get_mut(name) {
                info.mutated = true;
                return;
            }
        }
    }

    fn register_struct_var(&mut self, var: &str, ty: &Type) {
        let resolved = self.finalize(ty);
        if let Some(base) = resolved.struct_base_name() {
            // Keyed by the struct's base name, never the monomorphized
            // suffix; field indices are shared across instances.
            let base = base.to_string();
            self.var_struct_types
                .entry(self.current_fn.clone())
                .or_default()
                .insert(var.to_string(), base);
        }
    }

    // ------------------------------------------------------------------
    // Inference plumbing
    // ------------------------------------------------------------------

    fn fresh_var(&mut self) -> Type {
        let v = self.next_var;
        self.next_var += 1;
        Type::Var(v)
    }

    /// Chase the substitution at the top level.
    fn resolve(&self, ty: &Type) -> Type {
        match ty {
            Type::Var(v) => match self.subst.get(v) {
                Some(t) => self.resolve(t),
                None => ty.clone(),
            },
            _ => ty.clone(),
        }
    }

    /// Fully apply the substitution; unresolved variables default to i64.
    fn finalize(&self, ty: &Type) -> Type {
        match self.resolve(ty) {
            Type::Var(_) => Type::I64,
            Type::Array(t, n) => Type::Array(Box::new(self.finalize(&t)), n),
            Type::Slice(t) => Type::Slice(Box::new(self.finalize(&t))),
            Type::Ref(t) => Type::Ref(Box::new(self.finalize(&t))),
            Type::RefMut(t) => Type::RefMut(Box::new(self.finalize(&t))),
            Type::Ptr(t) => Type::Ptr(Box::new(self.finalize(&t))),
            Type::Nullable(t) => Type::Nullable(Box::new(self.finalize(&t))),
            Type::Tuple(ts) => Type::Tuple(ts.iter().map(|t| self.finalize(t)).collect()),
            Type::Generic { name, args } => Type::Generic {
                name,
                args: args.iter().map(|t| self.finalize(t)).collect(),
            },
            Type::Fn { params, ret } => Type::Fn {
                params: params.iter().map(|t| self.finalize(t)).collect(),
                ret: Box::new(self.finalize(&ret)),
            },
            Type::Refined { base, constraints } => Type::Refined {
                base: Box::new(self.finalize(&base)),
                constraints,
            },
            other => other,
        }
    }

    fn occurs(&self, v: u32, ty: &Type) -> bool {
        match self.resolve(ty) {
            Type::Var(w) => v == w,
            Type::Array(t, _)
            | Type::Slice(t)
            | Type::Ref(t)
            | Type::RefMut(t)
            | Type::Ptr(t)
            | Type::Nullable(t) => self.occurs(v, &t),
            Type::Tuple(ts) => ts.iter().any(|t| self.occurs(v, t)),
            Type::Generic { args, .. } => args.iter().any(|t| self.occurs(v, t)),
            Type::Fn { params, ret } => {
                params.iter().any(|t| self.occurs(v, t)) || self.occurs(v, &ret)
            }
            _ => false,
        }
    }

    /// Unify two types, producing the joined type.
    ///
    /// The nullability rules live here: a null literal (`Ptr(Var)`)
    /// unifies with any `Nullable(T)` as the null variant, and a plain
    /// `T` auto-wraps when required to meet `Nullable(T)`.
    fn unify(&mut self, a: &Type, b: &Type, span: Span) -> std::result::Result<Type, ()> {
        let a = self.resolve(a);
        let b = self.resolve(b);
        match (&a, &b) {
            (Type::Var(v), _) => {
                if let Type::Var(w) = b
                    && w == *v
                {
                    return Ok(a.clone());
                }
                if self.occurs(*v, &b) {
                    return Err(());
                }
                self.subst.insert(*v, b.clone());
                Ok(b)
            }
            (_, Type::Var(_)) => self.unify(&b, &a, span),

            // Refinements unify through their base; the predicate is the
            // verifier's concern.
            (Type::Refined { base, .. }, _) => {
                let base = (**base).clone();
                self.unify(&base, &b, span)?;
                Ok(a)
            }
            (_, Type::Refined { base, .. }) => {
                let base = (**base).clone();
                self.unify(&a, &base, span)?;
                Ok(b)
            }

            // Never joins with anything.
            (Type::Never, _) => Ok(b),
            (_, Type::Never) => Ok(a),

            // Null literal meets a nullable: the value is the null
            // variant of that nullable.
            (Type::Ptr(inner), Type::Nullable(_))
                if matches!(self.resolve(inner), Type::Var(_)) =>
            {
                Ok(b)
            }
            (Type::Nullable(_), Type::Ptr(inner))
                if matches!(self.resolve(inner), Type::Var(_)) =>
            {
                Ok(a)
            }

            // Null literal meets a plain T (if-else join with a null
            // arm): the join is T?. Raw pointers stay raw, handled by
            // the Ptr/Ptr rule below.
            (Type::Ptr(inner), other)
                if matches!(self.resolve(inner), Type::Var(_))
                    && !matches!(other, Type::Ptr(_)) =>
            {
                if let Type::Var(v) = self.resolve(inner) {
                    self.subst.insert(v, other.clone());
                }
                Ok(Type::Nullable(Box::new(other.clone())))
            }
            (other, Type::Ptr(inner))
                if matches!(self.resolve(inner), Type::Var(_))
                    && !matches!(other, Type::Ptr(_)) =>
            {
                if let Type::Var(v) = self.resolve(inner) {
                    self.subst.insert(v, other.clone());
                }
                Ok(Type::Nullable(Box::new(other.clone())))
            }

            (Type::Nullable(x), Type::Nullable(y)) => {
                let t = self.unify(x, y, span)?;
                Ok(Type::Nullable(Box::new(t)))
            }
            // Auto-wrap: T meets T? on either side.
            (_, Type::Nullable(inner)) => {
                let t = self.unify(&a, inner, span)?;
                Ok(Type::Nullable(Box::new(t)))
            }
            (Type::Nullable(inner), _) => {
                let t = self.unify(inner, &b, span)?;
                Ok(Type::Nullable(Box::new(t)))
            }

            (Type::Array(x, n), Type::Array(y, m)) => {
                // Arrays unify by length AND element type.
                if n != m {
                    return Err(());
                }
                let t = self.unify(x, y, span)?;
                Ok(Type::Array(Box::new(t), *n))
            }
            (Type::Slice(x), Type::Slice(y)) => {
                let t = self.unify(x, y, span)?;
                Ok(Type::Slice(Box::new(t)))
            }
            // References are invariant.
            (Type::Ref(x), Type::Ref(y)) => {
                let t = self.unify(x, y, span)?;
                Ok(Type::Ref(Box::new(t)))
            }
            (Type::RefMut(x), Type::RefMut(y)) => {
                let t = self.unify(x, y, span)?;
                Ok(Type::RefMut(Box::new(t)))
            }
            (Type::Ptr(x), Type::Ptr(y)) => {
                let t = self.unify(x, y, span)?;
                Ok(Type::Ptr(Box::new(t)))
            }
            (Type::Tuple(xs), Type::Tuple(ys)) => {
                if xs.len() != ys.len() {
                    return Err(());
                }
                let mut elems = Vec::with_capacity(xs.len());
                for (x, y) in xs.iter().zip(ys) {
                    elems.push(self.unify(x, y, span)?);
                }
                Ok(Type::Tuple(elems))
            }
            (Type::Named(x), Type::Named(y)) if x == y => Ok(a.clone()),
            (Type::Generic { name: xn, args: xa }, Type::Generic { name: yn, args: ya }) => {
                if xn != yn || xa.len() != ya.len() {
                    return Err(());
                }
                let mut args = Vec::with_capacity(xa.len());
                for (x, y) in xa.iter().zip(ya) {
                    args.push(self.unify(x, y, span)?);
                }
                Ok(Type::Generic {
                    name: xn.clone(),
                    args,
                })
            }
            (Type::Fn { params: xp, ret: xr }, Type::Fn { params: yp, ret: yr }) => {
                if xp.len() != yp.len() {
                    return Err(());
                }
                let mut params = Vec::with_capacity(xp.len());
                for (x, y) in xp.iter().zip(yp) {
                    params.push(self.unify(x, y, span)?);
                }
                let ret = self.unify(xr, yr, span)?;
                Ok(Type::Fn {
                    params,
                    ret: Box::new(ret),
                })
            }
            (Type::TraitObject(x), Type::TraitObject(y)) if x == y => Ok(a.clone()),
            _ if a == b => Ok(a.clone()),
            _ => Err(()),
        }
    }

    fn expect_ty(&mut self, got: &Type, want: &Type, span: Span) -> Type {
        match self.unify(got, want, span) {
            Ok(t) => t,
            Err(()) => {
                let want_shown = self.finalize(want);
                let got_shown = self.finalize(got);
                self.errors.push(CompileError::type_error(
                    format!("expected {want_shown}, got {got_shown}"),
                    span,
                ));
                want.clone()
            }
        }
    }

    // ------------------------------------------------------------------
    // Expression checking
    // ------------------------------------------------------------------

    fn record(&mut self, span: Span, ty: Type) -> Type {
        self.expr_types.insert(span, ty.clone());
        ty
    }

    fn check_expr(&mut self, expr: &Spanned<Expr>) -> Type {
        let ty = self.check_expr_inner(expr);
        self.record(expr.span, ty)
    }

    fn check_expr_inner(&mut self, expr: &Spanned<Expr>) -> Type {
        let span = expr.span;
        match &expr.node {
            Expr::IntLit(_) => Type::I64,
            Expr::FloatLit(_) => Type::F64,
            Expr::BoolLit(_) => Type::Bool,
            Expr::StringLit(_) => Type::String,
            Expr::CharLit(_) => Type::I64,
            Expr::Unit => Type::Unit,
            // The null literal starts as a pointer to an unconstrained
            // type; unification against Nullable(T) resolves it.
            Expr::Null => {
                let v = self.fresh_var();
                Type::Ptr(Box::new(v))
            }

            Expr::Var(name) => match self.lookup(name) {
                Some(info) => info.ty,
                None => {
                    let candidates: Vec<String> =
                        self.scopes.iter().flat_map(|s| s.keys().cloned()).collect();
                    let hint = find_similar_name(name, &candidates)
                        .map(|s| format!("; did you mean `{s}`?"))
                        .unwrap_or_default();
                    self.errors.push(CompileError::type_error(
                        format!("unknown variable `{name}`{hint}"),
                        span,
                    ));
                    self.fresh_var()
                }
            },

            Expr::Binary { left, op, right } => self.check_binary(left, *op, right, span),

            Expr::Unary { op, expr: inner } => {
                let t = self.check_expr(inner);
                match op {
                    UnOp::Neg => {
                        let resolved = self.finalize(&t);
                        if !matches!(resolved, Type::Var(_)) && !resolved.is_numeric() {
                            self.errors.push(CompileError::type_error(
                                format!("cannot negate {resolved}"),
                                span,
                            ));
                        }
                        t
                    }
                    UnOp::Not => {
                        self.expect_ty(&t, &Type::Bool, inner.span);
                        Type::Bool
                    }
                    UnOp::Bnot => {
                        self.expect_ty(&t, &Type::I64, inner.span);
                        Type::I64
                    }
                }
            }

            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond_ty = self.check_expr(cond);
                self.expect_ty(&cond_ty, &Type::Bool, cond.span);
                let then_ty = self.check_expr(then_branch);
                let else_ty = self.check_expr(else_branch);
                match self.unify(&then_ty, &else_ty, span) {
                    Ok(t) => t,
                    Err(()) => {
                        let t_shown = self.finalize(&then_ty);
                        let e_shown = self.finalize(&else_ty);
                        self.errors.push(CompileError::type_error(
                            format!("if-else branches disagree: {t_shown} vs {e_shown}"),
                            span,
                        ));
                        then_ty
                    }
                }
            }

            Expr::Let {
                name,
                mutable,
                ty,
                value,
                body,
            } => {
                let value_ty = self.check_expr(value);
                let bound_ty = if let Some(ann) = ty {
                    self.expect_ty(&value_ty, &ann.node, value.span);
                    ann.node.clone()
                } else {
                    value_ty
                };
                self.push_scope();
                self.bind(name.clone(), bound_ty.clone(), *mutable, span);
                self.register_struct_var(name, &bound_ty);
                let body_ty = self.check_expr(body);
                self.pop_scope_with_warnings();
                body_ty
            }

            Expr::Assign { name, value } => {
                let value_ty = self.check_expr(value);
                match self.lookup(name) {
                    Some(info) => {
                        if !info.mutable {
                            self.errors.push(CompileError::type_error(
                                format!(
                                    "cannot assign to immutable binding `{name}`; declare it with `var`"
                                ),
                                span,
                            ));
                        }
                        self.mark_mutated(name);
                        self.expect_ty(&value_ty, &info.ty, value.span);
                    }
                    None => {
                        self.errors.push(CompileError::type_error(
                            format!("unknown variable `{name}`"),
                            span,
                        ));
                    }
                }
                Type::Unit
            }

            Expr::While {
                cond,
                invariant,
                body,
            } => {
                let cond_ty = self.check_expr(cond);
                self.expect_ty(&cond_ty, &Type::Bool, cond.span);
                if let Some(inv) = invariant {
                    let inv_ty = self.check_expr(inv);
                    self.expect_ty(&inv_ty, &Type::Bool, inv.span);
                }
                self.loop_break_types.push(None);
                self.check_expr(body);
                self.loop_break_types.pop();
                Type::Unit
            }

            Expr::For { var, iter, body } => {
                if !matches!(iter.node, Expr::Range { .. }) {
                    self.errors.push(CompileError::type_error(
                        "for loops iterate over integer ranges",
                        iter.span,
                    ));
                }
                self.check_expr(iter);
                self.push_scope();
                self.bind(var.clone(), Type::I64, false, iter.span);
                self.loop_break_types.push(None);
                self.check_expr(body);
                self.loop_break_types.pop();
                self.pop_scope_with_warnings();
                Type::Unit
            }

            Expr::Loop { body } => {
                self.loop_break_types.push(None);
                self.check_expr(body);
                match self.loop_break_types.pop().flatten() {
                    Some(t) => t,
                    None => Type::Never,
                }
            }

            Expr::Break { value } => {
                let break_ty = match value {
                    Some(v) => self.check_expr(v),
                    None => Type::Unit,
                };
                if self.loop_break_types.is_empty() {
                    self.errors
                        .push(CompileError::type_error("`break` outside of a loop", span));
                } else {
                    let prev = self.loop_break_types.last().unwrap().clone();
                    let joined = match prev {
                        Some(prev) => match self.unify(&prev, &break_ty, span) {
                            Ok(t) => t,
                            Err(()) => {
                                self.errors.push(CompileError::type_error(
                                    "break values disagree in type",
                                    span,
                                ));
                                prev
                            }
                        },
                        None => break_ty,
                    };
                    *self.loop_break_types.last_mut().unwrap() = Some(joined);
                }
                Type::Never
            }

            Expr::Continue => {
                if self.loop_break_types.is_empty() {
                    self.errors.push(CompileError::type_error(
                        "`continue` outside of a loop",
                        span,
                    ));
                }
                Type::Never
            }

            Expr::Return { value } => {
                let got = match value {
                    Some(v) => self.check_expr(v),
                    None => Type::Unit,
                };
                let want = self.current_ret.clone();
                self.expect_ty(&got, &want, span);
                Type::Never
            }

            Expr::Range { start, end, .. } => {
                let s = self.check_expr(start);
                let e = self.check_expr(end);
                self.expect_ty(&s, &Type::I64, start.span);
                self.expect_ty(&e, &Type::I64, end.span);
                // Ranges only appear as for-loop iterables.
                Type::Unit
            }

            Expr::Call { func, args } => self.check_call(func, args, span),

            Expr::MethodCall {
                receiver,
                method,
                args,
            } => self.check_method_call(receiver, method, args, span),

            Expr::Ret => match self.contract_ctx.clone() {
                ContractCtx::Post { ret } => ret.base().clone(),
                _ => {
                    self.errors.push(CompileError::type_error(
                        "`ret` is only valid in postconditions",
                        span,
                    ));
                    self.fresh_var()
                }
            },

            Expr::It => match self.contract_ctx.clone() {
                ContractCtx::Refinement { it } => it,
                _ => {
                    self.errors.push(CompileError::type_error(
                        "`it` is only valid inside refinement predicates",
                        span,
                    ));
                    self.fresh_var()
                }
            },

            Expr::Old(inner) => match self.contract_ctx.clone() {
                ContractCtx::Post { .. } => self.check_expr(inner),
                _ => {
                    self.errors.push(CompileError::type_error(
                        "`old(..)` is only valid in postconditions",
                        span,
                    ));
                    self.fresh_var()
                }
            },

            Expr::StructInit { name, fields } => self.check_struct_init(name, fields, span),

            Expr::FieldAccess { expr: base, field } => {
                let base_ty = self.check_expr(base);
                self.check_field_access(&base_ty, field, span)
            }

            Expr::FieldAssign {
                object,
                field,
                value,
            } => {
                let base_ty = self.check_expr(object);
                let field_ty = self.check_field_access(&base_ty, field, span);
                let value_ty = self.check_expr(value);
                self.expect_ty(&value_ty, &field_ty, value.span);
                Type::Unit
            }

            Expr::TupleField { expr: base, index } => {
                let base_ty = self.check_expr(base);
                match self.finalize(&base_ty).base() {
                    Type::Tuple(elems) => {
                        if *index < elems.len() {
                            elems[*index].clone()
                        } else {
                            self.errors.push(CompileError::type_error(
                                format!("tuple index {index} out of range (len {})", elems.len()),
                                span,
                            ));
                            self.fresh_var()
                        }
                    }
                    other => {
                        self.errors.push(CompileError::type_error(
                            format!("tuple field access on non-tuple {other}"),
                            span,
                        ));
                        self.fresh_var()
                    }
                }
            }

            Expr::EnumVariant {
                enum_name,
                variant,
                args,
            } => {
                let arg_tys: Vec<Type> = args.iter().map(|a| self.check_expr(a)).collect();
                let Some(def) = self.enums.get(enum_name).cloned() else {
                    self.errors.push(CompileError::type_error(
                        format!("unknown enum `{enum_name}`"),
                        span,
                    ));
                    return self.fresh_var();
                };
                match def.variants.iter().find(|v| v.name.node == *variant) {
                    Some(vdef) => {
                        if vdef.fields.len() != args.len() {
                            self.errors.push(CompileError::type_error(
                                format!(
                                    "variant `{enum_name}::{variant}` expects {} argument(s), got {}",
                                    vdef.fields.len(),
                                    args.len()
                                ),
                                span,
                            ));
                        } else {
                            for ((want, got), arg) in vdef.fields.iter().zip(&arg_tys).zip(args) {
                                self.expect_ty(got, &want.node, arg.span);
                            }
                        }
                        Type::Named(enum_name.clone())
                    }
                    None => {
                        self.errors.push(CompileError::type_error(
                            format!("enum `{enum_name}` has no variant `{variant}`"),
                            span,
                        ));
                        Type::Named(enum_name.clone())
                    }
                }
            }

            Expr::Match { expr: scrutinee, arms } => self.check_match(scrutinee, arms, span),

            Expr::Ref(inner) => {
                let t = self.check_expr(inner);
                Type::Ref(Box::new(t))
            }
            Expr::RefMut(inner) => {
                if let Expr::Var(name) = &inner.node
                    && let Some(info) = self.lookup(name)
                    && !info.mutable
                {
                    self.errors.push(CompileError::type_error(
                        format!("cannot take &mut of immutable binding `{name}`"),
                        span,
                    ));
                }
                let t = self.check_expr(inner);
                Type::RefMut(Box::new(t))
            }
            Expr::Deref(inner) => {
                let t = self.check_expr(inner);
                match self.finalize(&t).base() {
                    Type::Ref(inner) | Type::RefMut(inner) | Type::Ptr(inner) => (**inner).clone(),
                    other => {
                        self.errors.push(CompileError::type_error(
                            format!("cannot dereference {other}"),
                            span,
                        ));
                        self.fresh_var()
                    }
                }
            }

            Expr::ArrayLit(elems) => {
                let elem_ty = self.fresh_var();
                for e in elems {
                    let t = self.check_expr(e);
                    self.expect_ty(&t, &elem_ty, e.span);
                }
                Type::Array(Box::new(elem_ty), elems.len())
            }

            Expr::Tuple(elems) => Type::Tuple(elems.iter().map(|e| self.check_expr(e)).collect()),

            Expr::Index { expr: base, index } => {
                let base_ty = self.check_expr(base);
                let index_ty = self.check_expr(index);
                self.expect_ty(&index_ty, &Type::I64, index.span);
                self.index_result_type(&base_ty, span)
            }

            Expr::IndexAssign {
                array,
                index,
                value,
            } => {
                let base_ty = self.check_expr(array);
                let index_ty = self.check_expr(index);
                self.expect_ty(&index_ty, &Type::I64, index.span);
                let elem_ty = self.index_result_type(&base_ty, span);
                let value_ty = self.check_expr(value);
                self.expect_ty(&value_ty, &elem_ty, value.span);
                Type::Unit
            }

            Expr::Closure {
                params,
                ret_ty,
                body,
            } => {
                self.push_scope();
                let mut param_tys = Vec::new();
                for p in params {
                    let ty = match &p.ty {
                        Some(t) => t.node.clone(),
                        None => self.fresh_var(),
                    };
                    self.bind(p.name.node.clone(), ty.clone(), false, p.name.span);
                    param_tys.push(ty);
                }
                let body_ty = self.check_expr(body);
                if let Some(ann) = ret_ty {
                    self.expect_ty(&body_ty, &ann.node, body.span);
                }
                self.pop_scope_with_warnings();
                Type::Fn {
                    params: param_tys,
                    ret: Box::new(body_ty),
                }
            }

            Expr::Cast { expr: inner, ty } => {
                let from = self.check_expr(inner);
                let from = self.finalize(&from);
                let to = &ty.node;
                let ok = (from.is_numeric() && to.is_numeric())
                    || (from.is_integer() && matches!(to.base(), Type::Bool))
                    || (matches!(from.base(), Type::Bool) && to.is_integer())
                    || matches!(from, Type::Var(_));
                if !ok {
                    self.errors.push(CompileError::type_error(
                        format!("invalid cast from {from} to {to}"),
                        span,
                    ));
                }
                to.clone()
            }

            Expr::Spawn { .. } => {
                // Reported once per function in check_function.
                Type::Unit
            }
        }
    }

    fn check_binary(
        &mut self,
        left: &Spanned<Expr>,
        op: BinOp,
        right: &Spanned<Expr>,
        span: Span,
    ) -> Type {
        let lt = self.check_expr(left);
        let rt = self.check_expr(right);
        match op {
            BinOp::Add => {
                // String + String is concatenation.
                if self.finalize(&lt).base() == &Type::String {
                    self.expect_ty(&rt, &Type::String, right.span);
                    return Type::String;
                }
                self.numeric_binop(&lt, &rt, span)
            }
            BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => self.numeric_binop(&lt, &rt, span),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                if self.unify(&lt, &rt, span).is_err() {
                    let l_shown = self.finalize(&lt);
                    let r_shown = self.finalize(&rt);
                    self.errors.push(CompileError::type_error(
                        format!("cannot compare {l_shown} with {r_shown}"),
                        span,
                    ));
                }
                Type::Bool
            }
            BinOp::And | BinOp::Or => {
                self.expect_ty(&lt, &Type::Bool, left.span);
                self.expect_ty(&rt, &Type::Bool, right.span);
                Type::Bool
            }
            BinOp::Band | BinOp::Bor | BinOp::Bxor | BinOp::Shl | BinOp::Shr => {
                self.expect_ty(&lt, &Type::I64, left.span);
                self.expect_ty(&rt, &Type::I64, right.span);
                Type::I64
            }
        }
    }

    fn numeric_binop(&mut self, lt: &Type, rt: &Type, span: Span) -> Type {
        match self.unify(lt, rt, span) {
            Ok(t) => {
                let resolved = self.finalize(&t);
                if !matches!(resolved, Type::Var(_)) && !resolved.is_numeric() {
                    self.errors.push(CompileError::type_error(
                        format!("arithmetic on non-numeric type {resolved}"),
                        span,
                    ));
                }
                t
            }
            Err(()) => {
                let l_shown = self.finalize(lt);
                let r_shown = self.finalize(rt);
                self.errors.push(CompileError::type_error(
                    format!("mismatched operands: {l_shown} vs {r_shown}"),
                    span,
                ));
                lt.clone()
            }
        }
    }

    fn index_result_type(&mut self, base_ty: &Type, span: Span) -> Type {
        let resolved = self.finalize(base_ty);
        // Indexing sees through one level of reference without copying.
        let target = match resolved.base() {
            Type::Ref(inner) | Type::RefMut(inner) => (**inner).clone(),
            other => other.clone(),
        };
        match target.base() {
            Type::Array(elem, _) => (**elem).clone(),
            Type::Slice(elem) => (**elem).clone(),
            Type::String => Type::I64,
            other => {
                self.errors.push(CompileError::type_error(
                    format!("cannot index into {other}"),
                    span,
                ));
                self.fresh_var()
            }
        }
    }

    fn check_field_access(&mut self, base_ty: &Type, field: &Spanned<String>, span: Span) -> Type {
        let resolved = self.finalize(base_ty);
        // See through references and raw pointers; null is the caller's
        // runtime concern on *T.
        let target = match resolved.base() {
            Type::Ref(inner) | Type::RefMut(inner) | Type::Ptr(inner) => (**inner).clone(),
            other => other.clone(),
        };
        match target.base() {
            Type::Named(name) => {
                let Some(def) = self.structs.get(name).cloned() else {
                    self.errors.push(CompileError::type_error(
                        format!("unknown struct `{name}`"),
                        span,
                    ));
                    return self.fresh_var();
                };
                match def.fields.iter().find(|f| f.name.node == field.node) {
                    Some(f) => f.ty.node.clone(),
                    None => {
                        let names: Vec<String> =
                            def.fields.iter().map(|f| f.name.node.clone()).collect();
                        let hint = find_similar_name(&field.node, &names)
                            .map(|s| format!("; did you mean `{s}`?"))
                            .unwrap_or_default();
                        self.errors.push(CompileError::type_error(
                            format!("struct `{name}` has no field `{}`{hint}", field.node),
                            field.span,
                        ));
                        self.fresh_var()
                    }
                }
            }
            Type::Generic { name, args } => {
                let Some(template) = self.generic_structs.get(name).cloned() else {
                    self.errors.push(CompileError::type_error(
                        format!("unknown struct `{name}`"),
                        span,
                    ));
                    return self.fresh_var();
                };
                let subst: HashMap<String, Type> = template
                    .type_params
                    .iter()
                    .map(|p| p.name.node.clone())
                    .zip(args.iter().cloned())
                    .collect();
                match template.fields.iter().find(|f| f.name.node == field.node) {
                    Some(f) => substitute(&f.ty.node, &subst),
                    None => {
                        self.errors.push(CompileError::type_error(
                            format!("struct `{name}` has no field `{}`", field.node),
                            field.span,
                        ));
                        self.fresh_var()
                    }
                }
            }
            other => {
                self.errors.push(CompileError::type_error(
                    format!("field access on non-struct type {other}"),
                    span,
                ));
                self.fresh_var()
            }
        }
    }

    fn check_struct_init(
        &mut self,
        name: &str,
        fields: &[(Spanned<String>, Spanned<Expr>)],
        span: Span,
    ) -> Type {
        if let Some(def) = self.structs.get(name).cloned() {
            self.check_struct_fields(&def, fields, &HashMap::new(), span);
            return Type::Named(name.to_string());
        }
        if let Some(template) = self.generic_structs.get(name).cloned() {
            // Infer the type arguments from the field initializers.
            let mut subst: HashMap<String, Type> = HashMap::new();
            for p in &template.type_params {
                let v = self.fresh_var();
                subst.insert(p.name.node.clone(), v);
            }
            self.check_struct_fields(&template, fields, &subst, span);
            let args: Vec<Type> = template
                .type_params
                .iter()
                .map(|p| self.finalize(&subst[&p.name.node]))
                .collect();
            let instance = self.monomorphize_struct(&template, &args);
            self.mono_structs.insert(span, instance);
            return Type::Generic {
                name: name.to_string(),
                args,
            };
        }
        self.errors.push(CompileError::type_error(
            format!("unknown struct `{name}`"),
            span,
        ));
        self.fresh_var()
    }

    fn check_struct_fields(
        &mut self,
        def: &StructDef,
        fields: &[(Spanned<String>, Spanned<Expr>)],
        subst: &HashMap<String, Type>,
        span: Span,
    ) {
        for field_def in &def.fields {
            if !fields.iter().any(|(n, _)| n.node == field_def.name.node) {
                self.errors.push(CompileError::type_error(
                    format!(
                        "missing field `{}` in `new {}` literal",
                        field_def.name.node, def.name.node
                    ),
                    span,
                ));
            }
        }
        for (fname, fvalue) in fields {
            let got = self.check_expr(fvalue);
            match def.fields.iter().find(|f| f.name.node == fname.node) {
                Some(fdef) => {
                    let want = substitute(&fdef.ty.node, subst);
                    self.expect_ty(&got, &want, fvalue.span);
                }
                None => {
                    self.errors.push(CompileError::type_error(
                        format!("struct `{}` has no field `{}`", def.name.node, fname.node),
                        fname.span,
                    ));
                }
            }
        }
    }

    fn check_call(&mut self, func: &str, args: &[Spanned<Expr>], span: Span) -> Type {
        let arg_tys: Vec<Type> = args.iter().map(|a| self.check_expr(a)).collect();

        // Concrete function or builtin
        if let Some(sig) = self.functions.get(func).cloned() {
            if sig.params.len() != arg_tys.len() {
                self.errors.push(CompileError::type_error(
                    format!(
                        "`{func}` expects {} argument(s), got {}",
                        sig.params.len(),
                        arg_tys.len()
                    ),
                    span,
                ));
                return sig.ret;
            }
            for (((_, want), got), arg) in sig.params.iter().zip(&arg_tys).zip(args) {
                self.expect_ty(got, want, arg.span);
            }
            return sig.ret;
        }

        // Generic template: infer type arguments, monomorphize, retarget
        // the call site to the instance.
        if let Some(template) = self.generic_functions.get(func).cloned() {
            if template.params.len() != arg_tys.len() {
                self.errors.push(CompileError::type_error(
                    format!(
                        "`{func}` expects {} argument(s), got {}",
                        template.params.len(),
                        arg_tys.len()
                    ),
                    span,
                ));
                return self.fresh_var();
            }
            let mut subst: HashMap<String, Type> = HashMap::new();
            for p in &template.type_params {
                let v = self.fresh_var();
                subst.insert(p.name.node.clone(), v);
            }
            for ((param, got), arg) in template.params.iter().zip(&arg_tys).zip(args) {
                let want = substitute(&param.ty.node, &subst);
                self.expect_ty(got, &want, arg.span);
            }
            let type_args: Vec<Type> = template
                .type_params
                .iter()
                .map(|p| self.finalize(&subst[&p.name.node]))
                .collect();
            let instance = self.monomorphize_fn(&template, &type_args);
            self.mono_calls.insert(span, instance.clone());
            return self
                .functions
                .get(&instance)
                .map(|s| s.ret.clone())
                .unwrap_or_else(|| self.fresh_var());
        }

        // Variable of function type: indirect call
        if let Some(info) = self.lookup(func) {
            if let Type::Fn { params, ret } = self.finalize(&info.ty) {
                if params.len() != arg_tys.len() {
                    self.errors.push(CompileError::type_error(
                        format!(
                            "`{func}` expects {} argument(s), got {}",
                            params.len(),
                            arg_tys.len()
                        ),
                        span,
                    ));
                }
                for ((want, got), arg) in params.iter().zip(&arg_tys).zip(args) {
                    self.expect_ty(got, want, arg.span);
                }
                return (*ret).clone();
            }
            self.errors
                .push(CompileError::type_error(format!("`{func}` is not callable"), span));
            return self.fresh_var();
        }

        let mut candidates: Vec<String> = self.functions.keys().cloned().collect();
        candidates.extend(self.generic_functions.keys().cloned());
        let hint = find_similar_name(func, &candidates)
            .map(|s| format!("; did you mean `{s}`?"))
            .unwrap_or_default();
        self.errors.push(CompileError::type_error(
            format!("unknown function `{func}`{hint}"),
            span,
        ));
        self.fresh_var()
    }

    fn check_method_call(
        &mut self,
        receiver: &Spanned<Expr>,
        method: &str,
        args: &[Spanned<Expr>],
        span: Span,
    ) -> Type {
        let recv_ty = self.check_expr(receiver);
        let arg_tys: Vec<Type> = args.iter().map(|a| self.check_expr(a)).collect();
        let resolved = self.finalize(&recv_ty);
        let target = match resolved.base() {
            Type::Ref(inner) | Type::RefMut(inner) => (**inner).clone(),
            other => other.clone(),
        };

        // Built-in string methods
        if target.base() == &Type::String {
            match (method, arg_tys.len()) {
                ("len", 0) => return Type::I64,
                ("byte_at", 1) => {
                    let got = arg_tys[0].clone();
                    self.expect_ty(&got, &Type::I64, args[0].span);
                    return Type::I64;
                }
                ("slice", 2) => {
                    for (got, arg) in arg_tys.iter().zip(args) {
                        let got = got.clone();
                        self.expect_ty(&got, &Type::I64, arg.span);
                    }
                    return Type::String;
                }
                ("concat", 1) => {
                    let got = arg_tys[0].clone();
                    self.expect_ty(&got, &Type::String, args[0].span);
                    return Type::String;
                }
                _ => {
                    self.errors.push(CompileError::type_error(
                        format!("String has no method `{method}` with {} argument(s)", args.len()),
                        span,
                    ));
                    return self.fresh_var();
                }
            }
        }

        // Trait-impl methods on named types
        if let Some(type_name) = target.struct_base_name() {
            let sig = self
                .impl_methods
                .get(type_name)
                .and_then(|methods| methods.get(method))
                .cloned();
            if let Some(sig) = sig {
                self.method_calls
                    .insert(span, format!("{type_name}_{method}"));
                // Receiver binds the first parameter.
                let expected_args = sig.params.len().saturating_sub(1);
                if args.len() != expected_args {
                    self.errors.push(CompileError::type_error(
                        format!(
                            "method `{method}` expects {expected_args} argument(s), got {}",
                            args.len()
                        ),
                        span,
                    ));
                } else {
                    for ((want, got), arg) in sig.params[1..].iter().zip(&arg_tys).zip(args) {
                        self.expect_ty(got, &want.1, arg.span);
                    }
                }
                return sig.ret;
            }
        }

        self.errors.push(CompileError::type_error(
            format!("type {target} has no method `{method}`"),
            span,
        ));
        self.fresh_var()
    }

    fn check_match(&mut self, scrutinee: &Spanned<Expr>, arms: &[MatchArm], span: Span) -> Type {
        let scrut_ty = self.check_expr(scrutinee);
        let scrut_resolved = self.finalize(&scrut_ty);
        let mut result: Option<Type> = None;

        for arm in arms {
            self.push_scope();
            self.check_pattern(&arm.pattern, &scrut_resolved);
            if let Some(guard) = &arm.guard {
                let g = self.check_expr(guard);
                self.expect_ty(&g, &Type::Bool, guard.span);
            }
            let body_ty = self.check_expr(&arm.body);
            self.pop_scope_with_warnings();
            result = Some(match result {
                None => body_ty,
                Some(prev) => match self.unify(&prev, &body_ty, arm.body.span) {
                    Ok(t) => t,
                    Err(()) => {
                        let p_shown = self.finalize(&prev);
                        let b_shown = self.finalize(&body_ty);
                        self.errors.push(CompileError::type_error(
                            format!("match arms disagree: {p_shown} vs {b_shown}"),
                            arm.body.span,
                        ));
                        prev
                    }
                },
            });
        }

        // Exhaustiveness
        let enum_def = match scrut_resolved.base() {
            Type::Named(name) => self.enums.get(name),
            _ => None,
        };
        match exhaustiveness::check_match(arms, &scrut_resolved, enum_def) {
            exhaustiveness::MatchCoverage::Exhaustive => {}
            exhaustiveness::MatchCoverage::Missing(missing) => {
                self.errors.push(CompileError::type_error(
                    format!("non-exhaustive match: missing {missing}"),
                    span,
                ));
            }
            exhaustiveness::MatchCoverage::GuardedOnly => {
                self.warnings.push(CompileWarning::Generic {
                    message: "match relies on guards with no unconditional fallback".into(),
                    span: Some(span),
                });
            }
        }
        for idx in exhaustiveness::unreachable_arms(arms) {
            self.warnings.push(CompileWarning::UnreachablePattern {
                message: format!("match arm #{} is unreachable", idx + 1),
                span: arms[idx].pattern.span,
            });
        }

        result.unwrap_or(Type::Never)
    }

    fn check_pattern(&mut self, pattern: &Spanned<Pattern>, scrut_ty: &Type) {
        match &pattern.node {
            Pattern::Wildcard => {}
            Pattern::Var(name) => {
                self.bind(name.clone(), scrut_ty.clone(), false, pattern.span);
                self.register_struct_var(name, scrut_ty);
            }
            Pattern::Literal(lit) => {
                let lit_ty = match lit {
                    LiteralPattern::Int(_) => Type::I64,
                    LiteralPattern::Float(_) => Type::F64,
                    LiteralPattern::Bool(_) => Type::Bool,
                    LiteralPattern::String(_) => Type::String,
                };
                let scrut = scrut_ty.clone();
                self.expect_ty(&lit_ty, &scrut, pattern.span);
            }
            Pattern::Tuple(pats) => match scrut_ty.base() {
                Type::Tuple(elems) if elems.len() == pats.len() => {
                    for (p, t) in pats.iter().zip(elems.clone()) {
                        self.check_pattern(p, &t);
                    }
                }
                other => {
                    self.errors.push(CompileError::type_error(
                        format!("tuple pattern does not match scrutinee type {other}"),
                        pattern.span,
                    ));
                }
            },
            Pattern::EnumVariant {
                enum_name,
                variant,
                bindings,
            } => {
                let matches_scrut = matches!(scrut_ty.base(), Type::Named(n) if n == enum_name);
                if !matches_scrut {
                    self.errors.push(CompileError::type_error(
                        format!(
                            "pattern `{enum_name}::{variant}` does not match scrutinee type {scrut_ty}"
                        ),
                        pattern.span,
                    ));
                    return;
                }
                let Some(def) = self.enums.get(enum_name).cloned() else {
                    self.errors.push(CompileError::type_error(
                        format!("unknown enum `{enum_name}`"),
                        pattern.span,
                    ));
                    return;
                };
                match def.variants.iter().find(|v| v.name.node == *variant) {
                    Some(vdef) => {
                        if vdef.fields.len() != bindings.len() {
                            self.errors.push(CompileError::type_error(
                                format!(
                                    "variant `{enum_name}::{variant}` has {} field(s), pattern binds {}",
                                    vdef.fields.len(),
                                    bindings.len()
                                ),
                                pattern.span,
                            ));
                            return;
                        }
                        for (b, t) in bindings.iter().zip(vdef.fields.clone()) {
                            self.check_pattern(b, &t.node);
                        }
                    }
                    None => {
                        self.errors.push(CompileError::type_error(
                            format!("enum `{enum_name}` has no variant `{variant}`"),
                            pattern.span,
                        ));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Monomorphization
    // ------------------------------------------------------------------

    fn monomorphize_fn(&mut self, template: &FnDef, type_args: &[Type]) -> String {
        let key = (template.name.node.clone(), mangle("", type_args));
        if let Some(name) = self.mono_fn_memo.get(&key) {
            return name.clone();
        }
        let instance_name = mangle(&template.name.node, type_args);
        self.mono_fn_memo.insert(key, instance_name.clone());

        let subst: HashMap<String, Type> = template
            .type_params
            .iter()
            .map(|p| p.name.node.clone())
            .zip(type_args.iter().cloned())
            .collect();

        let mut instance = template.clone();
        instance.name = Spanned::new(instance_name.clone(), template.name.span);
        instance.type_params.clear();
        for p in &mut instance.params {
            p.ty = Spanned::new(substitute(&p.ty.node, &subst), p.ty.span);
        }
        instance.ret_ty = Spanned::new(
            substitute(&instance.ret_ty.node, &subst),
            instance.ret_ty.span,
        );
        substitute_expr(&mut instance.body, &subst);
        // Monomorphized instances stay private to the module.
        instance.visibility = Visibility::Private;

        self.functions.insert(
            instance_name.clone(),
            FnSig {
                params: instance
                    .params
                    .iter()
                    .map(|p| (p.name.node.clone(), p.ty.node.clone()))
                    .collect(),
                ret: instance.ret_ty.node.clone(),
                is_pure: instance.is_pure(),
            },
        );
        self.mono_pending.push(instance);
        instance_name
    }

    fn monomorphize_struct(&mut self, template: &StructDef, type_args: &[Type]) -> String {
        let key = (template.name.node.clone(), mangle("", type_args));
        if let Some(name) = self.mono_struct_memo.get(&key) {
            return name.clone();
        }
        let instance_name = mangle(&template.name.node, type_args);
        self.mono_struct_memo.insert(key, instance_name.clone());

        let subst: HashMap<String, Type> = template
            .type_params
            .iter()
            .map(|p| p.name.node.clone())
            .zip(type_args.iter().cloned())
            .collect();

        let mut instance = template.clone();
        instance.name = Spanned::new(instance_name.clone(), template.name.span);
        instance.type_params.clear();
        for f in &mut instance.fields {
            f.ty = Spanned::new(substitute(&f.ty.node, &subst), f.ty.span);
        }
        self.structs.insert(instance_name.clone(), instance.clone());
        self.mono_items.push(Item::StructDef(instance));
        instance_name
    }
}

/// Deterministic instance name from the template name and type args.
/// Also used by MIR lowering to name generic struct applications.
pub(crate) fn mangle(base: &str, type_args: &[Type]) -> String {
    let mut out = String::from(base);
    for arg in type_args {
        out.push('_');
        out.push_str(&mangle_type(arg));
    }
    out
}

fn mangle_type(ty: &Type) -> String {
    match ty {
        Type::I8 => "i8".into(),
        Type::I16 => "i16".into(),
        Type::I32 => "i32".into(),
        Type::I64 => "i64".into(),
        Type::F32 => "f32".into(),
        Type::F64 => "f64".into(),
        Type::Bool => "bool".into(),
        Type::String => "String".into(),
        Type::Unit => "unit".into(),
        Type::Named(n) => n.clone(),
        Type::Generic { name, args } => mangle(name, args),
        Type::Ptr(t) => format!("ptr_{}", mangle_type(t)),
        Type::Ref(t) | Type::RefMut(t) => format!("ref_{}", mangle_type(t)),
        Type::Nullable(t) => format!("opt_{}", mangle_type(t)),
        Type::Array(t, n) => format!("arr{}_{}", n, mangle_type(t)),
        Type::Slice(t) => format!("slice_{}", mangle_type(t)),
        Type::Tuple(ts) => {
            let mut s = String::from("tup");
            for t in ts {
                s.push('_');
                s.push_str(&mangle_type(t));
            }
            s
        }
        other => format!("{other}").replace(['<', '>', ' ', ',', '?'], "_"),
    }
}

/// Substitute named type parameters in a type.
pub(crate) fn substitute(ty: &Type, subst: &HashMap<String, Type>) -> Type {
    match ty {
        Type::Named(name) => subst.get(name).cloned().unwrap_or_else(|| ty.clone()),
        Type::Array(t, n) => Type::Array(Box::new(substitute(t, subst)), *n),
        Type::Slice(t) => Type::Slice(Box::new(substitute(t, subst))),
        Type::Ref(t) => Type::Ref(Box::new(substitute(t, subst))),
        Type::RefMut(t) => Type::RefMut(Box::new(substitute(t, subst))),
        Type::Ptr(t) => Type::Ptr(Box::new(substitute(t, subst))),
        Type::Nullable(t) => Type::Nullable(Box::new(substitute(t, subst))),
        Type::Tuple(ts) => Type::Tuple(ts.iter().map(|t| substitute(t, subst)).collect()),
        Type::Generic { name, args } => Type::Generic {
            name: name.clone(),
            args: args.iter().map(|t| substitute(t, subst)).collect(),
        },
        Type::Fn { params, ret } => Type::Fn {
            params: params.iter().map(|t| substitute(t, subst)).collect(),
            ret: Box::new(substitute(ret, subst)),
        },
        Type::Refined { base, constraints } => Type::Refined {
            base: Box::new(substitute(base, subst)),
            constraints: constraints.clone(),
        },
        other => other.clone(),
    }
}

/// Substitute type parameters inside type annotations of an expression.
fn substitute_expr(expr: &mut Spanned<Expr>, subst: &HashMap<String, Type>) {
    match &mut expr.node {
        Expr::Let { ty, value, body, .. } => {
            if let Some(ann) = ty {
                ann.node = substitute(&ann.node, subst);
            }
            substitute_expr(value, subst);
            substitute_expr(body, subst);
        }
        Expr::Cast { expr: inner, ty } => {
            ty.node = substitute(&ty.node, subst);
            substitute_expr(inner, subst);
        }
        Expr::Binary { left, right, .. } => {
            substitute_expr(left, subst);
            substitute_expr(right, subst);
        }
        Expr::Unary { expr: inner, .. }
        | Expr::Ref(inner)
        | Expr::RefMut(inner)
        | Expr::Deref(inner)
        | Expr::Old(inner)
        | Expr::Spawn { body: inner }
        | Expr::Loop { body: inner } => substitute_expr(inner, subst),
        Expr::If {
            cond,
            then_branch,
            else_branch,
        } => {
            substitute_expr(cond, subst);
            substitute_expr(then_branch, subst);
            substitute_expr(else_branch, subst);
        }
        Expr::While {
            cond,
            invariant,
            body,
        } => {
            substitute_expr(cond, subst);
            if let Some(inv) = invariant {
                substitute_expr(inv, subst);
            }
            substitute_expr(body, subst);
        }
        Expr::For { iter, body, .. } => {
            substitute_expr(iter, subst);
            substitute_expr(body, subst);
        }
        Expr::Range { start, end, .. } => {
            substitute_expr(start, subst);
            substitute_expr(end, subst);
        }
        Expr::Call { args, .. } | Expr::EnumVariant { args, .. } => {
            for a in args {
                substitute_expr(a, subst);
            }
        }
        Expr::MethodCall { receiver, args, .. } => {
            substitute_expr(receiver, subst);
            for a in args {
                substitute_expr(a, subst);
            }
        }
        Expr::StructInit { fields, .. } => {
            for (_, v) in fields {
                substitute_expr(v, subst);
            }
        }
        Expr::FieldAccess { expr: inner, .. } | Expr::TupleField { expr: inner, .. } => {
            substitute_expr(inner, subst)
        }
        Expr::FieldAssign { object, value, .. } => {
            substitute_expr(object, subst);
            substitute_expr(value, subst);
        }
        Expr::Match { expr: scrut, arms } => {
            substitute_expr(scrut, subst);
            for arm in arms {
                if let Some(g) = &mut arm.guard {
                    substitute_expr(g, subst);
                }
                substitute_expr(&mut arm.body, subst);
            }
        }
        Expr::ArrayLit(elems) | Expr::Tuple(elems) => {
            for e in elems {
                substitute_expr(e, subst);
            }
        }
        Expr::Index { expr: base, index } => {
            substitute_expr(base, subst);
            substitute_expr(index, subst);
        }
        Expr::IndexAssign {
            array,
            index,
            value,
        } => {
            substitute_expr(array, subst);
            substitute_expr(index, subst);
            substitute_expr(value, subst);
        }
        Expr::Assign { value, .. } => substitute_expr(value, subst),
        Expr::Break { value } | Expr::Return { value } => {
            if let Some(v) = value {
                substitute_expr(v, subst);
            }
        }
        Expr::Closure {
            ret_ty,
            body,
            params,
        } => {
            for p in params {
                if let Some(ann) = &mut p.ty {
                    ann.node = substitute(&ann.node, subst);
                }
            }
            if let Some(ann) = ret_ty {
                ann.node = substitute(&ann.node, subst);
            }
            substitute_expr(body, subst);
        }
        _ => {}
    }
}

fn find_spawn(expr: &Spanned<Expr>) -> Option<Span> {
    match &expr.node {
        Expr::Spawn { .. } => Some(expr.span),
        Expr::Let { value, body, .. } => find_spawn(value).or_else(|| find_spawn(body)),
        Expr::Binary { left, right, .. } => find_spawn(left).or_else(|| find_spawn(right)),
        Expr::If {
            cond,
            then_branch,
            else_branch,
        } => find_spawn(cond)
            .or_else(|| find_spawn(then_branch))
            .or_else(|| find_spawn(else_branch)),
        Expr::While { cond, body, .. } => find_spawn(cond).or_else(|| find_spawn(body)),
        Expr::For { iter, body, .. } => find_spawn(iter).or_else(|| find_spawn(body)),
        Expr::Loop { body } => find_spawn(body),
        Expr::Call { args, .. } => args.iter().find_map(find_spawn),
        Expr::Match { expr: scrut, arms } => {
            find_spawn(scrut).or_else(|| arms.iter().find_map(|a| find_spawn(&a.body)))
        }
        _ => None,
    }
}

/// Surface-level builtin signatures: the primitives the runtime exports.
fn builtin_signatures() -> HashMap<String, FnSig> {
    fn sig(params: &[Type], ret: Type) -> FnSig {
        FnSig {
            params: params
                .iter()
                .enumerate()
                .map(|(i, t)| (format!("a{i}"), t.clone()))
                .collect(),
            ret,
            is_pure: false,
        }
    }
    use Type::*;
    let mut m = HashMap::new();
    // Numeric output
    m.insert("println".into(), sig(&[I64], Unit));
    m.insert("print".into(), sig(&[I64], Unit));
    m.insert("println_f64".into(), sig(&[F64], Unit));
    m.insert("print_f64".into(), sig(&[F64], Unit));
    m.insert("println_str".into(), sig(&[String], Unit));
    m.insert("print_str".into(), sig(&[String], Unit));
    m.insert("read_int".into(), sig(&[], I64));
    m.insert("assert".into(), sig(&[Bool], Unit));
    // Math
    m.insert("abs".into(), sig(&[I64], I64));
    m.insert("min".into(), sig(&[I64, I64], I64));
    m.insert("max".into(), sig(&[I64, I64], I64));
    m.insert("sqrt".into(), sig(&[F64], F64));
    m.insert("i64_to_f64".into(), sig(&[I64], F64));
    m.insert("f64_to_i64".into(), sig(&[F64], I64));
    // Strings
    m.insert("len".into(), sig(&[String], I64));
    m.insert("byte_at".into(), sig(&[String, I64], I64));
    m.insert("slice".into(), sig(&[String, I64, I64], String));
    m.insert("chr".into(), sig(&[I64], String));
    m.insert("ord".into(), sig(&[String], I64));
    m.insert("digit_char".into(), sig(&[I64], String));
    m.insert("int_to_string".into(), sig(&[I64], String));
    m.insert("string_eq".into(), sig(&[String, String], I64));
    // StringBuilder (opaque i64 handle)
    m.insert("sb_new".into(), sig(&[], I64));
    m.insert("sb_push".into(), sig(&[I64, String], I64));
    m.insert("sb_push_char".into(), sig(&[I64, I64], I64));
    m.insert("sb_push_int".into(), sig(&[I64, I64], I64));
    m.insert("sb_push_escaped".into(), sig(&[I64, String], I64));
    m.insert("sb_len".into(), sig(&[I64], I64));
    m.insert("sb_build".into(), sig(&[I64], String));
    m.insert("sb_clear".into(), sig(&[I64], I64));
    // Vector (opaque i64 handle)
    m.insert("vec_new".into(), sig(&[], I64));
    m.insert("vec_with_capacity".into(), sig(&[I64], I64));
    m.insert("vec_push".into(), sig(&[I64, I64], Unit));
    m.insert("vec_pop".into(), sig(&[I64], I64));
    m.insert("vec_get".into(), sig(&[I64, I64], I64));
    m.insert("vec_set".into(), sig(&[I64, I64, I64], Unit));
    m.insert("vec_len".into(), sig(&[I64], I64));
    m.insert("vec_cap".into(), sig(&[I64], I64));
    m.insert("vec_clear".into(), sig(&[I64], Unit));
    m.insert("vec_free".into(), sig(&[I64], I64));
    // HashMap (opaque i64 handle, INT64_MIN sentinel on miss)
    m.insert("hashmap_new".into(), sig(&[], I64));
    m.insert("hashmap_free".into(), sig(&[I64], I64));
    m.insert("hashmap_len".into(), sig(&[I64], I64));
    m.insert("hashmap_insert".into(), sig(&[I64, I64, I64], I64));
    m.insert("hashmap_get".into(), sig(&[I64, I64], I64));
    m.insert("hashmap_remove".into(), sig(&[I64, I64], I64));
    // File I/O
    m.insert("read_file".into(), sig(&[String], String));
    m.insert("write_file".into(), sig(&[String, String], I64));
    m.insert("append_file".into(), sig(&[String, String], I64));
    m.insert("file_exists".into(), sig(&[String], I64));
    m.insert("file_size".into(), sig(&[String], I64));
    // Process
    m.insert("system".into(), sig(&[String], I64));
    m.insert("getenv".into(), sig(&[String], String));
    m.insert("exec".into(), sig(&[String], String));
    // CLI arguments
    m.insert("arg_count".into(), sig(&[], I64));
    m.insert("get_arg".into(), sig(&[I64], String));
    // Manual memory
    m.insert("malloc".into(), sig(&[I64], I64));
    // free returns i64 so it is usable in conditional branches.
    m.insert("free".into(), sig(&[I64], I64));
    m
}

#[cfg(test)]
mod tests;
