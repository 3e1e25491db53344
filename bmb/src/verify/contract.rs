//! Contract verification logic
//!
//! For each function with non-trivial contracts this proves
//! `preconditions ∧ body-effects ⇒ postconditions`, and at every call
//! site proves the callee's preconditions and parameter refinements
//! from the caller's context. Each goal is asserted negated; UNSAT is a
//! proof, SAT yields a counterexample surfaced in the diagnostic.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::ast::{Expr, FnDef, Item, Program, Span, Spanned, Type};
use crate::smt::{
    sanitize_name, SmtError, SmtLibGenerator, SmtSolver, SmtTranslator, SolverResult,
    VerifyResult,
};

/// One discharged (or attempted) goal.
#[derive(Debug, Clone)]
pub struct ObligationResult {
    /// Human-readable description: "postcondition #1", "precondition of
    /// `divide` at call site", ...
    pub what: String,
    pub span: Span,
    pub result: VerifyResult,
}

/// Per-function verification outcome.
#[derive(Debug, Clone, Default)]
pub struct FunctionReport {
    pub name: String,
    pub trusted: bool,
    pub cached: bool,
    pub obligations: Vec<ObligationResult>,
    pub warnings: Vec<String>,
}

impl FunctionReport {
    fn new(name: String) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn is_verified(&self) -> bool {
        self.obligations.iter().all(|o| o.result.is_verified())
    }

    pub fn counterexamples(&self) -> impl Iterator<Item = &ObligationResult> {
        self.obligations
            .iter()
            .filter(|o| matches!(o.result, VerifyResult::CounterExample(_)))
    }

    pub fn unknowns(&self) -> impl Iterator<Item = &ObligationResult> {
        self.obligations
            .iter()
            .filter(|o| matches!(o.result, VerifyResult::Unknown(_)))
    }
}

impl std::fmt::Display for FunctionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.trusted {
            return writeln!(f, "~ {} (trusted)", self.name);
        }
        if self.is_verified() {
            let suffix = if self.cached { " (cached)" } else { "" };
            writeln!(f, "\u{2713} {}{suffix}", self.name)?;
        } else {
            for o in &self.obligations {
                match &o.result {
                    VerifyResult::Verified => {}
                    VerifyResult::CounterExample(model) => {
                        write!(f, "\u{2717} {}: {} fails", self.name, o.what)?;
                        if !model.is_empty() {
                            let bindings: Vec<String> =
                                model.iter().map(|(n, v)| format!("{n} = {v}")).collect();
                            write!(f, " [{}]", bindings.join(", "))?;
                        }
                        writeln!(f)?;
                    }
                    VerifyResult::Unknown(reason) => {
                        writeln!(f, "! {}: {} inconclusive ({reason})", self.name, o.what)?;
                    }
                }
            }
        }
        for w in &self.warnings {
            writeln!(f, "  warning: {w}")?;
        }
        Ok(())
    }
}

/// Whole-program verification outcome.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub functions: Vec<FunctionReport>,
}

impl VerificationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_verified(&self) -> bool {
        self.functions.iter().all(FunctionReport::is_verified)
    }

    pub fn counterexamples(&self) -> impl Iterator<Item = (&FunctionReport, &ObligationResult)> {
        self.functions
            .iter()
            .flat_map(|f| f.counterexamples().map(move |o| (f, o)))
    }

    pub fn unknowns(&self) -> impl Iterator<Item = (&FunctionReport, &ObligationResult)> {
        self.functions
            .iter()
            .flat_map(|f| f.unknowns().map(move |o| (f, o)))
    }
}

impl std::fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for func in &self.functions {
            write!(f, "{func}")?;
        }
        Ok(())
    }
}

/// Contract verifier for BMB programs
pub struct ContractVerifier {
    solver: SmtSolver,
    /// Mirror every query under `<dir>/smt/<hash>.smt2` (--emit-smt)
    query_dump: Option<std::path::PathBuf>,
}

impl Default for ContractVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ContractVerifier {
    pub fn new() -> Self {
        Self {
            solver: SmtSolver::new(),
            query_dump: None,
        }
    }

    pub fn with_solver_path(mut self, path: &str) -> Self {
        self.solver = self.solver.with_path(path);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.solver = self.solver.with_timeout_ms(timeout_ms);
        self
    }

    pub fn with_query_dump(mut self, dir: std::path::PathBuf) -> Self {
        self.query_dump = Some(dir);
        self
    }

    pub fn is_solver_available(&self) -> bool {
        self.solver.is_available()
    }

    /// Verify all functions in a program, consulting and filling the
    /// proof cache.
    pub fn verify_program(
        &self,
        program: &Program,
        db: &mut super::ProofDatabase,
    ) -> VerificationReport {
        let mut report = VerificationReport::new();

        let mut function_index: HashMap<String, &FnDef> = HashMap::new();
        for item in &program.items {
            if let Item::FnDef(func) = item {
                function_index.insert(func.name.node.clone(), func);
            }
        }

        for item in &program.items {
            if let Item::FnDef(func) = item {
                let key = dependency_closure_hash(func, &function_index);
                if let Some(status) = db.cached_status(&func.name.node, key)
                    && status.is_verified()
                {
                    let mut cached = FunctionReport::new(func.name.node.clone());
                    cached.cached = true;
                    cached.trusted =
                        matches!(status, super::VerificationStatus::Trusted(_));
                    report.functions.push(cached);
                    continue;
                }
                let func_report = self.verify_function_with_index(func, &function_index);
                db.record(&func.name.node, key, &func_report);
                report.functions.push(func_report);
            }
        }

        report
    }

    /// Verify a single function without cache interaction.
    pub fn verify_function(&self, func: &FnDef) -> FunctionReport {
        self.verify_function_with_index(func, &HashMap::new())
    }

    fn verify_function_with_index(
        &self,
        func: &FnDef,
        function_index: &HashMap<String, &FnDef>,
    ) -> FunctionReport {
        let mut report = FunctionReport::new(func.name.node.clone());

        // @trust bypasses proof generation entirely; the contract still
        // feeds caller-side reasoning below.
        if func.is_trusted() {
            report.trusted = true;
            return report;
        }

        self.detect_duplicate_contracts(func, &mut report);

        let solver_up = self.solver.is_available();

        if func.has_contracts() {
            if solver_up {
                self.detect_trivial_contracts(func, &mut report);
                self.detect_unsatisfiable_precondition(func, &mut report);
            }
            self.verify_own_obligations(func, function_index, solver_up, &mut report);
        }

        // Call sites carry obligations whether or not this function has
        // contracts of its own.
        self.verify_call_sites(func, function_index, solver_up, &mut report);

        if let Some(measure) = func.decreases() {
            self.verify_termination(func, measure, solver_up, &mut report);
        }

        report
    }

    /// Discharge this function's postconditions, named contracts and
    /// return refinement.
    fn verify_own_obligations(
        &self,
        func: &FnDef,
        function_index: &HashMap<String, &FnDef>,
        solver_up: bool,
        report: &mut FunctionReport,
    ) {
        let mut goals: Vec<(String, Span, Spanned<Expr>, Option<String>)> = Vec::new();
        for (i, post) in func.post.iter().enumerate() {
            goals.push((format!("postcondition #{}", i + 1), post.span, post.clone(), None));
        }
        for contract in &func.contracts {
            let label = contract
                .name
                .as_ref()
                .map(|n| format!("contract `{}`", n.node))
                .unwrap_or_else(|| "contract clause".to_string());
            goals.push((
                label,
                contract.condition.span,
                contract.condition.clone(),
                None,
            ));
        }
        if let Type::Refined { constraints, .. } = &func.ret_ty.node {
            for c in constraints {
                goals.push((
                    "return refinement".to_string(),
                    c.span,
                    c.clone(),
                    Some("ret".to_string()),
                ));
            }
        }
        if goals.is_empty() {
            return;
        }

        for (what, span, goal, it_subst) in goals {
            if !solver_up {
                report.obligations.push(ObligationResult {
                    what,
                    span,
                    result: VerifyResult::Unknown("solver not available".into()),
                });
                continue;
            }
            let result = self.prove_goal(func, function_index, &goal, it_subst.as_deref());
            report.obligations.push(ObligationResult { what, span, result });
        }
    }

    /// One `assumptions ∧ (ret = body) ∧ ¬goal` query.
    fn prove_goal(
        &self,
        func: &FnDef,
        function_index: &HashMap<String, &FnDef>,
        goal: &Spanned<Expr>,
        it_subst: Option<&str>,
    ) -> VerifyResult {
        let mut generator = SmtLibGenerator::new();
        let mut translator = SmtTranslator::new();
        translator.setup_function(func, &mut generator);
        register_uninterpreted(&mut translator, function_index);

        if let Err(e) = self.assume_context(func, &mut translator, &mut generator) {
            return VerifyResult::Unknown(e.to_string());
        }

        // Bind the return value to the body where the body translates;
        // otherwise the body's effect is abstracted and only the
        // assumed context can discharge the goal.
        match translator.translate(&func.body, &mut generator) {
            Ok(body) => generator.assert(&format!("(= ret {body})")),
            Err(SmtError::Unsupported(_)) => {}
        }

        // Callee postconditions of verified pure callees are assumed as
        // facts about their uninterpreted applications.
        assume_callee_posts(func, function_index, &mut translator, &mut generator);

        let goal_smt = match translator.translate_with_it(goal, &mut generator, it_subst) {
            Ok(g) => g,
            Err(e) => return VerifyResult::Unknown(e.to_string()),
        };
        generator.assert(&format!("(not {goal_smt})"));

        self.run_query(&generator)
    }

    /// Assert preconditions and parameter refinements as context.
    fn assume_context(
        &self,
        func: &FnDef,
        translator: &mut SmtTranslator,
        generator: &mut SmtLibGenerator,
    ) -> Result<(), SmtError> {
        for pre in &func.pre {
            let smt = translator.translate(pre, generator)?;
            generator.assert(&smt);
        }
        for p in &func.params {
            if let Type::Refined { constraints, .. } = &p.ty.node {
                for c in constraints {
                    let smt = translator.translate_with_it(
                        c,
                        generator,
                        Some(&sanitize_name(&p.name.node)),
                    )?;
                    generator.assert(&smt);
                }
            }
        }
        Ok(())
    }

    /// Prove callee preconditions and parameter refinements at every
    /// call site in the body.
    fn verify_call_sites(
        &self,
        func: &FnDef,
        function_index: &HashMap<String, &FnDef>,
        solver_up: bool,
        report: &mut FunctionReport,
    ) {
        let mut sites = Vec::new();
        collect_call_sites(&func.body, &mut sites);

        for site in sites {
            let Some(callee) = function_index.get(&site.callee) else {
                continue;
            };
            // @trust keeps the contract visible here: callers still
            // must satisfy it.
            let mut goals: Vec<(String, Spanned<Expr>, Option<usize>)> = Vec::new();
            for (i, pre) in callee.pre.iter().enumerate() {
                goals.push((
                    format!("precondition #{} of `{}`", i + 1, site.callee),
                    pre.clone(),
                    None,
                ));
            }
            for (idx, p) in callee.params.iter().enumerate() {
                if let Type::Refined { constraints, .. } = &p.ty.node {
                    for c in constraints {
                        goals.push((
                            format!(
                                "refinement on parameter `{}` of `{}`",
                                p.name.node, site.callee
                            ),
                            c.clone(),
                            Some(idx),
                        ));
                    }
                }
            }
            if goals.is_empty() {
                continue;
            }
            if site.args.len() != callee.params.len() {
                continue; // arity errors belong to the type checker
            }

            for (what, goal, refined_param) in goals {
                if !solver_up {
                    report.obligations.push(ObligationResult {
                        what,
                        span: site.span,
                        result: VerifyResult::Unknown("solver not available".into()),
                    });
                    continue;
                }
                let result = self.prove_call_site(
                    func,
                    callee,
                    &site,
                    &goal,
                    refined_param,
                    function_index,
                );
                report.obligations.push(ObligationResult {
                    what,
                    span: site.span,
                    result,
                });
            }
        }
    }

    fn prove_call_site(
        &self,
        caller: &FnDef,
        callee: &FnDef,
        site: &CallSite,
        goal: &Spanned<Expr>,
        refined_param: Option<usize>,
        function_index: &HashMap<String, &FnDef>,
    ) -> VerifyResult {
        let mut generator = SmtLibGenerator::new();
        let mut translator = SmtTranslator::new();
        translator.setup_function(caller, &mut generator);
        register_uninterpreted(&mut translator, function_index);

        if let Err(e) = self.assume_context(caller, &mut translator, &mut generator) {
            return VerifyResult::Unknown(e.to_string());
        }

        // Translate the argument terms in the caller's environment,
        // then introduce the callee's parameters as constrained
        // variables. Counterexamples therefore bind the callee's own
        // parameter names (`b = 0`), which is what the diagnostic
        // shows.
        let mut translated_args = Vec::with_capacity(site.args.len());
        for arg in &site.args {
            match translator.translate(arg, &mut generator) {
                Ok(t) => translated_args.push(t),
                Err(e) => return VerifyResult::Unknown(e.to_string()),
            }
        }
        for (p, arg_term) in callee.params.iter().zip(&translated_args) {
            let sort = crate::smt::type_to_sort(&p.ty.node);
            generator.declare_var(&p.name.node, sort);
            generator.assert(&format!(
                "(= {} {arg_term})",
                sanitize_name(&p.name.node)
            ));
        }

        let goal_smt = match refined_param {
            Some(idx) => {
                let param_name = sanitize_name(&callee.params[idx].name.node);
                match translator.translate_with_it(goal, &mut generator, Some(&param_name)) {
                    Ok(g) => g,
                    Err(e) => return VerifyResult::Unknown(e.to_string()),
                }
            }
            None => {
                let mut callee_env = SmtTranslator::new();
                register_uninterpreted(&mut callee_env, function_index);
                match callee_env.translate(goal, &mut generator) {
                    Ok(g) => g,
                    Err(e) => return VerifyResult::Unknown(e.to_string()),
                }
            }
        };
        generator.assert(&format!("(not {goal_smt})"));

        self.run_query(&generator)
    }

    /// Prove the @decreases measure strictly decreases and stays
    /// non-negative across every self-call.
    fn verify_termination(
        &self,
        func: &FnDef,
        measure: &Spanned<Expr>,
        solver_up: bool,
        report: &mut FunctionReport,
    ) {
        let mut sites = Vec::new();
        collect_call_sites(&func.body, &mut sites);
        let self_calls: Vec<&CallSite> = sites
            .iter()
            .filter(|s| s.callee == func.name.node)
            .collect();
        if self_calls.is_empty() {
            return;
        }

        for site in self_calls {
            if !solver_up {
                report.obligations.push(ObligationResult {
                    what: "@decreases measure".into(),
                    span: site.span,
                    result: VerifyResult::Unknown("solver not available".into()),
                });
                continue;
            }
            if site.args.len() != func.params.len() {
                continue;
            }
            let mut generator = SmtLibGenerator::new();
            let mut translator = SmtTranslator::new();
            translator.setup_function(func, &mut generator);
            if let Err(e) = self.assume_context(func, &mut translator, &mut generator) {
                report.obligations.push(ObligationResult {
                    what: "@decreases measure".into(),
                    span: site.span,
                    result: VerifyResult::Unknown(e.to_string()),
                });
                continue;
            }

            let before = match translator.translate(measure, &mut generator) {
                Ok(t) => t,
                Err(e) => {
                    report.obligations.push(ObligationResult {
                        what: "@decreases measure".into(),
                        span: site.span,
                        result: VerifyResult::Unknown(e.to_string()),
                    });
                    continue;
                }
            };
            let mut rec_env = SmtTranslator::new();
            rec_env.push_env();
            let mut ok = true;
            for (p, arg) in func.params.iter().zip(&site.args) {
                match translator.translate(arg, &mut generator) {
                    Ok(t) => rec_env.bind(&p.name.node, t),
                    Err(e) => {
                        report.obligations.push(ObligationResult {
                            what: "@decreases measure".into(),
                            span: site.span,
                            result: VerifyResult::Unknown(e.to_string()),
                        });
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                continue;
            }
            let after = match rec_env.translate(measure, &mut generator) {
                Ok(t) => t,
                Err(e) => {
                    report.obligations.push(ObligationResult {
                        what: "@decreases measure".into(),
                        span: site.span,
                        result: VerifyResult::Unknown(e.to_string()),
                    });
                    continue;
                }
            };

            generator.assert(&format!("(not (and (< {after} {before}) (>= {before} 0)))"));
            let result = self.run_query(&generator);
            report.obligations.push(ObligationResult {
                what: "@decreases measure".into(),
                span: site.span,
                result,
            });
        }
    }

    fn run_query(&self, generator: &SmtLibGenerator) -> VerifyResult {
        let script = generator.generate();
        if let Some(dir) = &self.query_dump {
            let smt_dir = dir.join("smt");
            if std::fs::create_dir_all(&smt_dir).is_ok() {
                let mut hasher = DefaultHasher::new();
                script.hash(&mut hasher);
                let path = smt_dir.join(format!("{:016x}.smt2", hasher.finish()));
                std::fs::write(path, &script).ok();
            }
        }
        match self.solver.solve(&script) {
            Ok(SolverResult::Unsat) => VerifyResult::Verified,
            Ok(SolverResult::Sat(model)) => {
                // Keep only declared program variables in the surfaced
                // counterexample.
                let vars: Vec<&String> = generator.declared_vars().collect();
                let filtered = model
                    .into_iter()
                    .filter(|(n, _)| vars.iter().any(|v| *v == n))
                    .collect();
                VerifyResult::CounterExample(filtered)
            }
            Ok(SolverResult::Unknown) => {
                VerifyResult::Unknown("solver timeout or unknown".to_string())
            }
            Err(e) => VerifyResult::Unknown(format!("solver error: {e}")),
        }
    }

    /// Duplicate contract clauses, found by expression hashing.
    fn detect_duplicate_contracts(&self, func: &FnDef, report: &mut FunctionReport) {
        let mut seen: HashMap<u64, String> = HashMap::new();
        let mut clauses: Vec<(String, &Spanned<Expr>)> = Vec::new();
        for (i, pre) in func.pre.iter().enumerate() {
            clauses.push((format!("precondition #{}", i + 1), pre));
        }
        for c in &func.contracts {
            let label = c
                .name
                .as_ref()
                .map(|n| format!("contract `{}`", n.node))
                .unwrap_or_else(|| "unnamed contract".to_string());
            clauses.push((label, &c.condition));
        }
        for (label, clause) in clauses {
            let hash = hash_expr(&clause.node);
            if let Some(prev) = seen.get(&hash) {
                report
                    .warnings
                    .push(format!("{label} duplicates {prev}"));
            } else {
                seen.insert(hash, label);
            }
        }
    }

    /// A contract whose negation is UNSAT is a tautology: always true,
    /// specifying nothing.
    fn detect_trivial_contracts(&self, func: &FnDef, report: &mut FunctionReport) {
        let clauses: Vec<(&'static str, &Spanned<Expr>)> = func
            .pre
            .iter()
            .map(|p| ("precondition", p))
            .chain(func.post.iter().map(|p| ("postcondition", p)))
            .collect();
        for (kind, clause) in clauses {
            let mut generator = SmtLibGenerator::new();
            let mut translator = SmtTranslator::new();
            translator.setup_function(func, &mut generator);
            let Ok(smt) = translator.translate(clause, &mut generator) else {
                continue;
            };
            generator.assert(&format!("(not {smt})"));
            if matches!(self.solver.solve(&generator.generate()), Ok(SolverResult::Unsat)) {
                report
                    .warnings
                    .push(format!("{kind} is always true (tautology)"));
            }
        }
    }

    /// An UNSAT precondition means the function can never be called.
    fn detect_unsatisfiable_precondition(&self, func: &FnDef, report: &mut FunctionReport) {
        if func.pre.is_empty() {
            return;
        }
        let mut generator = SmtLibGenerator::new();
        let mut translator = SmtTranslator::new();
        translator.setup_function(func, &mut generator);
        for pre in &func.pre {
            let Ok(smt) = translator.translate(pre, &mut generator) else {
                return;
            };
            generator.assert(&smt);
        }
        if matches!(self.solver.solve(&generator.generate()), Ok(SolverResult::Unsat)) {
            report.warnings.push(
                "precondition is unsatisfiable; function can never be called".to_string(),
            );
        }
    }
}

/// Register pure and contracted callees as uninterpreted functions so
/// their applications survive translation.
fn register_uninterpreted(
    translator: &mut SmtTranslator,
    function_index: &HashMap<String, &FnDef>,
) {
    for (name, f) in function_index {
        if f.is_pure() || !f.post.is_empty() {
            let params = f
                .params
                .iter()
                .map(|p| crate::smt::type_to_sort(&p.ty.node))
                .collect();
            let ret = crate::smt::type_to_sort(&f.ret_ty.node);
            translator.allow_fn(name, params, ret);
        }
    }
}

/// Assume verified callee postconditions about their applications:
/// for a unary callee g with `post P(ret)`, assert P(g(x)) for the
/// actual argument terms seen in the caller body.
fn assume_callee_posts(
    func: &FnDef,
    function_index: &HashMap<String, &FnDef>,
    translator: &mut SmtTranslator,
    generator: &mut SmtLibGenerator,
) {
    let mut sites = Vec::new();
    collect_call_sites(&func.body, &mut sites);
    for site in sites {
        let Some(callee) = function_index.get(&site.callee) else {
            continue;
        };
        if callee.post.is_empty() || site.args.len() != callee.params.len() {
            continue;
        }
        let mut args_smt = Vec::with_capacity(site.args.len());
        let mut ok = true;
        for arg in &site.args {
            match translator.translate(arg, generator) {
                Ok(t) => args_smt.push(t),
                Err(_) => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }
        let app = if args_smt.is_empty() {
            sanitize_name(&site.callee)
        } else {
            format!("({} {})", sanitize_name(&site.callee), args_smt.join(" "))
        };
        let mut callee_env = SmtTranslator::new();
        callee_env.push_env();
        for (p, arg_term) in callee.params.iter().zip(&args_smt) {
            callee_env.bind(&p.name.node, arg_term.clone());
        }
        // `ret` in the callee post refers to the application term.
        callee_env.bind("ret", app);
        for post in &callee.post {
            if let Ok(fact) = callee_env.translate(post, generator) {
                generator.assert(&fact);
            }
        }
    }
}

/// A call expression found while walking a body.
struct CallSite {
    callee: String,
    args: Vec<Spanned<Expr>>,
    span: Span,
}

fn collect_call_sites(expr: &Spanned<Expr>, out: &mut Vec<CallSite>) {
    match &expr.node {
        Expr::Call { func, args } => {
            out.push(CallSite {
                callee: func.clone(),
                args: args.clone(),
                span: expr.span,
            });
            for a in args {
                collect_call_sites(a, out);
            }
        }
        Expr::Let { value, body, .. } => {
            collect_call_sites(value, out);
            collect_call_sites(body, out);
        }
        Expr::Binary { left, right, .. } => {
            collect_call_sites(left, out);
            collect_call_sites(right, out);
        }
        Expr::Unary { expr: inner, .. }
        | Expr::Ref(inner)
        | Expr::RefMut(inner)
        | Expr::Deref(inner)
        | Expr::Old(inner)
        | Expr::Loop { body: inner }
        | Expr::Spawn { body: inner } => collect_call_sites(inner, out),
        Expr::If {
            cond,
            then_branch,
            else_branch,
        } => {
            collect_call_sites(cond, out);
            collect_call_sites(then_branch, out);
            collect_call_sites(else_branch, out);
        }
        Expr::While { cond, body, .. } => {
            collect_call_sites(cond, out);
            collect_call_sites(body, out);
        }
        Expr::For { iter, body, .. } => {
            collect_call_sites(iter, out);
            collect_call_sites(body, out);
        }
        Expr::Range { start, end, .. } => {
            collect_call_sites(start, out);
            collect_call_sites(end, out);
        }
        Expr::MethodCall { receiver, args, .. } => {
            collect_call_sites(receiver, out);
            for a in args {
                collect_call_sites(a, out);
            }
        }
        Expr::StructInit { fields, .. } => {
            for (_, v) in fields {
                collect_call_sites(v, out);
            }
        }
        Expr::FieldAccess { expr: inner, .. } | Expr::TupleField { expr: inner, .. } => {
            collect_call_sites(inner, out)
        }
        Expr::FieldAssign { object, value, .. } => {
            collect_call_sites(object, out);
            collect_call_sites(value, out);
        }
        Expr::EnumVariant { args, .. } => {
            for a in args {
                collect_call_sites(a, out);
            }
        }
        Expr::Match { expr: scrut, arms } => {
            collect_call_sites(scrut, out);
            for arm in arms {
                if let Some(g) = &arm.guard {
                    collect_call_sites(g, out);
                }
                collect_call_sites(&arm.body, out);
            }
        }
        Expr::ArrayLit(elems) | Expr::Tuple(elems) => {
            for e in elems {
                collect_call_sites(e, out);
            }
        }
        Expr::Index { expr: base, index } => {
            collect_call_sites(base, out);
            collect_call_sites(index, out);
        }
        Expr::IndexAssign {
            array,
            index,
            value,
        } => {
            collect_call_sites(array, out);
            collect_call_sites(index, out);
            collect_call_sites(value, out);
        }
        Expr::Assign { value, .. } => collect_call_sites(value, out),
        Expr::Break { value } | Expr::Return { value } => {
            if let Some(v) = value {
                collect_call_sites(v, out);
            }
        }
        Expr::Closure { body, .. } => collect_call_sites(body, out),
        Expr::Cast { expr: inner, .. } => collect_call_sites(inner, out),
        _ => {}
    }
}

fn hash_expr(expr: &Expr) -> u64 {
    let mut hasher = DefaultHasher::new();
    format!("{expr:?}").hash(&mut hasher);
    hasher.finish()
}

/// Structural hash over a function's signature, contracts, body and the
/// bodies of everything it calls; any change invalidates cached proofs.
pub fn dependency_closure_hash(func: &FnDef, index: &HashMap<String, &FnDef>) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_one(func, &mut hasher);
    let mut sites = Vec::new();
    collect_call_sites(&func.body, &mut sites);
    let mut visited: Vec<String> = vec![func.name.node.clone()];
    let mut queue: Vec<String> = sites.into_iter().map(|s| s.callee).collect();
    queue.sort();
    queue.dedup();
    while let Some(name) = queue.pop() {
        if visited.contains(&name) {
            continue;
        }
        visited.push(name.clone());
        if let Some(callee) = index.get(&name) {
            hash_one(callee, &mut hasher);
            let mut inner = Vec::new();
            collect_call_sites(&callee.body, &mut inner);
            let mut names: Vec<String> = inner.into_iter().map(|s| s.callee).collect();
            names.sort();
            names.dedup();
            queue.extend(names);
        }
    }
    hasher.finish()
}

fn hash_one(func: &FnDef, hasher: &mut DefaultHasher) {
    func.name.node.hash(hasher);
    for p in &func.params {
        p.name.node.hash(hasher);
        format!("{:?}", p.ty.node).hash(hasher);
    }
    format!("{:?}", func.ret_ty.node).hash(hasher);
    for pre in &func.pre {
        format!("{:?}", pre.node).hash(hasher);
    }
    for post in &func.post {
        format!("{:?}", post.node).hash(hasher);
    }
    for c in &func.contracts {
        format!("{:?}", c.condition.node).hash(hasher);
    }
    for a in &func.attributes {
        format!("{a:?}").hash(hasher);
    }
    format!("{:?}", func.body.node).hash(hasher);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;
    use crate::verify::ProofDatabase;

    fn program(source: &str) -> Program {
        let tokens = tokenize(source).unwrap();
        parse("test.bmb", source, tokens).unwrap()
    }

    fn verify(source: &str) -> VerificationReport {
        let prog = program(source);
        let mut db = ProofDatabase::in_memory();
        ContractVerifier::new().verify_program(&prog, &mut db)
    }

    fn solver_up() -> bool {
        ContractVerifier::new().is_solver_available()
    }

    #[test]
    fn test_trusted_function_skips_own_proofs() {
        let report = verify("@trust fn magic(x: i64) -> i64 post ret > x = x;");
        assert!(report.functions[0].trusted);
        assert!(report.functions[0].obligations.is_empty());
    }

    #[test]
    fn test_trust_preserves_caller_obligations() {
        // The trusted callee's precondition still binds its callers.
        if !solver_up() {
            return;
        }
        let report = verify(
            "@trust fn divide(a: i64, b: i64) -> i64 pre b != 0 = a / b; \
             fn main() -> i64 = divide(10, 0);",
        );
        let main_report = report
            .functions
            .iter()
            .find(|f| f.name == "main")
            .expect("main report");
        assert!(
            main_report.counterexamples().count() > 0,
            "divide(10, 0) must fail its call-site obligation"
        );
    }

    #[test]
    fn test_abs_postcondition_verifies() {
        if !solver_up() {
            return;
        }
        let report =
            verify("fn abs(x: i64) -> i64 post ret >= 0 = if x >= 0 { x } else { 0 - x };");
        assert!(report.functions[0].is_verified(), "{}", report);
    }

    #[test]
    fn test_wrong_postcondition_counterexample() {
        if !solver_up() {
            return;
        }
        let report = verify("fn bad(x: i64) -> i64 post ret > x = x;");
        let cex: Vec<_> = report.functions[0].counterexamples().collect();
        assert!(!cex.is_empty());
    }

    #[test]
    fn test_call_site_precondition_violation_binds_model() {
        if !solver_up() {
            return;
        }
        let report = verify(
            "fn divide(a: i64, b: i64) -> i64 pre b != 0 = a / b; \
             fn main() -> i64 = divide(10, 0);",
        );
        let main_report = report
            .functions
            .iter()
            .find(|f| f.name == "main")
            .expect("main report");
        assert!(main_report.counterexamples().count() > 0);
    }

    #[test]
    fn test_call_site_refinement_obligation() {
        if !solver_up() {
            return;
        }
        let ok = verify(
            "fn divide(a: i64, b: i64{it != 0}) -> i64 = a / b; \
             fn main() -> i64 = divide(10, 2);",
        );
        assert!(ok.all_verified(), "{}", ok);

        let bad = verify(
            "fn divide(a: i64, b: i64{it != 0}) -> i64 = a / b; \
             fn main() -> i64 = divide(10, 0);",
        );
        assert!(!bad.all_verified());
    }

    #[test]
    fn test_decreases_verifies_for_countdown() {
        if !solver_up() {
            return;
        }
        let report = verify(
            "@decreases(n) fn count(n: i64) -> i64 pre n >= 0 = \
             if n < 1 then 0 else count(n - 1);",
        );
        assert!(report.functions[0].is_verified(), "{}", report);
    }

    #[test]
    fn test_decreases_fails_for_countup() {
        if !solver_up() {
            return;
        }
        let report = verify(
            "@decreases(n) fn up(n: i64) -> i64 pre n >= 0 = \
             if n > 100 then 0 else up(n + 1);",
        );
        assert!(!report.functions[0].is_verified());
    }

    #[test]
    fn test_duplicate_contract_warning() {
        let report = verify("fn f(x: i64) -> i64 pre x > 0 pre x > 0 = x;");
        assert!(report.functions[0]
            .warnings
            .iter()
            .any(|w| w.contains("duplicates")));
    }

    #[test]
    fn test_trivial_contract_warning() {
        if !solver_up() {
            return;
        }
        let report = verify("fn f(x: i64) -> i64 pre x == x = x;");
        assert!(report.functions[0]
            .warnings
            .iter()
            .any(|w| w.contains("tautology")));
    }

    #[test]
    fn test_unsat_precondition_warning() {
        if !solver_up() {
            return;
        }
        let report = verify("fn dead(x: i64) -> i64 pre x > 0 and x < 0 = x;");
        assert!(report.functions[0]
            .warnings
            .iter()
            .any(|w| w.contains("unsatisfiable")));
    }

    #[test]
    fn test_no_contract_function_trivially_verified() {
        let report = verify("fn id(x: i64) -> i64 = x;");
        assert!(report.functions[0].is_verified());
        assert!(report.functions[0].obligations.is_empty());
    }

    #[test]
    fn test_cache_hit_on_second_run() {
        if !solver_up() {
            return;
        }
        let prog = program("fn abs(x: i64) -> i64 post ret >= 0 = if x >= 0 { x } else { 0 - x };");
        let verifier = ContractVerifier::new();
        let mut db = ProofDatabase::in_memory();
        let first = verifier.verify_program(&prog, &mut db);
        assert!(first.all_verified());
        assert!(!first.functions[0].cached);
        let second = verifier.verify_program(&prog, &mut db);
        assert!(second.functions[0].cached);
    }

    #[test]
    fn test_dependency_hash_changes_with_callee() {
        let p1 = program("fn g(x: i64) -> i64 = x; fn f(x: i64) -> i64 = g(x);");
        let p2 = program("fn g(x: i64) -> i64 = x + 1; fn f(x: i64) -> i64 = g(x);");
        let index1: HashMap<String, &FnDef> = p1
            .functions()
            .map(|f| (f.name.node.clone(), f))
            .collect();
        let index2: HashMap<String, &FnDef> = p2
            .functions()
            .map(|f| (f.name.node.clone(), f))
            .collect();
        let f1 = p1.functions().find(|f| f.name.node == "f").unwrap();
        let f2 = p2.functions().find(|f| f.name.node == "f").unwrap();
        // Changing g's body invalidates f's proof.
        assert_ne!(
            dependency_closure_hash(f1, &index1),
            dependency_closure_hash(f2, &index2)
        );
    }
}
