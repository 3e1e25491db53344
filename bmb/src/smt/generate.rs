//! SMT-LIB2 script assembly

use std::collections::HashMap;
use std::fmt::Write;

/// SMT-LIB2 sorts (types)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtSort {
    Int,
    Real,
    Bool,
}

impl SmtSort {
    pub fn to_smt(&self) -> &'static str {
        match self {
            SmtSort::Int => "Int",
            SmtSort::Real => "Real",
            SmtSort::Bool => "Bool",
        }
    }
}

/// Builds one SMT-LIB2 query: declarations, optional function symbols,
/// assertions, check-sat, get-model.
#[derive(Debug, Clone, Default)]
pub struct SmtLibGenerator {
    declarations: Vec<String>,
    functions: Vec<String>,
    fun_names: std::collections::HashSet<String>,
    assertions: Vec<String>,
    var_sorts: HashMap<String, SmtSort>,
    uses_uf: bool,
}

impl SmtLibGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a constant once; redeclaration is a no-op.
    pub fn declare_var(&mut self, name: &str, sort: SmtSort) {
        let sanitized = sanitize_name(name);
        if self.var_sorts.contains_key(&sanitized) {
            return;
        }
        self.declarations
            .push(format!("(declare-const {} {})", sanitized, sort.to_smt()));
        self.var_sorts.insert(sanitized, sort);
    }

    /// Declare an uninterpreted function symbol once.
    pub fn declare_fun(&mut self, name: &str, params: &[SmtSort], ret: SmtSort) {
        let sanitized = sanitize_name(name);
        if !self.fun_names.insert(sanitized.clone()) {
            return;
        }
        let params_str: Vec<&str> = params.iter().map(|s| s.to_smt()).collect();
        self.functions.push(format!(
            "(declare-fun {sanitized} ({}) {})",
            params_str.join(" "),
            ret.to_smt()
        ));
        self.uses_uf = true;
    }

    pub fn assert(&mut self, expr: &str) {
        self.assertions.push(format!("(assert {expr})"));
    }

    pub fn declared_vars(&self) -> impl Iterator<Item = &String> {
        self.var_sorts.keys()
    }

    /// Generate the SMT-LIB2 script.
    pub fn generate(&self) -> String {
        let mut out = String::new();
        let logic = if self.uses_uf { "UFNIA" } else { "ALL" };
        writeln!(out, "(set-logic {logic})").ok();
        writeln!(out).ok();
        for f in &self.functions {
            writeln!(out, "{f}").ok();
        }
        for d in &self.declarations {
            writeln!(out, "{d}").ok();
        }
        if !self.declarations.is_empty() || !self.functions.is_empty() {
            writeln!(out).ok();
        }
        for a in &self.assertions {
            writeln!(out, "{a}").ok();
        }
        writeln!(out, "(check-sat)").ok();
        writeln!(out, "(get-model)").ok();
        out
    }
}

/// SMT-LIB2 symbols exclude most punctuation; keep names readable and
/// collision-free.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
