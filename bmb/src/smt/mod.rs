//! SMT backend
//!
//! Translates contract obligations to SMT-LIB2 and drives an external
//! solver process. Each obligation asserts the negation of its goal;
//! UNSAT means proved, SAT carries a counterexample model.

mod generate;
mod solver;
mod translate;

pub use generate::{sanitize_name, SmtLibGenerator, SmtSort};
pub use solver::{SmtSolver, SolverResult};
pub use translate::{type_to_sort, SmtError, SmtTranslator};

/// Outcome of one verification goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// The negated goal is unsatisfiable: the property holds.
    Verified,
    /// The solver found a model violating the goal.
    CounterExample(Vec<(String, String)>),
    /// Timeout, unsupported construct, or solver failure.
    Unknown(String),
}

impl VerifyResult {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyResult::Verified)
    }
}
