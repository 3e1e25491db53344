//! External SMT solver process driver
//!
//! One solver process per query: the script goes to stdin, the first
//! output line is sat/unsat/unknown, and a sat answer is followed by a
//! model we mine for counterexample values.

use std::io::Write as IoWrite;
use std::process::{Command, Stdio};

/// Raw solver verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverResult {
    Unsat,
    /// Satisfiable, with (name, value) pairs parsed from the model
    Sat(Vec<(String, String)>),
    Unknown,
}

/// Handle to the external solver binary (z3 by default).
#[derive(Debug, Clone)]
pub struct SmtSolver {
    path: String,
    timeout_ms: u64,
}

impl Default for SmtSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SmtSolver {
    pub fn new() -> Self {
        Self {
            path: "z3".to_string(),
            timeout_ms: 30_000,
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Whether the solver binary answers at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run one query.
    pub fn solve(&self, script: &str) -> Result<SolverResult, String> {
        let timeout_secs = self.timeout_ms.div_ceil(1000).max(1);
        let mut child = Command::new(&self.path)
            .arg("-in")
            .arg("-smt2")
            .arg(format!("-T:{timeout_secs}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to spawn solver `{}`: {e}", self.path))?;

        child
            .stdin
            .as_mut()
            .ok_or("solver stdin unavailable")?
            .write_all(script.as_bytes())
            .map_err(|e| format!("failed to write query: {e}"))?;

        let output = child
            .wait_with_output()
            .map_err(|e| format!("solver did not finish: {e}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut lines = stdout.lines();
        match lines.next().map(str::trim) {
            Some("unsat") => Ok(SolverResult::Unsat),
            Some("sat") => {
                let rest: String = lines.collect::<Vec<_>>().join("\n");
                Ok(SolverResult::Sat(parse_model(&rest)))
            }
            Some("unknown") | Some("timeout") => Ok(SolverResult::Unknown),
            other => Err(format!(
                "unexpected solver output: {:?}",
                other.unwrap_or("<empty>")
            )),
        }
    }
}

/// Pull (name, value) pairs out of a `(model ...)` dump.
///
/// Handles the common z3 shape:
/// `(define-fun b () Int 0)` and negatives as `(- 5)`.
fn parse_model(model: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let compact = model.replace('\n', " ");
    let mut rest = compact.as_str();
    while let Some(pos) = rest.find("(define-fun ") {
        rest = &rest[pos + "(define-fun ".len()..];
        let Some(name_end) = rest.find(char::is_whitespace) else {
            break;
        };
        let name = rest[..name_end].to_string();
        // Skip past "() Sort" to the value.
        let Some(close) = rest.find("()") else { break };
        let after = rest[close + 2..].trim_start();
        let Some(sort_end) = after.find(char::is_whitespace) else {
            break;
        };
        let value_str = after[sort_end..].trim_start();
        let value = read_value(value_str);
        if !value.is_empty() {
            out.push((name, value));
        }
    }
    out.sort();
    out
}

/// Read one value token, normalizing `(- 5)` to `-5`.
fn read_value(s: &str) -> String {
    let s = s.trim_start();
    if let Some(inner) = s.strip_prefix("(-") {
        let end = inner.find(')').unwrap_or(inner.len());
        return format!("-{}", inner[..end].trim());
    }
    let end = s
        .find(|c: char| c.is_whitespace() || c == ')')
        .unwrap_or(s.len());
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_simple() {
        let model = "(model (define-fun b () Int 0) (define-fun a () Int 10))";
        let parsed = parse_model(model);
        assert_eq!(
            parsed,
            vec![
                ("a".to_string(), "10".to_string()),
                ("b".to_string(), "0".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_model_negative() {
        let model = "(model (define-fun x () Int (- 5)))";
        assert_eq!(parse_model(model), vec![("x".to_string(), "-5".to_string())]);
    }

    #[test]
    fn test_parse_model_multiline() {
        let model = "(\n  (define-fun b () Int\n    0)\n)";
        assert_eq!(parse_model(model), vec![("b".to_string(), "0".to_string())]);
    }

    #[test]
    fn test_parse_model_bool() {
        let model = "((define-fun c () Bool true))";
        assert_eq!(parse_model(model), vec![("c".to_string(), "true".to_string())]);
    }

    #[test]
    fn test_read_value() {
        assert_eq!(read_value("42)"), "42");
        assert_eq!(read_value("(- 7))"), "-7");
        assert_eq!(read_value("true)"), "true");
    }

    // Exercising the real binary is gated on availability, the same way
    // the rest of the verification tests are.
    #[test]
    fn test_solve_trivial_unsat_if_available() {
        let solver = SmtSolver::new();
        if !solver.is_available() {
            return;
        }
        let result = solver
            .solve("(set-logic ALL)\n(declare-const x Int)\n(assert (and (> x 0) (< x 0)))\n(check-sat)\n(get-model)\n")
            .expect("solver ran");
        assert_eq!(result, SolverResult::Unsat);
    }

    #[test]
    fn test_solve_sat_model_if_available() {
        let solver = SmtSolver::new();
        if !solver.is_available() {
            return;
        }
        let result = solver
            .solve("(set-logic ALL)\n(declare-const b Int)\n(assert (= b 0))\n(check-sat)\n(get-model)\n")
            .expect("solver ran");
        match result {
            SolverResult::Sat(model) => {
                assert!(model.iter().any(|(n, v)| n == "b" && v == "0"));
            }
            other => panic!("expected sat, got {other:?}"),
        }
    }
}
