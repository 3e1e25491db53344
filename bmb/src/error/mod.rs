//! Error types and reporting

use crate::ast::Span;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, CompileError>;

/// Compile error
///
/// One variant per phase of the pipeline. Every spanned variant resolves
/// to file + line + column + snippet when reported.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("Lexer error at {span}: {message}")]
    Lexer { message: String, span: Span },

    #[error("Parser error at {span}: {message}")]
    Parser {
        message: String,
        /// Tokens the parser would have accepted at this point
        expected: Vec<String>,
        span: Span,
    },

    #[error("Type error at {span}: {message}")]
    Type { message: String, span: Span },

    #[error("Verification error at {span}: {message}")]
    Verify {
        message: String,
        /// Counterexample bindings from the solver model, when SAT
        counterexample: Vec<(String, String)>,
        span: Span,
    },

    #[error("Codegen error: {message}")]
    Codegen { message: String },

    #[error("IO error: {message}")]
    Io { message: String },
}

impl CompileError {
    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self::Lexer {
            message: message.into(),
            span,
        }
    }

    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self::Parser {
            message: message.into(),
            expected: Vec::new(),
            span,
        }
    }

    pub fn parser_expected(
        message: impl Into<String>,
        expected: Vec<String>,
        span: Span,
    ) -> Self {
        Self::Parser {
            message: message.into(),
            expected,
            span,
        }
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        Self::Type {
            message: message.into(),
            span,
        }
    }

    pub fn verify(message: impl Into<String>, span: Span) -> Self {
        Self::Verify {
            message: message.into(),
            counterexample: Vec::new(),
            span,
        }
    }

    pub fn verify_with_model(
        message: impl Into<String>,
        counterexample: Vec<(String, String)>,
        span: Span,
    ) -> Self {
        Self::Verify {
            message: message.into(),
            counterexample,
            span,
        }
    }

    /// Internal invariant violation in MIR -> LLVM. Indicates a compiler
    /// bug, not a user error.
    pub fn codegen(message: impl Into<String>) -> Self {
        Self::Codegen {
            message: message.into(),
        }
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Lexer { span, .. }
            | Self::Parser { span, .. }
            | Self::Type { span, .. }
            | Self::Verify { span, .. } => Some(*span),
            Self::Codegen { .. } | Self::Io { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Lexer { message, .. }
            | Self::Parser { message, .. }
            | Self::Type { message, .. }
            | Self::Verify { message, .. }
            | Self::Codegen { message }
            | Self::Io { message } => message,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Lexer { .. } => "lexer",
            Self::Parser { .. } => "parser",
            Self::Type { .. } => "type",
            Self::Verify { .. } => "verify",
            Self::Codegen { .. } => "codegen",
            Self::Io { .. } => "io",
        }
    }

    /// Internal errors exit with code 2, diagnostics with code 1.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Codegen { .. })
    }
}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
        }
    }
}

/// Compile warning - non-fatal diagnostic messages
#[derive(Debug, Clone)]
pub enum CompileWarning {
    /// Unreachable pattern arm in match expression
    UnreachablePattern { message: String, span: Span },

    /// Unused variable binding
    UnusedBinding { name: String, span: Span },

    /// Mutable variable that is never mutated; should be `let`
    UnusedMut { name: String, span: Span },

    /// Variable shadows another binding in an outer scope
    ShadowBinding {
        name: String,
        span: Span,
        original_span: Span,
    },

    /// Duplicate contract: two clauses with the same condition
    DuplicateContract { message: String, span: Span },

    /// Contract that is always true, providing no specification
    TrivialContract { contract_kind: String, span: Span },

    /// Precondition that can never be satisfied; the function is dead
    UnsatisfiablePrecondition { span: Span },

    /// Solver returned unknown or timed out (non-strict mode)
    VerifyUnknown { reason: String, span: Span },

    /// Generic warning with optional span
    Generic { message: String, span: Option<Span> },
}

impl CompileWarning {
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::UnreachablePattern { span, .. }
            | Self::UnusedBinding { span, .. }
            | Self::UnusedMut { span, .. }
            | Self::ShadowBinding { span, .. }
            | Self::DuplicateContract { span, .. }
            | Self::TrivialContract { span, .. }
            | Self::UnsatisfiablePrecondition { span }
            | Self::VerifyUnknown { span, .. } => Some(*span),
            Self::Generic { span, .. } => *span,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnreachablePattern { .. } => "unreachable_pattern",
            Self::UnusedBinding { .. } => "unused_binding",
            Self::UnusedMut { .. } => "unused_mut",
            Self::ShadowBinding { .. } => "shadow_binding",
            Self::DuplicateContract { .. } => "duplicate_contract",
            Self::TrivialContract { .. } => "trivial_contract",
            Self::UnsatisfiablePrecondition { .. } => "unsatisfiable_precondition",
            Self::VerifyUnknown { .. } => "verify_unknown",
            Self::Generic { .. } => "warning",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::UnreachablePattern { message, .. } => message.clone(),
            Self::UnusedBinding { name, .. } => {
                format!("unused variable `{name}`")
            }
            Self::UnusedMut { name, .. } => {
                format!("variable `{name}` is declared `var` but never mutated")
            }
            Self::ShadowBinding { name, .. } => {
                format!("binding `{name}` shadows an outer binding")
            }
            Self::DuplicateContract { message, .. } => message.clone(),
            Self::TrivialContract { contract_kind, .. } => {
                format!("{contract_kind} is always true (tautology)")
            }
            Self::UnsatisfiablePrecondition { .. } => {
                "precondition is unsatisfiable; function can never be called".to_string()
            }
            Self::VerifyUnknown { reason, .. } => {
                format!("verification inconclusive: {reason}")
            }
            Self::Generic { message, .. } => message.clone(),
        }
    }
}

impl std::fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "warning[{}]: {}", self.kind(), self.message())
    }
}

/// Per-compilation diagnostic sink.
///
/// Phases push errors and warnings here as they run; a phase that has
/// produced any error for an item skips downstream phases for that item
/// but siblings continue. The driver drains the sink at the end and maps
/// the highest severity to the process exit code.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<CompileError>,
    warnings: Vec<CompileWarning>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, err: CompileError) {
        self.errors.push(err);
    }

    pub fn warning(&mut self, warn: CompileWarning) {
        self.warnings.push(warn);
    }

    pub fn extend_errors(&mut self, errs: impl IntoIterator<Item = CompileError>) {
        self.errors.extend(errs);
    }

    pub fn extend_warnings(&mut self, warns: impl IntoIterator<Item = CompileWarning>) {
        self.warnings.extend(warns);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn warnings(&self) -> &[CompileWarning] {
        &self.warnings
    }

    /// Exit code for the driver: 0 clean, 1 diagnostics, 2 internal error.
    pub fn exit_code(&self) -> i32 {
        if self.errors.iter().any(CompileError::is_internal) {
            2
        } else if self.has_errors() {
            1
        } else {
            0
        }
    }

    /// Print everything to stderr/stdout with ariadne.
    pub fn report_all(&self, filename: &str, source: &str) {
        for warning in &self.warnings {
            report_warning(filename, source, warning);
        }
        for error in &self.errors {
            report_error(filename, source, error);
        }
    }
}

/// Report error with ariadne
pub fn report_error(filename: &str, source: &str, error: &CompileError) {
    use ariadne::{Color, Label, Report, ReportKind, Source};

    let kind = match error {
        CompileError::Lexer { .. } => "Lexer",
        CompileError::Parser { .. } => "Parser",
        CompileError::Type { .. } => "Type",
        CompileError::Verify { .. } => "Verification",
        CompileError::Codegen { .. } => "Codegen",
        CompileError::Io { .. } => "IO",
    };

    if let Some(span) = error.span() {
        let mut report = Report::build(ReportKind::Error, (filename, span.start..span.end))
            .with_message(format!("{kind} error"))
            .with_label(
                Label::new((filename, span.start..span.end))
                    .with_message(error.message())
                    .with_color(Color::Red),
            );

        if let CompileError::Verify { counterexample, .. } = error
            && !counterexample.is_empty()
        {
            let bindings: Vec<String> = counterexample
                .iter()
                .map(|(var, value)| format!("{var} = {value}"))
                .collect();
            report = report.with_note(format!("counterexample: {}", bindings.join(", ")));
        }
        if let CompileError::Parser { expected, .. } = error
            && !expected.is_empty()
        {
            report = report.with_note(format!("expected one of: {}", expected.join(", ")));
        }

        report
            .finish()
            .eprint((filename, Source::from(source)))
            .ok();
    } else {
        Report::build(ReportKind::Error, (filename, 0..0))
            .with_message(format!("{kind} error: {}", error.message()))
            .finish()
            .eprint((filename, Source::from(source)))
            .ok();
    }
}

/// Report warning with ariadne
pub fn report_warning(filename: &str, source: &str, warning: &CompileWarning) {
    use ariadne::{Color, Label, Report, ReportKind, Source};

    if let Some(span) = warning.span() {
        Report::build(ReportKind::Warning, (filename, span.start..span.end))
            .with_message(format!("warning[{}]", warning.kind()))
            .with_label(
                Label::new((filename, span.start..span.end))
                    .with_message(warning.message())
                    .with_color(Color::Yellow),
            )
            .finish()
            .eprint((filename, Source::from(source)))
            .ok();
    } else {
        Report::build(ReportKind::Warning, (filename, 0..0))
            .with_message(warning.message())
            .finish()
            .eprint((filename, Source::from(source)))
            .ok();
    }
}

/// Machine-readable error output (one JSON object per line)
pub fn report_error_machine(filename: &str, error: &CompileError) {
    let (start, end) = error.span().map(|s| (s.start, s.end)).unwrap_or((0, 0));
    let obj = serde_json::json!({
        "type": "error",
        "kind": error.kind(),
        "file": filename,
        "start": start,
        "end": end,
        "message": error.message(),
    });
    println!("{obj}");
}

/// Machine-readable warning output
pub fn report_warning_machine(filename: &str, warning: &CompileWarning) {
    let (start, end) = warning.span().map(|s| (s.start, s.end)).unwrap_or((0, 0));
    let obj = serde_json::json!({
        "type": "warning",
        "kind": warning.kind(),
        "file": filename,
        "start": start,
        "end": end,
        "message": warning.message(),
    });
    println!("{obj}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors_carry_span() {
        let e = CompileError::lexer("bad char", Span::new(3, 4));
        assert_eq!(e.span(), Some(Span::new(3, 4)));
        assert_eq!(e.message(), "bad char");
        assert_eq!(e.kind(), "lexer");
    }

    #[test]
    fn test_codegen_error_is_internal() {
        let e = CompileError::codegen("type not in local map: %t3");
        assert!(e.is_internal());
        assert_eq!(e.span(), None);
    }

    #[test]
    fn test_verify_error_counterexample() {
        let e = CompileError::verify_with_model(
            "precondition may not hold",
            vec![("b".into(), "0".into())],
            Span::new(10, 20),
        );
        match e {
            CompileError::Verify { counterexample, .. } => {
                assert_eq!(counterexample, vec![("b".to_string(), "0".to_string())]);
            }
            _ => panic!("expected Verify"),
        }
    }

    #[test]
    fn test_diagnostics_exit_codes() {
        let mut diags = Diagnostics::new();
        assert_eq!(diags.exit_code(), 0);

        diags.warning(CompileWarning::Generic {
            message: "w".into(),
            span: None,
        });
        assert_eq!(diags.exit_code(), 0);

        diags.error(CompileError::type_error("mismatch", Span::dummy()));
        assert_eq!(diags.exit_code(), 1);

        diags.error(CompileError::codegen("bug"));
        assert_eq!(diags.exit_code(), 2);
    }

    #[test]
    fn test_warning_messages() {
        let w = CompileWarning::UnusedBinding {
            name: "x".into(),
            span: Span::dummy(),
        };
        assert_eq!(w.message(), "unused variable `x`");
        assert_eq!(w.kind(), "unused_binding");
        assert_eq!(format!("{w}"), "warning[unused_binding]: unused variable `x`");
    }

    #[test]
    fn test_io_error_from_std() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: CompileError = io.into();
        assert_eq!(e.kind(), "io");
    }
}
