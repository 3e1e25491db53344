//! REPL (Read-Eval-Print Loop) for BMB
//!
//! Definitions accumulate across inputs; expressions are wrapped into a
//! synthetic `main`, compiled through the normal pipeline and executed
//! natively (build-then-execute, no tree-walking evaluator).

use rustyline::error::ReadlineError;
use rustyline::{DefaultEditor, Result as RlResult};
use std::path::PathBuf;

use crate::ast::Type;
use crate::build::{self, BuildConfig};
use crate::error::Diagnostics;
use crate::lexer::tokenize;
use crate::parser::parse;
use crate::types::TypeChecker;

const PROMPT: &str = "> ";
const HISTORY_FILE: &str = ".bmb_history";

/// REPL state
pub struct Repl {
    editor: DefaultEditor,
    /// Item definitions entered so far, in order
    definitions: Vec<String>,
    history_path: Option<PathBuf>,
    work_dir: PathBuf,
}

impl Repl {
    pub fn new() -> RlResult<Self> {
        let editor = DefaultEditor::new()?;
        let history_path = std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|h| h.join(HISTORY_FILE));
        let work_dir = std::env::temp_dir().join("bmb-repl");

        let mut repl = Repl {
            editor,
            definitions: Vec::new(),
            history_path,
            work_dir,
        };
        if let Some(ref path) = repl.history_path {
            let _ = repl.editor.load_history(path);
        }
        Ok(repl)
    }

    /// Run the REPL until :quit or EOF.
    pub fn run(&mut self) -> RlResult<()> {
        println!("BMB REPL");
        println!("Type :help for help, :quit to exit.\n");

        loop {
            match self.editor.readline(PROMPT) {
                Ok(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = self.editor.add_history_entry(&line);

                    if line.starts_with(':') {
                        if self.handle_command(&line) {
                            break;
                        }
                        continue;
                    }

                    self.eval_input(&line);
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!("Goodbye!");
                    break;
                }
                Err(err) => {
                    eprintln!("Error: {err}");
                    break;
                }
            }
        }

        if let Some(ref path) = self.history_path {
            let _ = self.editor.save_history(path);
        }
        Ok(())
    }

    /// Handle a `:command`; returns true to exit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        let (head, rest) = cmd.split_once(' ').unwrap_or((cmd, ""));
        match head {
            ":quit" | ":q" | ":exit" => {
                println!("Goodbye!");
                true
            }
            ":help" | ":h" | ":?" => {
                self.print_help();
                false
            }
            ":clear" => {
                print!("\x1B[2J\x1B[1;1H");
                false
            }
            ":reset" => {
                self.definitions.clear();
                println!("Definitions cleared.");
                false
            }
            ":defs" => {
                if self.definitions.is_empty() {
                    println!("No definitions yet.");
                }
                for d in &self.definitions {
                    println!("{d}");
                }
                false
            }
            ":type" | ":t" => {
                self.show_type(rest.trim());
                false
            }
            _ => {
                println!("Unknown command: {head}");
                println!("Type :help for help.");
                false
            }
        }
    }

    fn print_help(&self) {
        println!("BMB REPL Commands:");
        println!("  :help, :h, :?    Show this help");
        println!("  :type EXPR, :t   Show the type of an expression");
        println!("  :defs            List accumulated definitions");
        println!("  :reset           Drop all definitions");
        println!("  :clear           Clear the screen");
        println!("  :quit, :q        Exit");
        println!();
        println!("Items (fn/struct/enum/trait/impl) accumulate; a bare");
        println!("expression compiles and runs natively.");
    }

    /// Whether the input is a top-level item rather than an expression.
    fn is_item(line: &str) -> bool {
        let stripped = line.trim_start_matches('@');
        let first = stripped.split_whitespace().next().unwrap_or("");
        matches!(
            first,
            "fn" | "struct" | "enum" | "trait" | "impl" | "use" | "pub"
        ) || line.starts_with('@')
    }

    fn eval_input(&mut self, line: &str) {
        if Self::is_item(line) {
            self.add_definition(line);
        } else {
            self.eval_expression(line);
        }
    }

    /// Type-check the accumulated program with the new item appended;
    /// keep it only when clean.
    fn add_definition(&mut self, line: &str) {
        let mut candidate = self.definitions.clone();
        candidate.push(line.to_string());
        let source = candidate.join("\n");
        match self.check_source(&source) {
            Ok(()) => {
                self.definitions.push(line.to_string());
            }
            Err(message) => eprintln!("{message}"),
        }
    }

    fn check_source(&self, source: &str) -> Result<(), String> {
        let tokens = tokenize(source).map_err(|e| e.to_string())?;
        let program = parse("<repl>", source, tokens).map_err(|e| e.to_string())?;
        TypeChecker::new()
            .check_program(&program)
            .map(|_| ())
            .map_err(|(errors, _)| {
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
    }

    /// Infer and print the type of an expression in the current scope.
    fn show_type(&self, expr: &str) {
        if expr.is_empty() {
            println!("usage: :type EXPR");
            return;
        }
        match self.infer_type(expr) {
            Ok(ty) => println!("{expr} : {ty}"),
            Err(message) => eprintln!("{message}"),
        }
    }

    fn infer_type(&self, expr: &str) -> Result<Type, String> {
        let source = format!(
            "{}\nfn __repl_probe() -> () = {{ let __repl_v = {expr}; () }};",
            self.definitions.join("\n")
        );
        let tokens = tokenize(&source).map_err(|e| e.to_string())?;
        let program = parse("<repl>", &source, tokens).map_err(|e| e.to_string())?;
        let checked = TypeChecker::new()
            .check_program(&program)
            .map_err(|(errors, _)| {
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        // The probe binding's value expression carries the type.
        let needle = format!("let __repl_v = {expr}");
        let offset = source.find(&needle).map(|p| p + "let __repl_v = ".len());
        offset
            .and_then(|start| {
                checked
                    .expr_types
                    .iter()
                    .find(|(span, _)| span.start == start)
                    .map(|(_, ty)| ty.clone())
            })
            .ok_or_else(|| "could not infer type".to_string())
    }

    /// Wrap the expression into a synthetic main, build natively, run.
    fn eval_expression(&mut self, expr: &str) {
        let ty = match self.infer_type(expr) {
            Ok(ty) => ty,
            Err(message) => {
                eprintln!("{message}");
                return;
            }
        };
        let print_call = match ty.base() {
            Type::I64 | Type::I32 | Type::I16 | Type::I8 | Type::Bool => {
                format!("println({expr} as i64)")
            }
            Type::F64 | Type::F32 => format!("println_f64({expr})"),
            Type::String => format!("println_str({expr})"),
            Type::Unit => format!("{expr}"),
            other => {
                eprintln!("cannot print a value of type {other}");
                return;
            }
        };
        let source = format!(
            "{}\nfn main() -> i64 = {{ {print_call}; 0 }};",
            self.definitions.join("\n")
        );

        std::fs::create_dir_all(&self.work_dir).ok();
        let input = self.work_dir.join("repl_input.bmb");
        if std::fs::write(&input, &source).is_err() {
            eprintln!("failed to write scratch file");
            return;
        }
        let mut config = BuildConfig::new(input);
        config.output = self.work_dir.join("repl_bin");
        config.skip_verify = false;
        let mut diags = Diagnostics::new();
        match build::run(&config, &mut diags) {
            Ok(code) => {
                if code != 0 {
                    eprintln!("(exit code {code})");
                }
            }
            Err(e) => {
                diags.report_all("<repl>", &source);
                eprintln!("{e}");
            }
        }
    }
}
