//! BMB Compiler CLI

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use bmb::build::{self, BuildConfig, PgoMode};
use bmb::error::Diagnostics;

#[derive(Parser)]
#[command(name = "bmb", version, about = "BMB Compiler - AI-Native Language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PgoFlag {
    Generate,
    Use,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a BMB source file to a native binary
    Build {
        /// Source file to compile
        file: PathBuf,
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Stop after writing textual LLVM IR
        #[arg(long)]
        emit_ir: bool,
        /// Mirror SMT queries into the cache directory
        #[arg(long)]
        emit_smt: bool,
        /// SMT solver timeout in milliseconds
        #[arg(long)]
        verify_timeout: Option<u64>,
        /// Treat inconclusive verification as an error
        #[arg(long)]
        strict_verify: bool,
        /// Enable link-time optimization
        #[arg(long)]
        lto: bool,
        /// Profile-guided optimization mode
        #[arg(long, value_enum)]
        pgo: Option<PgoFlag>,
        /// Cross-compilation target triple
        #[arg(long)]
        target: Option<String>,
        /// Print external tool invocations
        #[arg(short, long)]
        verbose: bool,
    },
    /// Build and execute a BMB source file
    Run {
        file: PathBuf,
        #[arg(long)]
        verify_timeout: Option<u64>,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Type-check only (no SMT, no codegen)
    Check {
        file: PathBuf,
        /// Dump the AST as JSON after parsing
        #[arg(long)]
        emit_ast: bool,
        /// Machine-readable JSON diagnostics
        #[arg(long)]
        machine: bool,
    },
    /// Run SMT contract verification and print the report
    Verify {
        file: PathBuf,
        #[arg(long)]
        verify_timeout: Option<u64>,
        #[arg(long)]
        emit_smt: bool,
        #[arg(long)]
        strict_verify: bool,
    },
    /// Interactive session
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Build {
            file,
            output,
            emit_ir,
            emit_smt,
            verify_timeout,
            strict_verify,
            lto,
            pgo,
            target,
            verbose,
        } => {
            let mut config = BuildConfig::new(file)
                .emit_ir(emit_ir)
                .emit_smt(emit_smt)
                .strict_verify(strict_verify)
                .lto(lto)
                .target_triple(target)
                .verbose(verbose);
            if let Some(out) = output {
                config = config.output(out);
            }
            if let Some(ms) = verify_timeout {
                config = config.verify_timeout_ms(ms);
            }
            config = config.pgo(match pgo {
                None => PgoMode::Off,
                Some(PgoFlag::Generate) => PgoMode::Generate,
                Some(PgoFlag::Use) => PgoMode::Use,
            });
            cmd_build(config)
        }
        Command::Run {
            file,
            verify_timeout,
            verbose,
        } => {
            let mut config = BuildConfig::new(file).verbose(verbose);
            config.output = std::env::temp_dir().join("bmb-run-out");
            if let Some(ms) = verify_timeout {
                config = config.verify_timeout_ms(ms);
            }
            cmd_run(config)
        }
        Command::Check {
            file,
            emit_ast,
            machine,
        } => cmd_check(&file, emit_ast, machine),
        Command::Verify {
            file,
            verify_timeout,
            emit_smt,
            strict_verify,
        } => {
            let mut config = BuildConfig::new(file.clone())
                .emit_smt(emit_smt)
                .strict_verify(strict_verify);
            if let Some(ms) = verify_timeout {
                config = config.verify_timeout_ms(ms);
            }
            cmd_verify(&file, config)
        }
        Command::Repl => cmd_repl(),
    };
    ExitCode::from(code)
}

fn read_source(path: &PathBuf) -> Result<String, u8> {
    std::fs::read_to_string(path).map_err(|e| {
        eprintln!("error: cannot read {}: {e}", path.display());
        1u8
    })
}

fn finish(diags: &Diagnostics, filename: &str, source: &str) -> u8 {
    diags.report_all(filename, source);
    diags.exit_code() as u8
}

fn cmd_build(config: BuildConfig) -> u8 {
    let Ok(source) = read_source(&config.input) else {
        return 1;
    };
    let filename = config.input.display().to_string();
    let mut diags = Diagnostics::new();
    match build::build(&config, &mut diags) {
        Ok(()) => finish(&diags, &filename, &source),
        Err(build::BuildError::Diagnostics(_)) => finish(&diags, &filename, &source),
        Err(e) => {
            diags.report_all(&filename, &source);
            eprintln!("error: {e}");
            2
        }
    }
}

fn cmd_run(config: BuildConfig) -> u8 {
    let Ok(source) = read_source(&config.input) else {
        return 1;
    };
    let filename = config.input.display().to_string();
    let mut diags = Diagnostics::new();
    match build::run(&config, &mut diags) {
        Ok(code) => {
            diags.report_all(&filename, &source);
            code.clamp(0, 255) as u8
        }
        Err(build::BuildError::Diagnostics(_)) => finish(&diags, &filename, &source),
        Err(e) => {
            diags.report_all(&filename, &source);
            eprintln!("error: {e}");
            2
        }
    }
}

fn cmd_check(file: &PathBuf, emit_ast: bool, machine: bool) -> u8 {
    let Ok(source) = read_source(file) else {
        return 1;
    };
    let filename = file.display().to_string();
    let mut diags = Diagnostics::new();
    let front = build::front(&filename, &source, &mut diags);

    if machine {
        for w in diags.warnings() {
            bmb::error::report_warning_machine(&filename, w);
        }
        for e in diags.errors() {
            bmb::error::report_error_machine(&filename, e);
        }
        return diags.exit_code() as u8;
    }

    if let Some(out) = &front {
        if emit_ast {
            match serde_json::to_string_pretty(&out.ast) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("error: {e}"),
            }
        } else {
            println!("\u{2713} {filename} type checks successfully");
        }
    }
    finish(&diags, &filename, &source)
}

fn cmd_verify(file: &PathBuf, config: BuildConfig) -> u8 {
    let Ok(source) = read_source(file) else {
        return 1;
    };
    let filename = file.display().to_string();
    let mut diags = Diagnostics::new();
    let Some(front) = build::front(&filename, &source, &mut diags) else {
        return finish(&diags, &filename, &source);
    };

    let report = build::verify_phase(&front.ast, &config, &mut diags);
    print!("{report}");
    finish(&diags, &filename, &source)
}

fn cmd_repl() -> u8 {
    match bmb::repl::Repl::new() {
        Ok(mut repl) => match repl.run() {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {e}");
                2
            }
        },
        Err(e) => {
            eprintln!("error: {e}");
            2
        }
    }
}
