//! Bootstrap fixed-point verification
//!
//! Three-stage check gating release: Stage0 (a foreign compiler
//! binary) compiles the self-hosted source into Stage1; Stage1
//! recompiles the same source into Stage2; Stage2 compiles it once
//! more into Stage3. The build passes only when the LLVM IR emitted by
//! Stage2 and Stage3 is byte-for-byte identical. Any divergence means
//! nondeterminism leaked into codegen (hash-map iteration order being
//! the classic culprit) and is fatal.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::build::{BuildError, BuildResult};

/// Bootstrap run configuration
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Stage-0 compiler binary (foreign)
    pub stage0: PathBuf,
    /// Self-hosted compiler source
    pub source: PathBuf,
    /// Scratch directory for stage outputs
    pub work_dir: PathBuf,
    pub verbose: bool,
}

/// Outcome of the three-stage check
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub stage1: PathBuf,
    pub stage2: PathBuf,
    pub stage3: PathBuf,
    /// Stage2 IR == Stage3 IR, byte for byte
    pub fixed_point: bool,
    /// Byte offset of the first divergence when not at fixed point
    pub first_divergence: Option<usize>,
}

/// Run the three-stage bootstrap and compare emitted IR.
pub fn verify_bootstrap(config: &BootstrapConfig) -> BuildResult<BootstrapReport> {
    std::fs::create_dir_all(&config.work_dir)?;
    let stage1 = config.work_dir.join("stage1");
    let stage2 = config.work_dir.join("stage2");
    let stage3 = config.work_dir.join("stage3");

    compile_with(&config.stage0, &config.source, &stage1, false, config.verbose)?;
    compile_with(&stage1, &config.source, &stage2, false, config.verbose)?;

    // IR emitted by Stage2 both builds Stage3 and is the left-hand side
    // of the comparison.
    let ir2 = config.work_dir.join("stage2.ll");
    compile_with(&stage2, &config.source, &ir2, true, config.verbose)?;
    compile_with(&stage2, &config.source, &stage3, false, config.verbose)?;

    let ir3 = config.work_dir.join("stage3.ll");
    compile_with(&stage3, &config.source, &ir3, true, config.verbose)?;

    let bytes2 = std::fs::read(ir2.with_extension("ll"))?;
    let bytes3 = std::fs::read(ir3.with_extension("ll"))?;
    let first_divergence = first_difference(&bytes2, &bytes3);

    Ok(BootstrapReport {
        stage1,
        stage2,
        stage3,
        fixed_point: first_divergence.is_none(),
        first_divergence,
    })
}

fn compile_with(
    compiler: &Path,
    source: &Path,
    output: &Path,
    emit_ir: bool,
    verbose: bool,
) -> BuildResult<()> {
    let mut cmd = Command::new(compiler);
    cmd.arg("build").arg(source).arg("-o").arg(output);
    if emit_ir {
        cmd.arg("--emit-ir");
    }
    if verbose {
        eprintln!("  {cmd:?}");
    }
    let out = cmd
        .output()
        .map_err(|e| BuildError::Tool(format!("stage compiler failed to start: {e}")))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(BuildError::Tool(format!(
            "stage compile with {} failed: {stderr}",
            compiler.display()
        )));
    }
    Ok(())
}

/// Byte offset where two buffers first disagree, None when identical.
fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    let shared = a.len().min(b.len());
    for i in 0..shared {
        if a[i] != b[i] {
            return Some(i);
        }
    }
    if a.len() != b.len() {
        Some(shared)
    } else {
        None
    }
}

/// One line of the bootstrap test manifest:
/// `filename|expected-first-line-of-stdout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub file: String,
    pub expected: String,
}

/// Parse a manifest. Blank lines and lines starting with `#` are
/// ignored.
pub fn parse_manifest(text: &str) -> Vec<ManifestEntry> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (file, expected) = line.split_once('|')?;
            Some(ManifestEntry {
                file: file.trim().to_string(),
                expected: expected.trim().to_string(),
            })
        })
        .collect()
}

/// Result of running one manifest test.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub entry: ManifestEntry,
    pub passed: bool,
    pub actual: String,
}

/// Compile and execute every manifest entry with the given compiler,
/// comparing the first line of stdout against the expectation.
pub fn run_manifest(
    compiler: &Path,
    manifest_dir: &Path,
    entries: &[ManifestEntry],
    work_dir: &Path,
) -> BuildResult<Vec<TestOutcome>> {
    std::fs::create_dir_all(work_dir)?;
    let mut outcomes = Vec::with_capacity(entries.len());
    for entry in entries {
        let source = manifest_dir.join(&entry.file);
        let binary = work_dir.join(
            Path::new(&entry.file)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "test".to_string()),
        );
        if let Err(e) = compile_with(compiler, &source, &binary, false, false) {
            outcomes.push(TestOutcome {
                entry: entry.clone(),
                passed: false,
                actual: format!("<compile error: {e}>"),
            });
            continue;
        }
        let out = Command::new(&binary)
            .output()
            .map_err(|e| BuildError::Tool(format!("test binary failed to start: {e}")))?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        let actual = stdout.lines().next().unwrap_or("").to_string();
        outcomes.push(TestOutcome {
            passed: actual == entry.expected,
            entry: entry.clone(),
            actual,
        });
    }
    Ok(outcomes)
}
