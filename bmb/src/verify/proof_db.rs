//! Proof database
//!
//! Caches verification results keyed by the function's
//! dependency-closure hash. A hit bypasses the solver entirely;
//! invalidation is structural, so any change to a function's AST or to
//! any function it calls produces a different key. Persistence lives
//! under `<cache-dir>/proofs/` with a JSON manifest; writes are guarded
//! by a lock file since parallel driver workers may share the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::contract::FunctionReport;

/// Verification status of one function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    /// Successfully verified
    Verified,
    /// A counterexample exists; the message carries the first one
    Failed(String),
    /// Inconclusive (timeout, unsupported construct, solver missing)
    Unknown(String),
    /// Marked @trust
    Trusted(String),
}

impl VerificationStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified | Self::Trusted(_))
    }
}

/// One cached entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofEntry {
    pub function: String,
    /// Dependency-closure hash the proof is valid for
    pub key: u64,
    pub status: VerificationStatus,
    /// RFC 3339 stamp of when the proof was recorded
    pub verified_at: String,
}

/// Database statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProofDbStats {
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub entries_recorded: usize,
}

/// Manifest mapping function names to proof files
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    /// function name -> proof file name (relative to proofs/)
    files: HashMap<String, String>,
}

/// Proof result cache, optionally persisted to disk.
#[derive(Debug, Default)]
pub struct ProofDatabase {
    entries: HashMap<String, ProofEntry>,
    stats: ProofDbStats,
    /// Cache directory; None keeps everything in memory
    dir: Option<PathBuf>,
}

impl ProofDatabase {
    /// Purely in-memory database (tests, `check` runs).
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) a persisted database under `<dir>/proofs/`.
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        let proofs_dir = dir.join("proofs");
        std::fs::create_dir_all(&proofs_dir)?;
        let mut db = Self {
            entries: HashMap::new(),
            stats: ProofDbStats::default(),
            dir: Some(proofs_dir.clone()),
        };

        let manifest_path = proofs_dir.join("manifest.json");
        if manifest_path.exists() {
            let raw = std::fs::read_to_string(&manifest_path)?;
            if let Ok(manifest) = serde_json::from_str::<Manifest>(&raw) {
                for file in manifest.files.values() {
                    let path = proofs_dir.join(file);
                    if let Ok(raw) = std::fs::read_to_string(&path)
                        && let Ok(entry) = serde_json::from_str::<ProofEntry>(&raw)
                    {
                        db.entries.insert(entry.function.clone(), entry);
                    }
                }
            }
        }
        Ok(db)
    }

    pub fn stats(&self) -> &ProofDbStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Status for a function if the cached key still matches.
    pub fn cached_status(&mut self, function: &str, key: u64) -> Option<VerificationStatus> {
        match self.entries.get(function) {
            Some(entry) if entry.key == key => {
                self.stats.cache_hits += 1;
                Some(entry.status.clone())
            }
            _ => {
                self.stats.cache_misses += 1;
                None
            }
        }
    }

    /// Record a fresh verification outcome.
    pub fn record(&mut self, function: &str, key: u64, report: &FunctionReport) {
        let status = if report.trusted {
            VerificationStatus::Trusted("@trust".to_string())
        } else if let Some(cex) = report.counterexamples().next() {
            VerificationStatus::Failed(cex.what.clone())
        } else if let Some(unknown) = report.unknowns().next() {
            VerificationStatus::Unknown(unknown.what.clone())
        } else {
            VerificationStatus::Verified
        };
        let entry = ProofEntry {
            function: function.to_string(),
            key,
            status,
            verified_at: chrono::Utc::now().to_rfc3339(),
        };
        self.entries.insert(function.to_string(), entry);
        self.stats.entries_recorded += 1;
    }

    /// Persist all entries. Guarded by a lock file so concurrent driver
    /// workers serialize their writes.
    pub fn persist(&self) -> std::io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let _lock = DirLock::acquire(dir)?;

        let mut manifest = Manifest::default();
        for (name, entry) in &self.entries {
            let file = format!("{:016x}.proof", entry.key);
            let path = dir.join(&file);
            std::fs::write(&path, serde_json::to_string_pretty(entry)?)?;
            manifest.files.insert(name.clone(), file);
        }
        std::fs::write(
            dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        Ok(())
    }
}

/// Lock file held while the manifest is rewritten. Stale locks (from a
/// crashed process) expire after a bounded wait.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(".lock");
        for _ in 0..50 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
                Err(e) => return Err(e),
            }
        }
        // The holder is gone or wedged; steal the lock.
        std::fs::remove_file(&path).ok();
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self { path })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}
