//! Gantry is a single-node task orchestration engine backed by SQLite.
//!
//! Tasks form a dependency graph of blocker edges; the ready set is the
//! slice of that graph with no open blockers, ordered by score. Workers
//! race for exclusive leased claims, record runs while they execute, and a
//! reconciliation sweep repairs whatever crashed workers leave behind. The
//! whole graph can be exported to and merged from an append-friendly
//! operation log.
//!
//! The pieces compose but stand alone:
//!
//! - [`store::SqliteStore`] owns the schema and every transactional write
//! - [`graph`] maintains the dependency edges and rejects cycles
//! - [`ready`] computes the claimable frontier
//! - [`claim`] implements the atomic claim/lease protocol
//! - [`worker`] runs the orchestrator pool around an [`worker::ExecutionHook`]
//! - [`reconcile`] sweeps orphaned runs, expired leases and dead workers
//! - [`sync`] moves the graph between nodes as a JSONL operation log

pub mod claim;
pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod ready;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod worker;

pub use config::OrchestratorConfig;
pub use error::{GantryError, Result};
pub use model::{
    Claim, ClaimStatus, Dependency, LogEntry, LogOp, Metadata, NewTask, Run, RunStatus, Task,
    TaskDetail, TaskStatus, Worker, WorkerStatus,
};
pub use ready::Readiness;
pub use reconcile::{ProcIdentity, ProcProbe, ProcessProbe, Reconciler, SweepStats};
pub use store::SqliteStore;
pub use sync::{ImportReport, SyncStatus};
pub use worker::{ExecutionHook, HookOutcome, Orchestrator, WorkContext, WorkerRegistry};

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Exclusive single-instance guard backed by a pid file.
///
/// Acquisition is an atomic `create_new`; a leftover file from a crashed
/// process is taken over when its recorded pid is no longer alive. The file
/// is removed on drop.
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse::<i64>().ok());
                match holder {
                    Some(pid) if Path::new(&format!("/proc/{pid}")).exists() => {
                        Err(anyhow::anyhow!(
                            "another instance holds {} (pid {pid})",
                            path.display()
                        )
                        .into())
                    }
                    // Holder is gone or the file is garbage: take over.
                    _ => {
                        std::fs::remove_file(&path)?;
                        Ok(Self::try_create(&path)?)
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        write!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
