// src/error.rs
//
// Crate-wide error taxonomy (spec.md §7). Each concern gets its own `thiserror`
// enum so call sites match on the variants that matter to them; `Error` composes
// all of them for the few call sites (the CLI driver) that need one catch-all type.

use std::path::PathBuf;
use thiserror::Error;

use crate::topology::router::RouterId;
use crate::traits::ProbeError;

#[derive(Debug, Error)]
pub enum FactsError {
    #[error("facts directory {0} does not exist or cannot be read: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("malformed facts file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("router facts missing required section '{section}' for router {router}")]
    MissingSection { router: String, section: String },
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("namespace/interface setup failed for namespace '{namespace}' interface '{interface}': {reason}")]
    Fatal {
        namespace: String,
        interface: String,
        reason: String,
    },
    #[error("router {0:?} is missing from the fabric")]
    UnknownRouter(RouterId),
    #[error("subprocess exec failed: {0}")]
    Exec(#[from] ExecError),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command {cmd:?} in namespace {ns:?} exited with status {status}: {stderr}")]
    NonZeroExit {
        cmd: Vec<String>,
        ns: Option<String>,
        status: i32,
        stderr: String,
    },
    #[error("command {cmd:?} timed out after {timeout_secs}s")]
    Timeout { cmd: Vec<String>, timeout_secs: u64 },
    #[error("failed to spawn command {cmd:?}: {source}")]
    Spawn {
        cmd: Vec<String>,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create host '{name}': {reason}")]
    HostCreateFailed { name: String, reason: String },
    #[error("host '{name}' is still in use by {refcount} job(s)")]
    HostInUse { name: String, refcount: usize },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[derive(Debug, Error)]
pub enum TesterError {
    #[error("no path found from {src} to {dst}")]
    NoPathFound { src: String, dst: String },
    #[error("probe timed out after {0:?}")]
    ProbeTimeout(std::time::Duration),
    #[error("snapshot collection timed out after {0:?}")]
    SnapshotTimeout(std::time::Duration),
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),
    #[error("service start failed: {0}")]
    Probe(#[from] ProbeError),
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("no rule or policy explains the observed outcome for router {router}")]
    Inconclusive { router: String },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("job {0} was cancelled")]
    JobCancelled(String),
    #[error("job {0} not found")]
    UnknownJob(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to lock registry file {0:?}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to read/write registry file {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("registry file {0:?} contains invalid JSON: {1}")]
    Corrupt(PathBuf, serde_json::Error),
}

/// Top-level error used by the CLI driver and anywhere the specific concern
/// doesn't matter to the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Facts(#[from] FactsError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Tester(#[from] TesterError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
