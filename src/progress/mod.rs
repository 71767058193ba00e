// src/progress/mod.rs
//
// Progress/Timing (C7, spec.md §4.7). Two artifacts per run directory: an
// append-only `progress.json` of one-line-per-phase JSON objects, and a
// `timing.json` checkpoint summary written once the run ends. Grounded on
// `original_source/wsgi/services/tsim_timing_service.py` (`start_timer`/
// `checkpoint`/`end_timer`, including its elapsed/delta bookkeeping), with the
// per-run-directory append-only log shape from spec.md §6 "Progress log".

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Error;

/// One line of `progress.json`. Phase names are stable identifiers per
/// spec.md §6 (`START`, `MULTI_REACHABILITY_PHASE1_start`, ...); this type
/// doesn't constrain them to an enum because external consumers (the
/// out-of-scope HTTP front-end) may introduce new ones without a crate
/// change, mirroring the Python `log_phase(run_id, phase, message)` calls
/// which take a bare string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: String,
    pub phase: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub elapsed_secs: f64,
    pub delta_secs: f64,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSummary {
    pub run_id: String,
    pub total_elapsed_secs: f64,
    pub checkpoints: Vec<Checkpoint>,
}

struct Timer {
    start: Instant,
    last: Instant,
    checkpoints: Vec<Checkpoint>,
}

/// One run's progress tracker: appends phase lines to `<run_dir>/progress.json`
/// and, on `end_timer`, writes `<run_dir>/timing.json`. A single process may
/// track many concurrent runs, so state is keyed by `run_id` behind one lock
/// (mirroring the Python service's single `active_timers` dict), not one
/// tracker per run — that way the scheduler can hold one `Arc<ProgressService>`
/// for its whole lifetime.
pub struct ProgressService {
    run_dir: PathBuf,
    timers: Mutex<HashMap<String, Timer>>,
}

impl ProgressService {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        ProgressService {
            run_dir: run_dir.into(),
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.run_dir.join(run_id)
    }

    /// Appends one JSON line to `<run_dir>/<run_id>/progress.json`, creating
    /// the run directory if needed. Best-effort: a logging failure must never
    /// abort the run it is trying to describe, so errors are logged and
    /// swallowed, matching the Python `_update_progress`'s bare `try/except`.
    pub fn log_phase(&self, run_id: &str, phase: &str, message: &str) {
        let entry = ProgressEntry {
            timestamp: now_rfc3339(),
            phase: phase.to_string(),
            message: message.to_string(),
        };
        if let Err(e) = self.append_line(run_id, &entry) {
            warn!(run_id, phase, error = %e, "failed to write progress entry");
        } else {
            debug!(run_id, phase, message, "progress");
        }
    }

    fn append_line(&self, run_id: &str, entry: &ProgressEntry) -> std::io::Result<()> {
        use std::io::Write;
        let dir = self.run_path(run_id);
        std::fs::create_dir_all(&dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("progress.json"))?;
        let line = serde_json::to_string(entry).unwrap_or_default();
        writeln!(file, "{line}")
    }

    pub fn start_timer(&self, run_id: &str) {
        let now = Instant::now();
        self.timers.lock().unwrap().insert(
            run_id.to_string(),
            Timer {
                start: now,
                last: now,
                checkpoints: Vec::new(),
            },
        );
    }

    /// Records a named checkpoint, elapsed-since-start and delta-since-last,
    /// mirroring `TsimTimingService.checkpoint`.
    pub fn checkpoint(&self, run_id: &str, name: &str, details: Option<&str>) -> Duration {
        let mut timers = self.timers.lock().unwrap();
        let Some(timer) = timers.get_mut(run_id) else {
            warn!(run_id, "checkpoint on unknown timer");
            return Duration::ZERO;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(timer.start);
        let delta = now.duration_since(timer.last);
        timer.checkpoints.push(Checkpoint {
            name: name.to_string(),
            elapsed_secs: elapsed.as_secs_f64(),
            delta_secs: delta.as_secs_f64(),
            details: details.map(String::from),
        });
        timer.last = now;
        elapsed
    }

    /// Ends the timer, writes `timing.json` into the run directory, and
    /// returns the summary. Idempotent-safe: a second call on an unknown
    /// timer returns an empty summary rather than panicking, matching the
    /// Python service's "timer not found" warning path.
    pub fn end_timer(&self, run_id: &str) -> Result<TimingSummary, Error> {
        let timer = self.timers.lock().unwrap().remove(run_id);
        let summary = match timer {
            Some(t) => TimingSummary {
                run_id: run_id.to_string(),
                total_elapsed_secs: t.start.elapsed().as_secs_f64(),
                checkpoints: t.checkpoints,
            },
            None => TimingSummary {
                run_id: run_id.to_string(),
                total_elapsed_secs: 0.0,
                checkpoints: vec![],
            },
        };
        let dir = self.run_path(run_id);
        std::fs::create_dir_all(&dir)?;
        let out = std::fs::File::create(dir.join("timing.json"))?;
        serde_json::to_writer_pretty(out, &summary).map_err(|e| {
            Error::Config(format!("failed to write timing.json for {run_id}: {e}"))
        })?;
        info!(run_id, total = summary.total_elapsed_secs, "run timing recorded");
        Ok(summary)
    }

    /// Reads back every line of `<run_id>/progress.json`, used by status
    /// endpoints (out of scope) and by tests to assert phase ordering.
    pub fn read_progress(&self, run_id: &str) -> std::io::Result<Vec<ProgressEntry>> {
        let path = self.run_path(run_id).join("progress.json");
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

/// `chrono::Utc::now()` wrapped so every progress/registry timestamp in the
/// crate goes through one call site.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_phase_appends_jsonl_and_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let svc = ProgressService::new(dir.path());
        svc.log_phase("run1", "START", "starting");
        svc.log_phase("run1", "COMPLETE", "done");
        let entries = svc.read_progress("run1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].phase, "START");
        assert_eq!(entries[1].phase, "COMPLETE");
    }

    #[test]
    fn timer_checkpoints_and_end_produce_timing_json() {
        let dir = tempfile::tempdir().unwrap();
        let svc = ProgressService::new(dir.path());
        svc.start_timer("run1");
        svc.checkpoint("run1", "TRACE_DONE", None);
        std::thread::sleep(Duration::from_millis(5));
        let summary = svc.end_timer("run1").unwrap();
        assert_eq!(summary.checkpoints.len(), 1);
        assert!(summary.total_elapsed_secs >= 0.0);
        assert!(dir.path().join("run1").join("timing.json").exists());
    }

    #[test]
    fn end_timer_on_unknown_run_returns_empty_summary_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let svc = ProgressService::new(dir.path());
        let summary = svc.end_timer("ghost").unwrap();
        assert_eq!(summary.total_elapsed_secs, 0.0);
        assert!(summary.checkpoints.is_empty());
    }
}
