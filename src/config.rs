// src/config.rs
//
// Runtime configuration for the reachability engine (spec.md §6, "Runtime
// configuration"). Loaded from a TOML file the same way the teacher's
// `SimulatorConfig` was loaded, with `#[serde(default = "...")]` covering every
// field so a near-empty config file is valid.

use serde::Deserialize;
use std::collections::HashMap;

/// Routing-table alias -> numeric ID map, frozen by spec.md §6. Not
/// configurable: these are wire-level constants every router restore must
/// agree on.
pub fn routing_table_alias_to_id(alias: &str) -> Option<u32> {
    routing_table_alias_map().get(alias).copied()
}

pub fn routing_table_alias_map() -> HashMap<&'static str, u32> {
    [
        ("priority_table", 100),
        ("service_table", 200),
        ("backup_table", 300),
        ("qos_table", 400),
        ("management_table", 500),
        ("database_table", 600),
        ("web_table", 700),
        ("emergency_table", 800),
    ]
    .into_iter()
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Base directory for per-job run artifacts (progress logs, service results).
    #[serde(default = "default_run_dir")]
    pub run_dir: String,

    /// Input directory for RouterFacts (`<router>_facts.txt` files).
    #[serde(default = "default_raw_facts_dir")]
    pub raw_facts_dir: String,

    /// Seconds before removing an unused pool host (default 30).
    #[serde(default = "default_grace_period")]
    pub quick_job_host_cleanup_grace_period: u64,

    /// Whether to restore policy rules and named routing tables.
    #[serde(default)]
    pub enable_policy_routing: bool,

    /// Parallelism cap for the I/O worker pool (subprocess invocations).
    #[serde(default = "default_io_pool_workers")]
    pub io_pool_workers: usize,

    /// Parallelism cap for the CPU worker pool. The CPU-bound consumer (report
    /// rendering) is out of scope for this core, but the knob is kept so a host
    /// process embedding this core alongside that renderer has somewhere to put
    /// the number.
    #[serde(default = "default_cpu_pool_workers")]
    pub cpu_pool_workers: usize,

    /// Default command timeout in seconds (default 60).
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout: u64,

    /// Per-service probe timeout. Fixed at 1s for correctness (counter
    /// attribution depends on quiescence); present as a field so it is visible
    /// in a dumped config, but `validate` rejects values outside a narrow band.
    #[serde(default = "default_service_probe_timeout")]
    pub service_probe_timeout_ms: u64,

    /// Maximum queued jobs before `QueueFull` is returned.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How often the host pool rechecks a pending cleanup (seconds).
    #[serde(default = "default_cleanup_recheck_interval")]
    pub cleanup_recheck_interval_secs: u64,
}

fn default_run_dir() -> String {
    "runs".to_string()
}
fn default_raw_facts_dir() -> String {
    "facts".to_string()
}
fn default_grace_period() -> u64 {
    30
}
fn default_io_pool_workers() -> usize {
    4
}
fn default_cpu_pool_workers() -> usize {
    2
}
fn default_subprocess_timeout() -> u64 {
    60
}
fn default_service_probe_timeout() -> u64 {
    1_000
}
fn default_queue_capacity() -> usize {
    256
}
fn default_cleanup_recheck_interval() -> u64 {
    10
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            run_dir: default_run_dir(),
            raw_facts_dir: default_raw_facts_dir(),
            quick_job_host_cleanup_grace_period: default_grace_period(),
            enable_policy_routing: false,
            io_pool_workers: default_io_pool_workers(),
            cpu_pool_workers: default_cpu_pool_workers(),
            subprocess_timeout: default_subprocess_timeout(),
            service_probe_timeout_ms: default_service_probe_timeout(),
            queue_capacity: default_queue_capacity(),
            cleanup_recheck_interval_secs: default_cleanup_recheck_interval(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &str) -> Result<Self, crate::error::Error> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: RuntimeConfig =
            toml::from_str(&raw).map_err(|e| crate::error::Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Narrow band around the "fixed 1s" probe timeout the spec calls a
    /// correctness property, not a tunable: 200ms-5s. Anything outside that is
    /// almost certainly a misconfiguration rather than an intentional choice.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if !(200..=5_000).contains(&self.service_probe_timeout_ms) {
            return Err(crate::error::Error::Config(format!(
                "service_probe_timeout_ms={} is outside the supported 200-5000ms band",
                self.service_probe_timeout_ms
            )));
        }
        if self.queue_capacity == 0 {
            return Err(crate::error::Error::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn service_probe_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.service_probe_timeout_ms)
    }

    pub fn subprocess_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.subprocess_timeout)
    }

    pub fn grace_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.quick_job_host_cleanup_grace_period)
    }

    pub fn cleanup_recheck_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_recheck_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.quick_job_host_cleanup_grace_period, 30);
        assert_eq!(cfg.service_probe_timeout_ms, 1_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_probe_timeout_outside_band() {
        let mut cfg = RuntimeConfig::default();
        cfg.service_probe_timeout_ms = 60_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn alias_table_matches_frozen_map() {
        assert_eq!(routing_table_alias_to_id("priority_table"), Some(100));
        assert_eq!(routing_table_alias_to_id("emergency_table"), Some(800));
        assert_eq!(routing_table_alias_to_id("nonexistent"), None);
    }
}
