// src/pool/mod.rs
//
// Host Pool (C3): five-phase atomic batch preparation plus refcounted,
// grace-period host cleanup. Grounded on
// `original_source/wsgi/services/tsim_quick_job_host_pool_service.py` in
// full. The Python service's `threading.Timer(10.0, ...)` polling loop
// becomes a `tokio::time::sleep`-driven recheck task per host, guarded by a
// `tokio::sync::Mutex` the way the teacher guards shared state, per spec.md
// §9's "replace polling timers with a small async timer wheel" note.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::PoolError;
use crate::fabric::naming::MAX_IFNAME_LEN;
use crate::fabric::HIDDEN_NS;
use crate::fabric::nsexec::NamespaceExec;
use crate::traits::{TraceDoc, TraceProvider};

pub type JobId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRole {
    Source,
    Destination,
}

/// One pool-managed endpoint namespace: `source-<n>`/`destination-<n>` slots,
/// scoped per batch, carrying a /24 primary address on the router's subnet.
#[derive(Debug, Clone)]
pub struct HostSpec {
    pub name: String,
    pub role: HostRole,
    pub primary_ip: Ipv4Addr,
    pub secondary_ips: Vec<Ipv4Addr>,
    pub router: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationOutcome {
    Created,
    Reused,
}

#[derive(Debug)]
struct HostRecord {
    spec: HostSpec,
    refcount: HashSet<JobId>,
    expiry: Option<Instant>,
    paused: bool,
    created: bool,
}

#[derive(Default)]
struct PoolState {
    hosts: HashMap<String, HostRecord>,
}

pub struct PoolStatus {
    pub active_hosts: Vec<String>,
    pub pending_cleanup: Vec<(String, Option<Duration>)>,
    pub paused_for_detailed: Vec<String>,
}

pub struct JobSpec {
    pub run_id: JobId,
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub user_supplied_trace: Option<TraceDoc>,
}

pub struct BatchResult {
    pub jobs_launched: Vec<JobId>,
    pub hosts_created: Vec<String>,
    pub allocated_hosts: HashMap<JobId, HashMap<String, HostSpec>>,
}

/// Returns true while any detailed (namespace-mutating) job is running.
/// Supplied as a closure rather than a trait since the scheduler (the only
/// source of truth for this) is a single actor queried synchronously.
pub type RunningDetailedJobsFn = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct HostPool {
    state: Mutex<PoolState>,
    exec: Arc<dyn NamespaceExec>,
    trace: Arc<dyn TraceProvider>,
    config: RuntimeConfig,
    has_running_detailed_jobs: RunningDetailedJobsFn,
}

impl HostPool {
    pub fn new(
        exec: Arc<dyn NamespaceExec>,
        trace: Arc<dyn TraceProvider>,
        config: RuntimeConfig,
        has_running_detailed_jobs: RunningDetailedJobsFn,
    ) -> Arc<Self> {
        Arc::new(HostPool {
            state: Mutex::new(PoolState::default()),
            exec,
            trace,
            config,
            has_running_detailed_jobs,
        })
    }

    /// Phases 1-5 of atomic batch preparation (spec.md §4.3). `execute` is
    /// invoked once per job with its allocated hosts once every host in the
    /// batch exists and refcounts are registered.
    pub async fn prepare_batch<F>(
        self: &Arc<Self>,
        jobs: Vec<JobSpec>,
        execute: F,
    ) -> Result<BatchResult, PoolError>
    where
        F: Fn(&JobId, &HashMap<String, HostSpec>) -> Result<(), String>,
    {
        if jobs.is_empty() {
            return Ok(BatchResult {
                jobs_launched: vec![],
                hosts_created: vec![],
                allocated_hosts: HashMap::new(),
            });
        }

        // Phase 1: parallel trace (or reuse a caller-supplied one).
        let mut traces = HashMap::new();
        let futures = jobs.iter().map(|job| {
            let trace = self.trace.clone();
            let job_id = job.run_id.clone();
            let supplied = job.user_supplied_trace.clone();
            let (src, dst) = (job.source_ip, job.dest_ip);
            async move {
                if let Some(doc) = supplied {
                    warn!(
                        job = %job_id,
                        routers = ?doc.hops.iter().map(|h| h.router.clone()).collect::<Vec<_>>(),
                        "using user-supplied trace verbatim"
                    );
                    (job_id, Ok(doc))
                } else {
                    (job_id, trace.trace(src, dst).await)
                }
            }
        });
        for (job_id, result) in futures::future::join_all(futures).await {
            match result {
                Ok(doc) => {
                    traces.insert(job_id, doc);
                }
                Err(e) => {
                    return Err(PoolError::HostCreateFailed {
                        name: job_id,
                        reason: format!("trace failed: {e}"),
                    })
                }
            }
        }

        // Phase 2: requirements analysis — one source-<n> slot per on-path router.
        let mut requirements: HashMap<JobId, HashMap<String, HostSpec>> = HashMap::new();
        for job in &jobs {
            let doc = &traces[&job.run_id];
            let mut slots = HashMap::new();
            for (i, hop) in doc.hops.iter().enumerate() {
                let name = format!("source-{}", i + 1);
                slots.insert(
                    name.clone(),
                    HostSpec {
                        name,
                        role: HostRole::Source,
                        primary_ip: job.source_ip,
                        secondary_ips: Vec::new(),
                        router: hop.router.clone(),
                    },
                );
            }
            requirements.insert(job.run_id.clone(), slots);
        }

        // Phase 3: create every unique host, in stable (sorted) order.
        let mut all_hosts: std::collections::BTreeMap<String, HostSpec> = std::collections::BTreeMap::new();
        for slots in requirements.values() {
            for (name, spec) in slots {
                all_hosts.entry(name.clone()).or_insert_with(|| spec.clone());
            }
        }

        let mut created_hosts = Vec::new();
        for (name, spec) in &all_hosts {
            let outcome = self.create_host(spec).await?;
            if outcome == CreationOutcome::Created {
                created_hosts.push(name.clone());
            }
        }

        // Phase 4: refcount registration, guarded by the pool lock.
        {
            let mut state = self.state.lock().await;
            for (job_id, slots) in &requirements {
                for (name, spec) in slots {
                    let entry = state.hosts.entry(name.clone()).or_insert_with(|| HostRecord {
                        spec: spec.clone(),
                        refcount: HashSet::new(),
                        expiry: None,
                        paused: false,
                        created: created_hosts.contains(name),
                    });
                    entry.refcount.insert(job_id.clone());
                    entry.expiry = None;
                    entry.paused = false;
                }
            }
        }

        // Phase 5: launch.
        let mut launched = Vec::new();
        for job in &jobs {
            let allocated = requirements.get(&job.run_id).cloned().unwrap_or_default();
            match execute(&job.run_id, &allocated) {
                Ok(()) => {
                    launched.push(job.run_id.clone());
                    info!(job = %job.run_id, "launched batch job");
                }
                Err(e) => {
                    warn!(job = %job.run_id, error = %e, "failed to launch job, releasing its hosts");
                    self.release(&job.run_id, allocated.keys().cloned().collect()).await;
                }
            }
        }

        Ok(BatchResult {
            jobs_launched: launched,
            hosts_created: created_hosts,
            allocated_hosts: requirements,
        })
    }

    /// Creates (or reuses) a single host outside the batch-prepare flow and
    /// registers `job_id`'s refcount on it, the same way phases 3-4 of
    /// `prepare_batch` do for a whole batch. Used by the Tester to provision
    /// the `destination-<i>` side of P2 (spec.md §4.5), which isn't modeled
    /// by `prepare_batch`'s source-only requirements analysis.
    pub async fn ensure_host(
        self: &Arc<Self>,
        job_id: &str,
        spec: HostSpec,
    ) -> Result<CreationOutcome, PoolError> {
        let outcome = self.create_host(&spec).await?;
        let mut state = self.state.lock().await;
        let entry = state.hosts.entry(spec.name.clone()).or_insert_with(|| HostRecord {
            spec: spec.clone(),
            refcount: HashSet::new(),
            expiry: None,
            paused: false,
            created: outcome == CreationOutcome::Created,
        });
        entry.refcount.insert(job_id.to_string());
        entry.expiry = None;
        entry.paused = false;
        Ok(outcome)
    }

    /// Creates one pool host namespace and wires it into the hidden mesh,
    /// mirroring `host_namespace_setup.py`'s `create_mesh_connection` +
    /// `add_host`: a veth pair with distinct host/mesh-side names, the host
    /// side moved into the host namespace and renamed `eth0`, the mesh side
    /// moved into the hidden-mesh namespace and mastered to the bridge
    /// auto-detected for the primary address's subnet, plus one `dummyN`
    /// interface per secondary IP.
    async fn create_host(&self, spec: &HostSpec) -> Result<CreationOutcome, PoolError> {
        let HostVethPair { host_veth, mesh_veth } = host_veth_pair(&spec.name);
        let addr = format!("{}/24", spec.primary_ip);
        let check = self
            .exec
            .run(&["ip", "netns", "add", &spec.name], None, self.config.subprocess_timeout())
            .await;

        let outcome = match check {
            Ok(out) if out.success() => CreationOutcome::Created,
            _ => CreationOutcome::Reused,
        };

        if outcome == CreationOutcome::Reused {
            debug!(host = %spec.name, router = %spec.router, "host already exists, reusing");
            return Ok(outcome);
        }

        self.exec
            .run(
                &["ip", "link", "add", &host_veth, "type", "veth", "peer", "name", &mesh_veth],
                None,
                self.config.subprocess_timeout(),
            )
            .await
            .map_err(|e| PoolError::HostCreateFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        self.exec
            .run(&["ip", "link", "set", &host_veth, "netns", &spec.name], None, self.config.subprocess_timeout())
            .await
            .map_err(|e| PoolError::HostCreateFailed {
                name: spec.name.clone(),
                reason: format!("failed to move {host_veth} into {}: {e}", spec.name),
            })?;

        self.exec
            .run(&["ip", "link", "set", &mesh_veth, "netns", HIDDEN_NS], None, self.config.subprocess_timeout())
            .await
            .map_err(|e| PoolError::HostCreateFailed {
                name: spec.name.clone(),
                reason: format!("failed to move {mesh_veth} into {HIDDEN_NS}: {e} (host end {host_veth} is stranded)"),
            })?;

        self.exec
            .run(&["ip", "link", "set", &host_veth, "name", "eth0"], Some(&spec.name), self.config.subprocess_timeout())
            .await
            .ok();

        let net = ipnet::Ipv4Net::new(spec.primary_ip, 24)
            .map(|n| ipnet::Ipv4Net::new(n.network(), 24).expect("24 is a valid prefix length"));
        match net {
            Some(net) => {
                let bridge = crate::topology::subnet::bridge_name(&net);
                if let Err(e) = self
                    .exec
                    .run(&["ip", "link", "set", &mesh_veth, "master", &bridge], Some(HIDDEN_NS), self.config.subprocess_timeout())
                    .await
                {
                    warn!(host = %spec.name, %bridge, "failed to master {mesh_veth} to mesh bridge: {e}");
                }
            }
            None => warn!(host = %spec.name, "could not determine mesh bridge for primary IP"),
        }
        self.exec
            .run(&["ip", "link", "set", &mesh_veth, "up"], Some(HIDDEN_NS), self.config.subprocess_timeout())
            .await
            .ok();

        self.exec
            .run(&["ip", "addr", "add", &addr, "dev", "eth0"], Some(&spec.name), self.config.subprocess_timeout())
            .await
            .ok();
        self.exec
            .run(&["ip", "link", "set", "eth0", "up"], Some(&spec.name), self.config.subprocess_timeout())
            .await
            .ok();

        for (i, secondary) in spec.secondary_ips.iter().enumerate() {
            let dummy = format!("dummy{i}");
            self.exec
                .run(&["ip", "link", "add", &dummy, "type", "dummy"], Some(&spec.name), self.config.subprocess_timeout())
                .await
                .ok();
            self.exec
                .run(
                    &["ip", "addr", "add", &format!("{secondary}/32"), "dev", &dummy],
                    Some(&spec.name),
                    self.config.subprocess_timeout(),
                )
                .await
                .ok();
            self.exec
                .run(&["ip", "link", "set", &dummy, "up"], Some(&spec.name), self.config.subprocess_timeout())
                .await
                .ok();
        }

        self.exec
            .run(
                &["ip", "route", "add", "default", "via", &spec.router],
                Some(&spec.name),
                self.config.subprocess_timeout(),
            )
            .await
            .ok();

        debug!(host = %spec.name, router = %spec.router, ?outcome, "host created/reused");
        Ok(outcome)
    }

    /// Releases a job's hold on its hosts; hosts with a refcount of zero are
    /// scheduled for grace-period cleanup (or paused, if a detailed job is
    /// currently running).
    pub async fn release(self: &Arc<Self>, job_id: &str, hosts: Vec<String>) {
        for host_name in hosts {
            let should_schedule = {
                let mut state = self.state.lock().await;
                let Some(record) = state.hosts.get_mut(&host_name) else {
                    continue;
                };
                record.refcount.remove(job_id);
                if record.refcount.is_empty() {
                    if (self.has_running_detailed_jobs)() {
                        record.paused = true;
                        record.expiry = None;
                        info!(host = %host_name, "no longer in use, pausing cleanup (detailed job running)");
                    } else {
                        record.expiry = Some(Instant::now() + self.config.grace_period());
                        info!(host = %host_name, grace = ?self.config.grace_period(), "scheduling cleanup");
                    }
                    true
                } else {
                    debug!(host = %host_name, remaining = record.refcount.len(), "still in use");
                    false
                }
            };
            if should_schedule {
                self.spawn_recheck(host_name);
            }
        }
    }

    fn spawn_recheck(self: &Arc<Self>, host_name: String) {
        let pool = self.clone();
        tokio::spawn(async move {
            sleep(pool.config.cleanup_recheck_interval()).await;
            pool.recheck_host(&host_name).await;
        });
    }

    /// One 10-second recheck tick: pause if a detailed job appeared, resume
    /// grace period if one finished, skip if reused, otherwise clean up once
    /// the grace period has elapsed. Mirrors `_cleanup_host`.
    async fn recheck_host(self: &Arc<Self>, host_name: &str) {
        let detailed_running = (self.has_running_detailed_jobs)();

        let action = {
            let mut state = self.state.lock().await;
            let Some(record) = state.hosts.get_mut(host_name) else {
                return;
            };

            if detailed_running {
                record.paused = true;
                record.expiry = None;
                Action::Reschedule
            } else if record.paused {
                record.paused = false;
                record.expiry = Some(Instant::now() + self.config.grace_period());
                Action::Reschedule
            } else if !record.refcount.is_empty() {
                Action::Stop
            } else {
                match record.expiry {
                    Some(expiry) if expiry > Instant::now() => Action::Reschedule,
                    Some(_) => Action::Remove,
                    None => Action::Reschedule,
                }
            }
        };

        match action {
            Action::Reschedule => self.spawn_recheck(host_name.to_string()),
            Action::Stop => {}
            Action::Remove => {
                self.destroy_host(host_name).await;
                self.state.lock().await.hosts.remove(host_name);
            }
        }
    }

    async fn destroy_host(&self, host_name: &str) {
        info!(host = %host_name, "cleaning up unused host");
        let _ = self
            .exec
            .run(&["ip", "netns", "del", host_name], None, self.config.subprocess_timeout())
            .await;
    }

    /// Forced removal outside the grace-period flow (spec.md §4.3 "Manual
    /// removal"). Refused if the host is still referenced by a job.
    pub async fn remove_manual(&self, host_name: &str) -> Result<(), PoolError> {
        {
            let state = self.state.lock().await;
            if let Some(record) = state.hosts.get(host_name) {
                if !record.refcount.is_empty() {
                    return Err(PoolError::HostInUse {
                        name: host_name.to_string(),
                        refcount: record.refcount.len(),
                    });
                }
            }
        }
        self.destroy_host(host_name).await;
        self.state.lock().await.hosts.remove(host_name);
        Ok(())
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let mut active = Vec::new();
        let mut pending = Vec::new();
        let mut paused = Vec::new();
        for (name, record) in &state.hosts {
            active.push(name.clone());
            if record.paused {
                paused.push(name.clone());
            } else if let Some(expiry) = record.expiry {
                pending.push((name.clone(), Some(expiry.saturating_duration_since(Instant::now()))));
            }
        }
        PoolStatus {
            active_hosts: active,
            pending_cleanup: pending,
            paused_for_detailed: paused,
        }
    }
}

enum Action {
    Reschedule,
    Stop,
    Remove,
}

struct HostVethPair {
    host_veth: String,
    mesh_veth: String,
}

/// Host-name-hash-derived short veth pair, per spec.md §4.3 "Short veth
/// names use the host-name hash" (the teacher/original use a router-code
/// scheme for routers; pool hosts use an md5-derived one instead since a
/// batch can mint arbitrarily many `source-<n>` names). Matches
/// `create_mesh_connection`'s `h<hash>`/`m<hash>` pair so the two ends are
/// always distinct.
fn host_veth_pair(host_name: &str) -> HostVethPair {
    let digest = md5::compute(host_name.as_bytes());
    let hex = format!("{digest:x}");
    let host_veth = format!("h{}", &hex[..6]);
    let mesh_veth = format!("m{}", &hex[..6]);
    debug_assert!(host_veth.len() <= MAX_IFNAME_LEN);
    debug_assert!(mesh_veth.len() <= MAX_IFNAME_LEN);
    HostVethPair { host_veth, mesh_veth }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::nsexec::FakeExec;
    use crate::traits::fakes::FakeTraceProvider;
    use crate::traits::TraceHop;

    fn test_pool() -> (Arc<HostPool>, Arc<FakeTraceProvider>) {
        let exec = Arc::new(FakeExec::new());
        let trace = Arc::new(FakeTraceProvider::new());
        let config = RuntimeConfig::default();
        let pool = HostPool::new(exec, trace.clone(), config, Arc::new(|| false));
        (pool, trace)
    }

    #[tokio::test]
    async fn batch_creates_one_host_per_on_path_router_and_launches_jobs() {
        let (pool, trace) = test_pool();
        let src: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let dst: Ipv4Addr = "10.0.0.2".parse().unwrap();
        trace.script(
            src,
            dst,
            TraceDoc {
                source_ip: src,
                dest_ip: dst,
                hops: vec![
                    TraceHop {
                        router: "r1".to_string(),
                        incoming_interface: None,
                        outgoing_interface: None,
                    },
                    TraceHop {
                        router: "r2".to_string(),
                        incoming_interface: None,
                        outgoing_interface: None,
                    },
                ],
            },
        );

        let jobs = vec![JobSpec {
            run_id: "job1".to_string(),
            source_ip: src,
            dest_ip: dst,
            user_supplied_trace: None,
        }];

        let result = pool.prepare_batch(jobs, |_job, _hosts| Ok(())).await.unwrap();
        assert_eq!(result.jobs_launched, vec!["job1".to_string()]);
        assert_eq!(result.allocated_hosts["job1"].len(), 2);
    }

    #[tokio::test]
    async fn remove_manual_refuses_while_in_use() {
        let (pool, trace) = test_pool();
        let src: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let dst: Ipv4Addr = "10.0.0.2".parse().unwrap();
        trace.script(
            src,
            dst,
            TraceDoc {
                source_ip: src,
                dest_ip: dst,
                hops: vec![TraceHop {
                    router: "r1".to_string(),
                    incoming_interface: None,
                    outgoing_interface: None,
                }],
            },
        );
        let jobs = vec![JobSpec {
            run_id: "job1".to_string(),
            source_ip: src,
            dest_ip: dst,
            user_supplied_trace: None,
        }];
        pool.prepare_batch(jobs, |_j, _h| Ok(())).await.unwrap();
        let err = pool.remove_manual("source-1").await.unwrap_err();
        assert!(matches!(err, PoolError::HostInUse { .. }));
    }

    #[tokio::test]
    async fn release_with_no_detailed_jobs_schedules_grace_period() {
        let (pool, trace) = test_pool();
        let src: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let dst: Ipv4Addr = "10.0.0.2".parse().unwrap();
        trace.script(
            src,
            dst,
            TraceDoc {
                source_ip: src,
                dest_ip: dst,
                hops: vec![TraceHop {
                    router: "r1".to_string(),
                    incoming_interface: None,
                    outgoing_interface: None,
                }],
            },
        );
        let jobs = vec![JobSpec {
            run_id: "job1".to_string(),
            source_ip: src,
            dest_ip: dst,
            user_supplied_trace: None,
        }];
        pool.prepare_batch(jobs, |_j, _h| Ok(())).await.unwrap();
        pool.release("job1", vec!["source-1".to_string()]).await;
        let status = pool.status().await;
        assert!(!status.pending_cleanup.is_empty());
    }
}
