// src/tester/mod.rs
//
// Multi-Service Tester (C5, spec.md §4.5). Runs one detailed job end-to-end:
// path discovery, host provisioning, a bounded traceroute, then a strictly
// sequential per-service loop of before-snapshot / probe / after-snapshot /
// attribution. Ported from the phase structure of
// `original_source/src/simulators/network_namespace_tester.py`
// (`SequentialConnectivityTester.test_specific_pair`), with its ad hoc
// ping/mtr subprocess calls replaced by the `ProbeRunner`/`ServiceController`
// seams (spec.md §6).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::analyzer::{self, AnalysisResult, ChainSnapshot, Mode, RuleCounters, Snapshot};
use crate::config::RuntimeConfig;
use crate::error::TesterError;
use crate::fabric::nsexec::NamespaceExec;
use crate::pool::{CreationOutcome, HostPool, HostRole, HostSpec, JobSpec as PoolJobSpec};
use crate::progress::ProgressService;
use crate::traits::{Protocol, ProbeOutcome, ProbeRunner, ServiceController, TraceDoc, TraceProvider};

const SERVICE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const SETTLE_SLEEP: Duration = Duration::from_millis(500);
const INTER_SERVICE_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone)]
pub struct DetailedJobSpec {
    pub run_id: String,
    pub source_ip: Ipv4Addr,
    pub source_port: Option<u16>,
    pub dest_ip: Ipv4Addr,
    pub services: Vec<ServiceSpec>,
    pub user_supplied_trace: Option<TraceDoc>,
    pub creator_tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterOutcome {
    Allowed,
    Blocked,
    Unknown,
}

impl RouterOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RouterOutcome::Allowed => "ALLOWED",
            RouterOutcome::Blocked => "BLOCKED",
            RouterOutcome::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupStatus {
    pub source_host_added: bool,
    pub destination_host_added: bool,
    pub service_started: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResultDoc {
    pub result: String,
    pub return_code: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReachabilityTests {
    pub ping: Option<()>,
    pub traceroute: ProbeResultDoc,
    pub service: ProbeResultDoc,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterAnalysis {
    pub router: String,
    pub analysis: AnalysisResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReachabilitySummary {
    pub service_reachable: bool,
    pub reachable_via_routers: Vec<String>,
    pub blocked_by_routers: Vec<String>,
}

/// One (port, protocol)'s result document, per spec.md §6 "Service result
/// document" (byte-for-byte field names, since this is consumed externally).
#[derive(Debug, Clone, Serialize)]
pub struct ServiceResultDocument {
    pub timestamp: String,
    pub version: &'static str,
    pub summary: ServiceSummary,
    pub setup_status: SetupStatus,
    pub reachability_tests: ReachabilityTests,
    pub packet_count_analysis: Vec<RouterAnalysis>,
    pub router_service_results: HashMap<String, String>,
    pub operational_summary: Vec<String>,
    pub total_duration_seconds: f64,
    pub reachability_summary: ReachabilitySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub source_ip: Ipv4Addr,
    pub source_port: SourcePort,
    pub destination_ip: Ipv4Addr,
    pub destination_port: u16,
    pub protocol: Protocol,
}

/// Renders as the port number, or the literal string `"ephemeral"` when
/// the job didn't pin a source port (spec.md §6: `source_port|"ephemeral"`).
#[derive(Debug, Clone, Copy)]
pub enum SourcePort {
    Ephemeral,
    Port(u16),
}

impl From<Option<u16>> for SourcePort {
    fn from(p: Option<u16>) -> Self {
        match p {
            Some(p) => SourcePort::Port(p),
            None => SourcePort::Ephemeral,
        }
    }
}

impl Serialize for SourcePort {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            SourcePort::Ephemeral => s.serialize_str("ephemeral"),
            SourcePort::Port(p) => s.serialize_u16(*p),
        }
    }
}

pub struct Tester {
    exec: Arc<dyn NamespaceExec>,
    trace: Arc<dyn TraceProvider>,
    services: Arc<dyn ServiceController>,
    probes: Arc<dyn ProbeRunner>,
    pool: Arc<HostPool>,
    config: RuntimeConfig,
    progress: Option<Arc<ProgressService>>,
}

impl Tester {
    pub fn new(
        exec: Arc<dyn NamespaceExec>,
        trace: Arc<dyn TraceProvider>,
        services: Arc<dyn ServiceController>,
        probes: Arc<dyn ProbeRunner>,
        pool: Arc<HostPool>,
        config: RuntimeConfig,
    ) -> Self {
        Tester {
            exec,
            trace,
            services,
            probes,
            pool,
            config,
            progress: None,
        }
    }

    /// Attaches a progress tracker so `run_job` emits the stable phase names
    /// external observers key off (spec.md §6 "Progress log").
    pub fn with_progress(mut self, progress: Arc<ProgressService>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn log_phase(&self, run_id: &str, phase: &str, message: &str) {
        if let Some(progress) = &self.progress {
            progress.log_phase(run_id, phase, message);
        }
    }

    /// Runs P1-P5 for one detailed job, returning one document per service.
    pub async fn run_job(
        &self,
        job: &DetailedJobSpec,
    ) -> Result<Vec<ServiceResultDocument>, TesterError> {
        let start = Instant::now();
        self.log_phase(&job.run_id, "MULTI_REACHABILITY_PHASE1_start", "path discovery");

        // P1: path discovery.
        let trace_doc = match &job.user_supplied_trace {
            Some(doc) => {
                warn!(
                    job = %job.run_id,
                    routers = ?doc.hops.iter().map(|h| h.router.clone()).collect::<Vec<_>>(),
                    "using user-supplied trace verbatim"
                );
                doc.clone()
            }
            None => self
                .trace
                .trace(job.source_ip, job.dest_ip)
                .await
                .map_err(|_| TesterError::NoPathFound {
                    src: job.source_ip.to_string(),
                    dst: job.dest_ip.to_string(),
                })?,
        };
        if trace_doc.hops.is_empty() {
            return Err(TesterError::NoPathFound {
                src: job.source_ip.to_string(),
                dst: job.dest_ip.to_string(),
            });
        }
        let routers: Vec<String> = trace_doc.hops.iter().map(|h| h.router.clone()).collect();
        info!(job = %job.run_id, ?routers, "P1 path discovery complete");
        self.log_phase(
            &job.run_id,
            "MULTI_REACHABILITY_PHASE1_complete",
            &format!("{} hops", routers.len()),
        );
        self.log_phase(&job.run_id, "MULTI_REACHABILITY_PHASE2_start", "host and service setup");

        // P2: environment setup. `prepare_batch` ensures a `source-<i>` host
        // per on-path router (spec.md §4.3's batch contract only models the
        // source side); the `destination-<i>` side is provisioned directly
        // here via `ensure_host`, keyed off the last hop since every service
        // on this job targets the same dest_ip on the destination-adjacent
        // router.
        let pool_job = PoolJobSpec {
            run_id: job.run_id.clone(),
            source_ip: job.source_ip,
            dest_ip: job.dest_ip,
            user_supplied_trace: Some(trace_doc.clone()),
        };
        let batch = self
            .pool
            .prepare_batch(vec![pool_job], |_job, _hosts| Ok(()))
            .await?;
        let source_host_added = !batch.hosts_created.is_empty();

        let last_hop_router = trace_doc.hops.last().expect("checked non-empty above").router.clone();
        let destination_host_spec = HostSpec {
            name: "destination-1".to_string(),
            role: HostRole::Destination,
            primary_ip: job.dest_ip,
            secondary_ips: Vec::new(),
            router: last_hop_router,
        };
        let destination_host_name = destination_host_spec.name.clone();
        let destination_outcome = self
            .pool
            .ensure_host(&job.run_id, destination_host_spec)
            .await?;
        let destination_host_added = destination_outcome == CreationOutcome::Created;

        let mut service_started = false;
        for svc in &job.services {
            self.services
                .start_service(&job.dest_ip.to_string(), svc.port, svc.protocol)
                .await?;
            service_started = true;
        }

        self.log_phase(&job.run_id, "MULTI_REACHABILITY_PHASE2_complete", "setup done");

        // P3: initial bounded traceroute, kept as an auxiliary artifact only.
        let traceroute_json = self
            .probes
            .traceroute(job.source_ip, job.dest_ip, self.config.subprocess_timeout())
            .await;

        // P4: sequential per-service tests. `previous_after` lets each
        // iteration reuse the prior service's `after` snapshot as its
        // `before`, halving snapshot work (spec.md §4.5 step 1).
        let mut documents = Vec::with_capacity(job.services.len());
        let mut previous_after: Option<HashMap<String, Snapshot>> = None;

        for svc in &job.services {
            let service_start = Instant::now();
            let phase_tag = format!("{}_{}", svc.port, svc.protocol);
            self.log_phase(
                &job.run_id,
                &format!("service_test_{phase_tag}_start"),
                "service test starting",
            );

            self.log_phase(
                &job.run_id,
                &format!("iptables_before_{phase_tag}_start"),
                "capturing before-snapshot",
            );
            let before = match previous_after.take() {
                Some(snapshots) => snapshots,
                None => self.capture_snapshots(&routers).await?,
            };
            self.log_phase(
                &job.run_id,
                &format!("iptables_before_{phase_tag}_complete"),
                "before-snapshot captured",
            );

            let outcome = self
                .probes
                .probe(
                    job.source_ip,
                    job.dest_ip,
                    svc.port,
                    svc.protocol,
                    SERVICE_PROBE_TIMEOUT,
                )
                .await;

            tokio::time::sleep(SETTLE_SLEEP).await;
            self.log_phase(
                &job.run_id,
                &format!("iptables_after_{phase_tag}_start"),
                "capturing after-snapshot",
            );
            let after = self.capture_snapshots(&routers).await?;
            self.log_phase(
                &job.run_id,
                &format!("iptables_after_{phase_tag}_complete"),
                "after-snapshot captured",
            );

            // Conservative classification: anything short of a clean success
            // is treated as blocking, per spec.md §4.5 step 4.
            let mode = match outcome {
                ProbeOutcome::Ok => Mode::Allowing,
                ProbeOutcome::Fail | ProbeOutcome::Timeout | ProbeOutcome::Error => Mode::Blocking,
            };

            let mut analyses = Vec::with_capacity(routers.len());
            let mut router_results = HashMap::new();
            let mut reachable_via = Vec::new();
            let mut blocked_by = Vec::new();

            for router in &routers {
                let before_snap = before.get(router).cloned().unwrap_or_default();
                let after_snap = after.get(router).cloned().unwrap_or_default();
                match analyzer::compare_packet_counts(&before_snap, &after_snap, router, mode) {
                    Ok(result) => {
                        let outcome = if result.result.status == "blocked" {
                            RouterOutcome::Blocked
                        } else {
                            RouterOutcome::Allowed
                        };
                        if outcome == RouterOutcome::Allowed {
                            reachable_via.push(router.clone());
                        } else {
                            blocked_by.push(router.clone());
                        }
                        router_results.insert(router.clone(), outcome.as_str().to_string());
                        analyses.push(RouterAnalysis {
                            router: router.clone(),
                            analysis: result,
                        });
                    }
                    Err(_) => {
                        // Missing attribution is conservatively blocking.
                        router_results
                            .insert(router.clone(), RouterOutcome::Unknown.as_str().to_string());
                        blocked_by.push(router.clone());
                    }
                }
            }

            let service_reachable = routers
                .iter()
                .all(|r| router_results.get(r).map(String::as_str) == Some("ALLOWED"));

            let doc = ServiceResultDocument {
                timestamp: chrono::Utc::now().to_rfc3339(),
                version: "1.0.0",
                summary: ServiceSummary {
                    source_ip: job.source_ip,
                    source_port: job.source_port.into(),
                    destination_ip: job.dest_ip,
                    destination_port: svc.port,
                    protocol: svc.protocol,
                },
                setup_status: SetupStatus {
                    source_host_added,
                    destination_host_added,
                    service_started,
                },
                reachability_tests: ReachabilityTests {
                    ping: None,
                    traceroute: ProbeResultDoc {
                        result: traceroute_json.to_string(),
                        return_code: 0,
                    },
                    service: ProbeResultDoc {
                        result: format!("{outcome:?}"),
                        return_code: if outcome == ProbeOutcome::Ok { 0 } else { 1 },
                    },
                },
                packet_count_analysis: analyses,
                router_service_results: router_results,
                operational_summary: vec![format!(
                    "tested {}:{}/{} — {}",
                    job.dest_ip,
                    svc.port,
                    svc.protocol,
                    if service_reachable { "reachable" } else { "blocked" }
                )],
                total_duration_seconds: service_start.elapsed().as_secs_f64(),
                reachability_summary: ReachabilitySummary {
                    service_reachable,
                    reachable_via_routers: reachable_via,
                    blocked_by_routers: blocked_by,
                },
            };
            self.log_phase(
                &job.run_id,
                &format!("service_test_{phase_tag}_complete"),
                if service_reachable { "reachable" } else { "blocked" },
            );
            documents.push(doc);

            previous_after = Some(after);
            tokio::time::sleep(INTER_SERVICE_PAUSE).await;
        }
        self.log_phase(
            &job.run_id,
            "MULTI_REACHABILITY_PHASE4_complete",
            &format!("{} services tested", documents.len()),
        );

        let mut released_hosts: Vec<String> = batch
            .allocated_hosts
            .get(&job.run_id)
            .map(|hosts| hosts.keys().cloned().collect())
            .unwrap_or_default();
        released_hosts.push(destination_host_name);
        self.pool.release(&job.run_id, released_hosts).await;

        info!(job = %job.run_id, elapsed = ?start.elapsed(), "job complete");
        self.log_phase(&job.run_id, "COMPLETE", "job finished");
        Ok(documents)
    }

    /// Captures one `iptables-save -c` snapshot per router, concurrently.
    /// Ported from `network_status/worker.py`'s `query_iptables`/
    /// `_parse_iptables_save`, extended to extract each rule's packet
    /// counter and `-j`/`-g` target (the Python version only kept `raw` per
    /// rule; the Counter-Diff Analyzer needs `packets`/`target` as well).
    async fn capture_snapshots(
        &self,
        routers: &[String],
    ) -> Result<HashMap<String, Snapshot>, TesterError> {
        let futures = routers.iter().map(|router| {
            let exec = self.exec.clone();
            let router = router.clone();
            let timeout = self.config.subprocess_timeout();
            async move {
                let out = exec
                    .run(
                        &["iptables-save", "-t", "filter", "-c"],
                        Some(&router),
                        timeout,
                    )
                    .await;
                let snapshot = match out {
                    Ok(o) if o.success() => parse_iptables_save(&o.stdout),
                    _ => Snapshot::default(),
                };
                (router, snapshot)
            }
        });
        let results = futures::future::join_all(futures).await;
        Ok(results.into_iter().collect())
    }
}

/// Parses `iptables-save -c` text into a `Snapshot`. Each chain line is
/// `:NAME POLICY [packets:bytes]`; each rule line is `[packets:bytes] -A
/// NAME ... -j TARGET` (or `-g TARGET` for a fallthrough jump).
fn parse_iptables_save(output: &str) -> Snapshot {
    let chain_re = Regex::new(r"^:(\S+)\s+(\S+)").expect("static regex");
    let counter_re = Regex::new(r"^\[(\d+):(\d+)\]\s*(.*)$").expect("static regex");
    let chain_name_re = Regex::new(r"-A (\S+)").expect("static regex");
    let target_re = Regex::new(r"-[jg]\s+(\S+)").expect("static regex");

    let mut chains: std::collections::BTreeMap<String, ChainSnapshot> =
        std::collections::BTreeMap::new();
    let mut indices: HashMap<String, u32> = HashMap::new();

    for raw_line in output.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('*') || line == "COMMIT" {
            continue;
        }
        if let Some(caps) = chain_re.captures(line) {
            let name = caps[1].to_string();
            let policy = &caps[2];
            chains.entry(name).or_insert_with(|| ChainSnapshot {
                policy: if policy == "-" {
                    None
                } else {
                    Some(policy.to_string())
                },
                rules: Vec::new(),
            });
            continue;
        }
        let Some(caps) = counter_re.captures(line) else {
            continue;
        };
        let packets: u64 = caps[1].parse().unwrap_or(0);
        let rest = caps[3].to_string();
        let Some(chain_caps) = chain_name_re.captures(&rest) else {
            continue;
        };
        let chain_name = chain_caps[1].to_string();
        let target = target_re
            .captures(&rest)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        let entry = chains.entry(chain_name.clone()).or_insert_with(|| ChainSnapshot {
            policy: None,
            rules: Vec::new(),
        });
        let idx = indices.entry(chain_name).or_insert(0);
        *idx += 1;
        entry.rules.push(RuleCounters {
            index: *idx,
            raw: rest,
            target,
            packets,
            source: None,
            destination: None,
            dport: None,
            sport: None,
        });
    }

    let mut tables = std::collections::BTreeMap::new();
    tables.insert("filter".to_string(), chains);
    Snapshot { tables }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chain_policy_and_rule_counters() {
        let text = "\
*filter
:INPUT ACCEPT [10:1000]
:FORWARD DROP [0:0]
:CUSTOM_CHAIN - [0:0]
[5:300] -A FORWARD -s 10.0.0.0/24 -j CUSTOM_CHAIN
[2:120] -A CUSTOM_CHAIN -p tcp --dport 80 -j ACCEPT
COMMIT
";
        let snapshot = parse_iptables_save(text);
        let filter = &snapshot.tables["filter"];
        assert_eq!(filter["FORWARD"].policy.as_deref(), Some("DROP"));
        assert_eq!(filter["CUSTOM_CHAIN"].policy, None);
        assert_eq!(filter["FORWARD"].rules[0].target, "CUSTOM_CHAIN");
        assert_eq!(filter["FORWARD"].rules[0].packets, 5);
        assert_eq!(filter["CUSTOM_CHAIN"].rules[0].target, "ACCEPT");
        assert_eq!(filter["CUSTOM_CHAIN"].rules[0].packets, 2);
    }

    #[tokio::test]
    async fn run_job_fails_with_no_path_when_trace_has_no_hops() {
        use crate::fabric::nsexec::FakeExec;
        use crate::traits::fakes::{FakeProbeRunner, FakeServiceController, FakeTraceProvider};

        let exec = Arc::new(FakeExec::new());
        let trace = Arc::new(FakeTraceProvider::new());
        let src: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let dst: Ipv4Addr = "10.0.0.2".parse().unwrap();
        trace.script(
            src,
            dst,
            TraceDoc {
                source_ip: src,
                dest_ip: dst,
                hops: vec![],
            },
        );
        let config = RuntimeConfig::default();
        let pool = HostPool::new(exec.clone(), trace.clone(), config.clone(), Arc::new(|| false));
        let tester = Tester::new(
            exec,
            trace,
            Arc::new(FakeServiceController),
            Arc::new(FakeProbeRunner::new()),
            pool,
            config,
        );
        let job = DetailedJobSpec {
            run_id: "job1".to_string(),
            source_ip: src,
            source_port: None,
            dest_ip: dst,
            services: vec![ServiceSpec {
                port: 80,
                protocol: Protocol::Tcp,
            }],
            user_supplied_trace: None,
            creator_tag: None,
        };
        let err = tester.run_job(&job).await.unwrap_err();
        assert!(matches!(err, TesterError::NoPathFound { .. }));
    }
}
