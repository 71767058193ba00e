// Drives `Engine::submit_detailed_job` through its full path — scheduler
// admission (C6), host pool (C3), multi-service tester (C5), progress/timing
// (C7) — against `FakeExec` and the out-of-scope collaborator fakes, the way
// a caller of the library (not just the CLI binary) would use it.

use std::net::Ipv4Addr;
use std::sync::Arc;

use netreach_sim::config::RuntimeConfig;
use netreach_sim::fabric::nsexec::{FakeExec, NamespaceExec};
use netreach_sim::tester::{DetailedJobSpec, ServiceSpec};
use netreach_sim::traits::fakes::{FakeProbeRunner, FakeServiceController, FakeTraceProvider};
use netreach_sim::traits::{ProbeOutcome, ProbeRunner, Protocol, ServiceController, TraceDoc, TraceHop, TraceProvider};
use netreach_sim::Engine;

fn engine_with_probe_outcome(outcome: ProbeOutcome) -> Engine {
    let config = RuntimeConfig::default();
    let exec: Arc<dyn NamespaceExec> = Arc::new(FakeExec::new());
    let trace: Arc<dyn TraceProvider> = Arc::new(FakeTraceProvider::new());
    let services: Arc<dyn ServiceController> = Arc::new(FakeServiceController);
    let probes = FakeProbeRunner::new();
    probes.script(443, Protocol::Tcp, outcome);
    let probes: Arc<dyn ProbeRunner> = Arc::new(probes);
    Engine::new(config, exec, trace, services, probes)
}

fn job(run_id: &str, src: Ipv4Addr, dst: Ipv4Addr) -> DetailedJobSpec {
    DetailedJobSpec {
        run_id: run_id.to_string(),
        source_ip: src,
        source_port: None,
        dest_ip: dst,
        services: vec![ServiceSpec {
            port: 443,
            protocol: Protocol::Tcp,
        }],
        user_supplied_trace: Some(TraceDoc {
            source_ip: src,
            dest_ip: dst,
            hops: vec![TraceHop {
                router: "r1".to_string(),
                incoming_interface: None,
                outgoing_interface: None,
            }],
        }),
        creator_tag: Some("integration-test".to_string()),
    }
}

#[tokio::test]
async fn submit_detailed_job_records_progress_and_returns_one_document_per_service() {
    let engine = engine_with_probe_outcome(ProbeOutcome::Ok);
    let src = Ipv4Addr::new(10, 0, 0, 1);
    let dst = Ipv4Addr::new(10, 0, 0, 2);

    let docs = engine
        .submit_detailed_job(job("run-ok", src, dst))
        .await
        .expect("job should succeed against fakes");
    assert_eq!(docs.len(), 1);

    let entries = engine.progress.read_progress("run-ok").unwrap();
    let phases: Vec<&str> = entries.iter().map(|e| e.phase.as_str()).collect();
    assert!(phases.contains(&"START"));
    assert!(phases.contains(&"COMPLETE"));
}

#[tokio::test]
async fn two_detailed_jobs_submitted_back_to_back_both_complete() {
    let engine = engine_with_probe_outcome(ProbeOutcome::Fail);
    let src = Ipv4Addr::new(10, 0, 1, 1);
    let dst = Ipv4Addr::new(10, 0, 1, 2);

    let first = engine.submit_detailed_job(job("run-a", src, dst)).await;
    let second = engine.submit_detailed_job(job("run-b", src, dst)).await;

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert!(!engine.scheduler.has_running_detailed());
}

#[tokio::test]
async fn build_fabric_is_idempotent_against_an_empty_facts_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = RuntimeConfig::default();
    config.raw_facts_dir = tmp.path().to_string_lossy().to_string();
    let exec: Arc<dyn NamespaceExec> = Arc::new(FakeExec::new());
    let trace: Arc<dyn TraceProvider> = Arc::new(FakeTraceProvider::new());
    let services: Arc<dyn ServiceController> = Arc::new(FakeServiceController);
    let probes: Arc<dyn ProbeRunner> = Arc::new(FakeProbeRunner::new());
    let engine = Engine::new(config, exec, trace, services, probes);

    let (fabric, state) = engine.build_fabric().await.unwrap();
    assert_eq!(fabric.router_count(), 0);
    assert!(state.created_namespaces.is_empty() || state.created_namespaces.len() == 1);
}
