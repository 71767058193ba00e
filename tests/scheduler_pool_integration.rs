// Drives the Hybrid Scheduler (C6) and Host Pool (C3) together, against
// `FakeExec`/`FakeTraceProvider`, the way `Engine` wires them but without
// going through the tester — this is the admission+pooling half of the
// pipeline in isolation. Covers spec.md §8 Scenario D (parallel quick jobs
// sharing a router) and Scenario E (a detailed job preempting a pending
// cleanup).

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use netreach_sim::config::RuntimeConfig;
use netreach_sim::fabric::nsexec::{FakeExec, NamespaceExec};
use netreach_sim::pool::{HostPool, JobSpec as PoolJobSpec};
use netreach_sim::scheduler::{Admission, JobMode, JobSpec as ScheduledJob, Scheduler};
use netreach_sim::tester::{DetailedJobSpec, ServiceSpec};
use netreach_sim::traits::fakes::FakeTraceProvider;
use netreach_sim::traits::{Protocol, TraceDoc, TraceHop, TraceProvider};

fn short_grace_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.quick_job_host_cleanup_grace_period = 1;
    config.cleanup_recheck_interval_secs = 1;
    config
}

fn detailed_job_spec(run_id: &str, src: Ipv4Addr, dst: Ipv4Addr) -> DetailedJobSpec {
    DetailedJobSpec {
        run_id: run_id.to_string(),
        source_ip: src,
        source_port: None,
        dest_ip: dst,
        services: vec![ServiceSpec {
            port: 80,
            protocol: Protocol::Tcp,
        }],
        user_supplied_trace: None,
        creator_tag: Some("integration-test".to_string()),
    }
}

fn single_hop_trace(src: Ipv4Addr, dst: Ipv4Addr, router: &str) -> TraceDoc {
    TraceDoc {
        source_ip: src,
        dest_ip: dst,
        hops: vec![TraceHop {
            router: router.to_string(),
            incoming_interface: None,
            outgoing_interface: None,
        }],
    }
}

/// Scenario D: three quick jobs whose traces all land on `hq-core` share one
/// `source-1` host. The pool creates it exactly once; releasing two of the
/// three jobs leaves it alive, and releasing the third schedules its
/// cleanup, which (within grace) removes it exactly once.
#[tokio::test]
async fn parallel_quick_jobs_sharing_a_router_share_one_host_and_clean_up_once() {
    let exec: Arc<dyn NamespaceExec> = Arc::new(FakeExec::new());
    let trace = Arc::new(FakeTraceProvider::new());
    let src = Ipv4Addr::new(10, 5, 0, 1);
    let dst = Ipv4Addr::new(10, 5, 0, 2);
    trace.script(src, dst, single_hop_trace(src, dst, "hq-core"));

    let config = short_grace_config();
    let scheduler = Scheduler::new(10);
    let pool = HostPool::new(
        exec,
        trace.clone() as Arc<dyn TraceProvider>,
        config,
        scheduler.has_running_detailed_jobs_fn(),
    );

    let jobs: Vec<DetailedJobSpec> = (1..=3)
        .map(|i| detailed_job_spec(&format!("q{i}"), src, dst))
        .collect();

    let mut admit_rxs = Vec::new();
    for job in &jobs {
        let rx = scheduler
            .submit(ScheduledJob::quick(job.clone()))
            .await
            .expect("submit should succeed");
        admit_rxs.push(rx);
    }

    // All three admit together as one contiguous-prefix batch (no detailed
    // job ever entered the queue).
    let mut batch: Option<Vec<ScheduledJob>> = None;
    for rx in admit_rxs {
        let admission = rx.await.unwrap().unwrap();
        match admission {
            Admission::Quick(jobs) => {
                assert_eq!(jobs.len(), 3);
                batch = Some(jobs);
            }
            Admission::Detailed(_) => panic!("quick submission must not admit as detailed"),
        }
    }
    let batch = batch.unwrap();
    assert!(batch.iter().all(|j| j.mode == JobMode::Quick));

    let pool_jobs: Vec<PoolJobSpec> = batch
        .iter()
        .map(|j| PoolJobSpec {
            run_id: j.job.run_id.clone(),
            source_ip: j.job.source_ip,
            dest_ip: j.job.dest_ip,
            user_supplied_trace: j.job.user_supplied_trace.clone(),
        })
        .collect();

    let result = pool
        .prepare_batch(pool_jobs, |_job, _hosts| Ok(()))
        .await
        .expect("batch preparation should succeed");

    // The host is created exactly once across all three jobs.
    assert_eq!(result.hosts_created, vec!["source-1".to_string()]);
    assert_eq!(result.jobs_launched.len(), 3);
    let status = pool.status().await;
    assert_eq!(status.active_hosts, vec!["source-1".to_string()]);
    assert!(status.pending_cleanup.is_empty());

    // Releasing two of the three jobs leaves the host alive (still referenced).
    pool.release("q1", vec!["source-1".to_string()]).await;
    pool.release("q2", vec!["source-1".to_string()]).await;
    let status = pool.status().await;
    assert_eq!(status.active_hosts, vec!["source-1".to_string()]);
    assert!(status.pending_cleanup.is_empty());

    // Releasing the third drops the refcount to zero: cleanup is scheduled.
    pool.release("q3", vec!["source-1".to_string()]).await;
    let status = pool.status().await;
    assert_eq!(status.pending_cleanup.len(), 1);

    for job in &jobs {
        scheduler.job_finished(&job.run_id).await;
    }

    // Within grace + one recheck tick, the host is removed exactly once.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let status = pool.status().await;
    assert!(status.active_hosts.is_empty());
    assert!(status.pending_cleanup.is_empty());
}

/// Scenario E: a detailed job running while a quick job's host reaches
/// refcount zero pauses that host's cleanup instead of expiring it; only
/// once the detailed job finishes (and nothing re-references the host) does
/// a fresh grace period begin.
#[tokio::test]
async fn detailed_job_pauses_pending_cleanup_until_it_completes() {
    let exec: Arc<dyn NamespaceExec> = Arc::new(FakeExec::new());
    let trace = Arc::new(FakeTraceProvider::new());
    let src = Ipv4Addr::new(10, 6, 0, 1);
    let dst = Ipv4Addr::new(10, 6, 0, 2);
    trace.script(src, dst, single_hop_trace(src, dst, "hq-core"));

    let config = short_grace_config();
    let scheduler = Scheduler::new(10);
    let pool = HostPool::new(
        exec,
        trace.clone() as Arc<dyn TraceProvider>,
        config,
        scheduler.has_running_detailed_jobs_fn(),
    );

    // Admit and run a quick job to completion, then release its host.
    let quick_job = detailed_job_spec("q1", src, dst);
    let quick_rx = scheduler
        .submit(ScheduledJob::quick(quick_job.clone()))
        .await
        .unwrap();
    let admission = quick_rx.await.unwrap().unwrap();
    assert!(matches!(admission, Admission::Quick(_)));

    let pool_job = PoolJobSpec {
        run_id: quick_job.run_id.clone(),
        source_ip: quick_job.source_ip,
        dest_ip: quick_job.dest_ip,
        user_supplied_trace: quick_job.user_supplied_trace.clone(),
    };
    pool.prepare_batch(vec![pool_job], |_j, _h| Ok(()))
        .await
        .unwrap();
    scheduler.job_finished("q1").await;

    // Before the quick job's host is released, admit a detailed job so
    // `has_running_detailed` flips true ahead of the release below.
    let detailed_job = detailed_job_spec("d1", src, dst);
    let detailed_rx = scheduler
        .submit(ScheduledJob::detailed(detailed_job))
        .await
        .unwrap();
    let detailed_admission = detailed_rx.await.unwrap().unwrap();
    assert!(matches!(detailed_admission, Admission::Detailed(_)));
    assert!(scheduler.has_running_detailed());

    pool.release("q1", vec!["source-1".to_string()]).await;
    let status = pool.status().await;
    assert_eq!(status.paused_for_detailed, vec!["source-1".to_string()]);
    assert!(status.pending_cleanup.is_empty());

    // Even after a recheck tick elapses, a paused host stays paused while
    // the detailed job is still running.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = pool.status().await;
    assert_eq!(status.paused_for_detailed, vec!["source-1".to_string()]);

    // Once the detailed job finishes, the next recheck starts a fresh grace
    // period, and the host is eventually removed.
    scheduler.job_finished("d1").await;
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let status = pool.status().await;
    assert!(status.active_hosts.is_empty());
}
