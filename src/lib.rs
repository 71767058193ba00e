// src/lib.rs
//
// Wires the eight components together: C1 facts loading, C2 fabric
// building, C3 host pool, C4 counter-diff analyzer (used internally by
// C5), C5 multi-service tester, C6 hybrid scheduler, C7 progress/timing,
// C8 registries. `Engine` is the single object `main.rs` constructs and
// drives; tests construct one against `fabric::nsexec::fake::FakeExec` and
// `traits::fakes` instead of the system implementations.

pub mod analyzer;
pub mod config;
pub mod error;
pub mod fabric;
pub mod facts;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod tester;
pub mod topology;
pub mod traits;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, SchedulerError};
use crate::fabric::builder::{BuildState, FabricBuilder};
use crate::fabric::model::Fabric;
use crate::fabric::nsexec::NamespaceExec;
use crate::facts::RouterFacts;
use crate::pool::HostPool;
use crate::progress::ProgressService;
use crate::registry::Registries;
use crate::scheduler::{Admission, JobSpec as ScheduledJob, Scheduler};
use crate::tester::{DetailedJobSpec, ServiceResultDocument, Tester};
use crate::traits::{ProbeRunner, ServiceController, TraceProvider};

/// Everything needed to drive jobs end-to-end: the namespace/kernel seam,
/// the out-of-scope collaborator seams (spec.md §1/§6), and the stateful
/// services built on top of them. One `Engine` is constructed per process;
/// its `scheduler` and `pool` are long-lived actors/state shared across
/// every job submitted through it.
pub struct Engine {
    pub config: RuntimeConfig,
    pub exec: Arc<dyn NamespaceExec>,
    pub trace: Arc<dyn TraceProvider>,
    pub services: Arc<dyn ServiceController>,
    pub probes: Arc<dyn ProbeRunner>,
    pub pool: Arc<HostPool>,
    pub scheduler: Scheduler,
    pub progress: Arc<ProgressService>,
    pub registries: Arc<Registries>,
}

impl Engine {
    pub fn new(
        config: RuntimeConfig,
        exec: Arc<dyn NamespaceExec>,
        trace: Arc<dyn TraceProvider>,
        services: Arc<dyn ServiceController>,
        probes: Arc<dyn ProbeRunner>,
    ) -> Self {
        let scheduler = Scheduler::new(config.queue_capacity);
        let pool = HostPool::new(
            exec.clone(),
            trace.clone(),
            config.clone(),
            scheduler.has_running_detailed_jobs_fn(),
        );
        let progress = Arc::new(ProgressService::new(&config.run_dir));
        let registry_dir: PathBuf = Path::new(&config.run_dir).join("registry");
        let registries = Arc::new(Registries::open(&registry_dir));

        Engine {
            config,
            exec,
            trace,
            services,
            probes,
            pool,
            scheduler,
            progress,
            registries,
        }
    }

    /// Loads every `<router>_facts.txt` in `raw_facts_dir` (C1) and builds
    /// the hidden-mesh fabric from them (C2).
    pub async fn build_fabric(&self) -> Result<(Fabric, BuildState), Error> {
        let facts_dir = Path::new(&self.config.raw_facts_dir);
        let facts_by_router = facts::load_directory(facts_dir)?;
        let routers: BTreeMap<String, RouterFacts> = facts_by_router.into_iter().collect();

        for (name, facts) in &routers {
            let declared_interfaces = crate::topology::interface::extract_interfaces(facts)
                .map(|ifaces| ifaces.into_iter().map(|i| i.name).collect())
                .unwrap_or_default();
            self.registries.routers.upsert(
                name,
                crate::registry::RouterMetadata {
                    router_type: None,
                    role: None,
                    declared_interfaces,
                },
            )?;
        }

        let builder = FabricBuilder::new(self.exec.clone(), &self.config);
        let (fabric, state) = builder.setup(&routers).await?;
        info!(routers = routers.len(), "fabric built");
        Ok((fabric, state))
    }

    /// Submits one detailed job (quick jobs are not yet a first-class entry
    /// point in this driver — see DESIGN.md), waits for the scheduler's
    /// admission, drives it through the tester end to end, and records
    /// progress/timing for the run.
    pub async fn submit_detailed_job(
        &self,
        job: DetailedJobSpec,
    ) -> Result<Vec<ServiceResultDocument>, Error> {
        let run_id = job.run_id.clone();
        self.progress.start_timer(&run_id);
        self.progress.log_phase(&run_id, "START", "job submitted");

        let admit_rx = self
            .scheduler
            .submit(ScheduledJob::detailed(job))
            .await
            .map_err(Error::Scheduler)?;
        let admission = admit_rx
            .await
            .map_err(|_| Error::Scheduler(SchedulerError::UnknownJob(run_id.clone())))?
            .map_err(Error::Scheduler)?;
        let Admission::Detailed(scheduled) = admission else {
            warn!(run_id = %run_id, "detailed submission was admitted as a quick batch; ignoring");
            return Err(Error::Scheduler(SchedulerError::UnknownJob(run_id)));
        };
        self.progress.checkpoint(&run_id, "ADMITTED", None);

        let tester = Tester::new(
            self.exec.clone(),
            self.trace.clone(),
            self.services.clone(),
            self.probes.clone(),
            self.pool.clone(),
            self.config.clone(),
        )
        .with_progress(self.progress.clone());

        let result = tester.run_job(&scheduled.job).await;
        self.scheduler.job_finished(&run_id).await;

        if let Err(e) = &result {
            self.progress.log_phase(&run_id, "ERROR", &e.to_string());
        }
        self.progress.end_timer(&run_id)?;

        result.map_err(Error::Tester)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::nsexec::fake::FakeExec;
    use crate::traits::fakes::{FakeProbeRunner, FakeServiceController, FakeTraceProvider};
    use crate::traits::{ProbeOutcome, Protocol, TraceDoc, TraceHop};
    use std::net::Ipv4Addr;

    fn test_engine() -> Engine {
        let config = RuntimeConfig::default();
        let exec: Arc<dyn NamespaceExec> = Arc::new(FakeExec::new());
        let trace: Arc<dyn TraceProvider> = Arc::new(FakeTraceProvider::new());
        let services: Arc<dyn ServiceController> = Arc::new(FakeServiceController);
        let probes: Arc<dyn ProbeRunner> = Arc::new(FakeProbeRunner::new());
        Engine::new(config, exec, trace, services, probes)
    }

    #[tokio::test]
    async fn submit_detailed_job_runs_through_scheduler_and_tester() {
        let engine = test_engine();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);

        // `user_supplied_trace` bypasses `TraceProvider` entirely, so the
        // unscripted `FakeTraceProvider` from `test_engine` is never called.
        let job = DetailedJobSpec {
            run_id: "run-1".to_string(),
            source_ip: src,
            source_port: None,
            dest_ip: dst,
            services: vec![crate::tester::ServiceSpec {
                port: 80,
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
            creator_tag: None,
        };

        let result = engine.submit_detailed_job(job).await;
        assert!(result.is_ok());
        let docs = result.unwrap();
        assert_eq!(docs.len(), 1);

        let progress = engine.progress.read_progress("run-1").unwrap();
        assert!(progress.iter().any(|e| e.phase == "START"));
        assert!(progress.iter().any(|e| e.phase == "COMPLETE"));
    }
}
