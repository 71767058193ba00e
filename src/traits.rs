// src/traits.rs
//
// Seams to out-of-scope external collaborators (spec.md §1/§6): the trace
// facility, service lifecycle, and live packet probing. Modeled as narrow
// async traits the same way `fabric::nsexec::NamespaceExec` models the
// kernel seam, so `tester`/`pool` can be driven by fakes in tests.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One hop on a discovered path: the router it traverses and the interface
/// it arrives/leaves on, enough to drive Host Pool's `source-<n>` slotting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceHop {
    pub router: String,
    pub incoming_interface: Option<String>,
    pub outgoing_interface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceDoc {
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub hops: Vec<TraceHop>,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace execution failed: {0}")]
    Failed(String),
    #[error("trace timed out after {0:?}")]
    Timeout(Duration),
}

/// Produces a path from source to destination. In production this shells out
/// to the external trace facility (spec.md §1 names it explicitly
/// out-of-scope); `user_supplied_trace` callers bypass this entirely.
#[async_trait]
pub trait TraceProvider: Send + Sync {
    async fn trace(&self, source_ip: Ipv4Addr, dest_ip: Ipv4Addr) -> Result<TraceDoc, TraceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to start service on {host}:{port}/{proto}: {reason}")]
    StartFailed {
        host: String,
        port: u16,
        proto: Protocol,
        reason: String,
    },
}

/// Starts (or confirms already-running) a service on a pool host. Out of
/// scope per spec.md §1; abstracted so P2 can be tested without a live host.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn start_service(&self, host: &str, port: u16, proto: Protocol) -> Result<(), ProbeError>;
    async fn is_running(&self, host: &str, port: u16, proto: Protocol) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Ok,
    Fail,
    Timeout,
    Error,
}

/// Issues one live packet probe (traceroute or service probe) and returns
/// the coarse outcome P4 classifies into blocking/allowing per router.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn probe(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        port: u16,
        proto: Protocol,
        timeout: Duration,
    ) -> ProbeOutcome;

    async fn traceroute(&self, src: Ipv4Addr, dst: Ipv4Addr, timeout: Duration) -> serde_json::Value;
}

/// `TraceProvider` for a process with no external trace facility wired in
/// (spec.md §1 names it out of scope). Every call fails with a clear
/// message; callers that always pass `user_supplied_trace` never reach it.
pub struct UnavailableTraceProvider;

#[async_trait]
impl TraceProvider for UnavailableTraceProvider {
    async fn trace(&self, _source_ip: Ipv4Addr, _dest_ip: Ipv4Addr) -> Result<TraceDoc, TraceError> {
        Err(TraceError::Failed(
            "no trace facility configured; supply --trace-file".to_string(),
        ))
    }
}

/// `ServiceController` for a process with no live service-lifecycle
/// collaborator wired in. Reports services as already running rather than
/// failing outright, since most reachability probes target services the
/// operator started independently of this tool.
pub struct UnavailableServiceController;

#[async_trait]
impl ServiceController for UnavailableServiceController {
    async fn start_service(&self, _host: &str, _port: u16, _proto: Protocol) -> Result<(), ProbeError> {
        Ok(())
    }
    async fn is_running(&self, _host: &str, _port: u16, _proto: Protocol) -> bool {
        true
    }
}

/// `ProbeRunner` for a process with no live probing collaborator wired in.
/// Every probe reports `Error` so counter-diff attribution still runs (in
/// blocking mode) rather than silently reporting false reachability.
pub struct UnavailableProbeRunner;

#[async_trait]
impl ProbeRunner for UnavailableProbeRunner {
    async fn probe(
        &self,
        _src: Ipv4Addr,
        _dst: Ipv4Addr,
        _port: u16,
        _proto: Protocol,
        _timeout: Duration,
    ) -> ProbeOutcome {
        ProbeOutcome::Error
    }

    async fn traceroute(&self, _src: Ipv4Addr, _dst: Ipv4Addr, _timeout: Duration) -> serde_json::Value {
        serde_json::json!({"hops": [], "note": "no probe facility configured"})
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeTraceProvider {
        pub scripted: Mutex<std::collections::HashMap<(Ipv4Addr, Ipv4Addr), TraceDoc>>,
    }

    impl FakeTraceProvider {
        pub fn new() -> Self {
            FakeTraceProvider {
                scripted: Mutex::new(std::collections::HashMap::new()),
            }
        }

        pub fn script(&self, src: Ipv4Addr, dst: Ipv4Addr, doc: TraceDoc) {
            self.scripted.lock().unwrap().insert((src, dst), doc);
        }
    }

    impl Default for FakeTraceProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl TraceProvider for FakeTraceProvider {
        async fn trace(&self, source_ip: Ipv4Addr, dest_ip: Ipv4Addr) -> Result<TraceDoc, TraceError> {
            self.scripted
                .lock()
                .unwrap()
                .get(&(source_ip, dest_ip))
                .cloned()
                .ok_or_else(|| TraceError::Failed("no scripted trace".to_string()))
        }
    }

    pub struct FakeServiceController;

    #[async_trait]
    impl ServiceController for FakeServiceController {
        async fn start_service(&self, _host: &str, _port: u16, _proto: Protocol) -> Result<(), ProbeError> {
            Ok(())
        }
        async fn is_running(&self, _host: &str, _port: u16, _proto: Protocol) -> bool {
            false
        }
    }

    pub struct FakeProbeRunner {
        pub scripted: Mutex<std::collections::HashMap<(u16, Protocol), ProbeOutcome>>,
    }

    impl FakeProbeRunner {
        pub fn new() -> Self {
            FakeProbeRunner {
                scripted: Mutex::new(std::collections::HashMap::new()),
            }
        }

        pub fn script(&self, port: u16, proto: Protocol, outcome: ProbeOutcome) {
            self.scripted.lock().unwrap().insert((port, proto), outcome);
        }
    }

    impl Default for FakeProbeRunner {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProbeRunner for FakeProbeRunner {
        async fn probe(
            &self,
            _src: Ipv4Addr,
            _dst: Ipv4Addr,
            port: u16,
            proto: Protocol,
            _timeout: Duration,
        ) -> ProbeOutcome {
            self.scripted
                .lock()
                .unwrap()
                .get(&(port, proto))
                .copied()
                .unwrap_or(ProbeOutcome::Fail)
        }

        async fn traceroute(&self, _src: Ipv4Addr, _dst: Ipv4Addr, _timeout: Duration) -> serde_json::Value {
            serde_json::json!({"hops": []})
        }
    }
}
