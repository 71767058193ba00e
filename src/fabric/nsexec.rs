// src/fabric/nsexec.rs
//
// The one seam between this crate and the real Linux kernel: every `ip`,
// `tc`, `iptables-restore`, and `ipset restore` invocation goes through
// `NamespaceExec`, so the setup/teardown algorithm in `fabric::builder` can
// be driven in tests without a namespace-capable kernel. Grounded on the
// `tokio::process::Command` shell-out pattern in
// `examples/other_examples/8f3b5dd6_RephlexZero-rist-bonding__crates-netns-testbench-src-bench.rs.rs`
// (`apply_profile_to_iface`, `ip netns exec ... tc ...`), per spec.md §9's
// design note that namespace manipulation should sit behind a narrow trait.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ExecError;

/// The outcome of one command invocation.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Abstracts "run this command, optionally inside a network namespace".
/// Implementations: `SystemExec` for production, `FakeExec` for tests.
#[async_trait]
pub trait NamespaceExec: Send + Sync {
    async fn run(
        &self,
        argv: &[&str],
        namespace: Option<&str>,
        timeout_dur: Duration,
    ) -> Result<ExecOutput, ExecError>;

    async fn run_stdin(
        &self,
        argv: &[&str],
        namespace: Option<&str>,
        stdin: &str,
        timeout_dur: Duration,
    ) -> Result<ExecOutput, ExecError>;
}

/// Shells out to the real `ip netns exec` wrapper via `tokio::process::Command`.
pub struct SystemExec;

#[async_trait]
impl NamespaceExec for SystemExec {
    async fn run(
        &self,
        argv: &[&str],
        namespace: Option<&str>,
        timeout_dur: Duration,
    ) -> Result<ExecOutput, ExecError> {
        let mut cmd = build_command(argv, namespace);
        debug!(?argv, ?namespace, "running command");
        run_command(&mut cmd, argv, timeout_dur).await
    }

    async fn run_stdin(
        &self,
        argv: &[&str],
        namespace: Option<&str>,
        stdin: &str,
        timeout_dur: Duration,
    ) -> Result<ExecOutput, ExecError> {
        use tokio::io::AsyncWriteExt;

        let mut cmd = build_command(argv, namespace);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let full_cmd: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let mut child = cmd.spawn().map_err(|e| ExecError::Spawn {
            cmd: full_cmd.clone(),
            source: e,
        })?;

        if let Some(mut child_stdin) = child.stdin.take() {
            let _ = child_stdin.write_all(stdin.as_bytes()).await;
        }

        let fut = child.wait_with_output();
        match timeout(timeout_dur, fut).await {
            Ok(Ok(output)) => Ok(to_exec_output(output)),
            Ok(Err(e)) => Err(ExecError::Spawn {
                cmd: full_cmd,
                source: e,
            }),
            Err(_) => Err(ExecError::Timeout {
                cmd: full_cmd,
                timeout_secs: timeout_dur.as_secs(),
            }),
        }
    }
}

fn build_command(argv: &[&str], namespace: Option<&str>) -> Command {
    match namespace {
        Some(ns) => {
            let mut cmd = Command::new("ip");
            cmd.arg("netns").arg("exec").arg(ns);
            cmd.args(argv);
            cmd
        }
        None => {
            let mut cmd = Command::new(argv[0]);
            cmd.args(&argv[1..]);
            cmd
        }
    }
}

async fn run_command(
    cmd: &mut Command,
    argv: &[&str],
    timeout_dur: Duration,
) -> Result<ExecOutput, ExecError> {
    let full_cmd: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    let fut = cmd.output();
    match timeout(timeout_dur, fut).await {
        Ok(Ok(output)) => Ok(to_exec_output(output)),
        Ok(Err(e)) => Err(ExecError::Spawn {
            cmd: full_cmd,
            source: e,
        }),
        Err(_) => {
            warn!(?argv, "command timed out");
            Err(ExecError::Timeout {
                cmd: full_cmd,
                timeout_secs: timeout_dur.as_secs(),
            })
        }
    }
}

fn to_exec_output(output: std::process::Output) -> ExecOutput {
    ExecOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

/// An in-memory fake for unit/integration tests: records every invocation and
/// returns a scripted response (default: success, empty output) unless a
/// specific argv prefix has been told to fail.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub argv: Vec<String>,
        pub namespace: Option<String>,
        pub stdin: Option<String>,
    }

    pub struct FakeExec {
        pub calls: Mutex<Vec<RecordedCall>>,
        pub failing_prefixes: Mutex<Vec<(Vec<String>, ExecError)>>,
    }

    impl FakeExec {
        pub fn new() -> Self {
            FakeExec {
                calls: Mutex::new(Vec::new()),
                failing_prefixes: Mutex::new(Vec::new()),
            }
        }

        pub fn fail_when_prefixed_with(&self, prefix: &[&str], err: ExecError) {
            self.failing_prefixes.lock().unwrap().push((
                prefix.iter().map(|s| s.to_string()).collect(),
                err,
            ));
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        fn matches_failure(&self, argv: &[&str]) -> Option<ExecError> {
            let failing = self.failing_prefixes.lock().unwrap();
            for (prefix, _) in failing.iter() {
                if argv.len() >= prefix.len() && argv[..prefix.len()] == prefix[..] {
                    return Some(ExecError::NonZeroExit {
                        cmd: argv.iter().map(|s| s.to_string()).collect(),
                        ns: None,
                        status: 1,
                        stderr: "fake failure".to_string(),
                    });
                }
            }
            None
        }

        fn record(&self, argv: &[&str], namespace: Option<&str>, stdin: Option<&str>) {
            self.calls.lock().unwrap().push(RecordedCall {
                argv: argv.iter().map(|s| s.to_string()).collect(),
                namespace: namespace.map(|s| s.to_string()),
                stdin: stdin.map(|s| s.to_string()),
            });
        }
    }

    impl Default for FakeExec {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl NamespaceExec for FakeExec {
        async fn run(
            &self,
            argv: &[&str],
            namespace: Option<&str>,
            _timeout_dur: Duration,
        ) -> Result<ExecOutput, ExecError> {
            self.record(argv, namespace, None);
            if let Some(err) = self.matches_failure(argv) {
                return Err(err);
            }
            Ok(ExecOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn run_stdin(
            &self,
            argv: &[&str],
            namespace: Option<&str>,
            stdin: &str,
            _timeout_dur: Duration,
        ) -> Result<ExecOutput, ExecError> {
            self.record(argv, namespace, Some(stdin));
            if let Some(err) = self.matches_failure(argv) {
                return Err(err);
            }
            Ok(ExecOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeExec;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_exec_records_calls_and_scripted_failures() {
        let fake = FakeExec::new();
        fake.fail_when_prefixed_with(
            &["ip", "link", "add", "bad"],
            ExecError::NonZeroExit {
                cmd: vec![],
                ns: None,
                status: 1,
                stderr: String::new(),
            },
        );
        let ok = fake.run(&["ip", "link", "show"], None, Duration::from_secs(1)).await;
        assert!(ok.is_ok());
        let failed = fake
            .run(&["ip", "link", "add", "bad", "0"], None, Duration::from_secs(1))
            .await;
        assert!(failed.is_err());
        assert_eq!(fake.calls().len(), 2);
    }
}
