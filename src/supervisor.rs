//! Launches a provisioned sandbox and drives it to a single outcome.

use std::future::pending;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::types::SupervisorConfig;
use crate::sandbox::Sandbox;
use crate::stream::StreamKind;

/// After the program exits, stray writers get this long to close the pipes.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages from the registry to a running execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Cancel,
}

/// Receives what the supervisor observes, in order.
pub trait OutputSink: Send + Sync {
    fn started(&self, pid: u32);

    /// Forward a decoded chunk. Returning `false` stops the program
    /// (output budget exhausted).
    fn output(&self, stream: StreamKind, text: String) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The program exited on its own; signal deaths are `128 + signo`.
    Exited { code: i32 },
    TimedOut,
    Cancelled,
    OutputLimit,
    MemoryLimit,
    LaunchFailed(String),
}

pub struct Supervisor {
    read_chunk: usize,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            read_chunk: config.read_chunk_bytes.max(64),
        }
    }

    /// Spawn the sandbox's program and supervise it until it ends.
    ///
    /// Whichever of exit, deadline, cancellation, or output overflow is
    /// observed first decides the outcome; the deadline is checked first.
    pub async fn run(
        &self,
        sandbox: &Sandbox,
        timeout: Duration,
        control: &mut mpsc::Receiver<Control>,
        sink: &dyn OutputSink,
    ) -> SupervisorOutcome {
        let id = sandbox.execution_id();

        if let Ok(Control::Cancel) = control.try_recv() {
            debug!(execution_id = %id, "Cancelled before launch");
            return SupervisorOutcome::Cancelled;
        }

        let launch = sandbox.launch();
        let mut child = match launch.command().and_then(|mut cmd| cmd.spawn()) {
            Ok(child) => child,
            Err(e) => {
                warn!(execution_id = %id, program = %launch.program.display(), error = %e, "Failed to spawn");
                return SupervisorOutcome::LaunchFailed(format!(
                    "{}: {}",
                    launch.program.display(),
                    e
                ));
            }
        };

        let Some(pid) = child.id() else {
            return SupervisorOutcome::LaunchFailed("process exited before it was tracked".into());
        };
        debug!(execution_id = %id, pid, "Process started");
        sink.started(pid);

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_buf = vec![0u8; self.read_chunk];
        let mut err_buf = vec![0u8; self.read_chunk];
        let mut out_dec = Utf8Decoder::default();
        let mut err_dec = Utf8Decoder::default();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut status: Option<ExitStatus> = None;
        let mut control_open = true;

        let forced = loop {
            if status.is_some() && stdout.is_none() && stderr.is_none() {
                break None;
            }

            tokio::select! {
                biased;

                _ = &mut deadline => {
                    if status.is_some() {
                        debug!(execution_id = %id, "Output still open after exit, closing");
                        break None;
                    }
                    break Some(SupervisorOutcome::TimedOut);
                }

                msg = control.recv(), if control_open => match msg {
                    Some(Control::Cancel) => break Some(SupervisorOutcome::Cancelled),
                    None => control_open = false,
                },

                res = read_pipe(&mut stdout, &mut out_buf) => {
                    let text = match res {
                        Ok(n) if n > 0 => out_dec.decode(&out_buf[..n]),
                        _ => {
                            stdout = None;
                            out_dec.finish()
                        }
                    };
                    if !text.is_empty() && !sink.output(StreamKind::Stdout, text) {
                        break Some(SupervisorOutcome::OutputLimit);
                    }
                }

                res = read_pipe(&mut stderr, &mut err_buf) => {
                    let text = match res {
                        Ok(n) if n > 0 => err_dec.decode(&err_buf[..n]),
                        _ => {
                            stderr = None;
                            err_dec.finish()
                        }
                    };
                    if !text.is_empty() && !sink.output(StreamKind::Stderr, text) {
                        break Some(SupervisorOutcome::OutputLimit);
                    }
                }

                res = child.wait(), if status.is_none() => match res {
                    Ok(exit) => {
                        debug!(execution_id = %id, status = %exit, "Process exited");
                        status = Some(exit);
                        // Background children would otherwise hold the pipes open.
                        kill_group(pid);
                        let grace = tokio::time::Instant::now() + DRAIN_GRACE;
                        if grace < deadline.deadline() {
                            deadline.as_mut().reset(grace);
                        }
                    }
                    Err(e) => {
                        warn!(execution_id = %id, error = %e, "Failed to wait for process");
                        break Some(SupervisorOutcome::LaunchFailed(format!("wait failed: {}", e)));
                    }
                },
            }
        };

        if let Some(outcome) = forced {
            debug!(execution_id = %id, pid, outcome = ?outcome, "Terminating process group");
            kill_group(pid);
            sandbox.force_stop().await;
            if status.is_none() {
                match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => warn!(execution_id = %id, pid, "Process not reaped after SIGKILL"),
                }
            }
            return outcome;
        }

        if sandbox.oom_killed().await {
            return SupervisorOutcome::MemoryLimit;
        }

        match status {
            Some(exit) => SupervisorOutcome::Exited {
                code: exit_code(exit),
            },
            None => SupervisorOutcome::LaunchFailed("exit status unavailable".into()),
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

fn kill_group(pgid: u32) {
    if let Ok(pgid) = i32::try_from(pgid) {
        // SAFETY: sending a signal has no memory-safety implications.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match pipe {
        Some(reader) => reader.read(buf).await,
        None => pending().await,
    }
}

/// Streaming UTF-8 decoder that carries incomplete sequences across chunks.
#[derive(Debug, Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);
        let keep = incomplete_tail(&bytes);
        self.carry = bytes.split_off(bytes.len() - keep);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Length of a trailing multi-byte sequence that is not yet complete.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{BackendType, RunletConfig};
    use crate::error::ProvisionError;
    use crate::execution::ExecutionId;
    use crate::sandbox::backends::ProcessBackend;
    use crate::sandbox::{
        BackendCapabilities, IsolationBackend, LaunchSpec, Provisioner, SandboxContext,
        SandboxRequest,
    };
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[derive(Default)]
    struct Collect {
        pid: AtomicU32,
        chunks: Mutex<Vec<(StreamKind, String)>>,
        budget: Option<usize>,
    }

    impl Collect {
        fn text(&self, stream: StreamKind) -> String {
            self.chunks
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| *s == stream)
                .map(|(_, t)| t.as_str())
                .collect()
        }
    }

    impl OutputSink for Collect {
        fn started(&self, pid: u32) {
            self.pid.store(pid, Ordering::SeqCst);
        }

        fn output(&self, stream: StreamKind, text: String) -> bool {
            let mut chunks = self.chunks.lock().unwrap();
            chunks.push((stream, text));
            let total: usize = chunks.iter().map(|(_, t)| t.len()).sum();
            self.budget.map_or(true, |b| total <= b)
        }
    }

    fn provisioner(dir: &std::path::Path, backend: Arc<dyn IsolationBackend>) -> Provisioner {
        let mut config = RunletConfig::default();
        config.sandbox.backend = BackendType::Process;
        config.sandbox.cgroup.enabled = false;
        Provisioner::new(backend, &config, dir.to_path_buf()).unwrap()
    }

    async fn run_shell(code: &str, timeout: Duration, sink: &Collect) -> SupervisorOutcome {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path(), Arc::new(ProcessBackend::new()));
        let id = ExecutionId::generate();
        let mut sandbox = p
            .provision(&SandboxRequest {
                execution_id: &id,
                language: "shell",
                code,
                memory_mb: 256,
                timeout,
            })
            .await
            .unwrap();
        let lease = sandbox.take_lease().unwrap();

        let (_tx, mut rx) = mpsc::channel(1);
        let supervisor = Supervisor::new(&SupervisorConfig::default());
        let outcome = supervisor.run(&sandbox, timeout, &mut rx, sink).await;
        lease.teardown().await;
        outcome
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let sink = Collect::default();
        let outcome = run_shell(
            "echo out; echo err >&2; exit 3",
            Duration::from_secs(5),
            &sink,
        )
        .await;
        assert_eq!(outcome, SupervisorOutcome::Exited { code: 3 });
        assert_eq!(sink.text(StreamKind::Stdout), "out\n");
        assert_eq!(sink.text(StreamKind::Stderr), "err\n");
        assert_ne!(sink.pid.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_kills_the_process_group() {
        let sink = Collect::default();
        let start = Instant::now();
        let outcome = run_shell("sleep 30 & while :; do :; done", Duration::from_millis(500), &sink).await;
        assert_eq!(outcome, SupervisorOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_signal_death_maps_to_128_plus_signal() {
        let sink = Collect::default();
        let outcome = run_shell("kill -9 $$", Duration::from_secs(5), &sink).await;
        assert_eq!(outcome, SupervisorOutcome::Exited { code: 137 });
    }

    #[tokio::test]
    async fn test_background_writer_does_not_hold_completion() {
        let sink = Collect::default();
        let start = Instant::now();
        let outcome = run_shell("sleep 30 & echo done", Duration::from_secs(10), &sink).await;
        assert_eq!(outcome, SupervisorOutcome::Exited { code: 0 });
        assert_eq!(sink.text(StreamKind::Stdout), "done\n");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_budget_stops_the_program() {
        let sink = Collect {
            budget: Some(4096),
            ..Collect::default()
        };
        let outcome = run_shell("yes", Duration::from_secs(10), &sink).await;
        assert_eq!(outcome, SupervisorOutcome::OutputLimit);
    }

    #[tokio::test]
    async fn test_cancel_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path(), Arc::new(ProcessBackend::new()));
        let id = ExecutionId::generate();
        let mut sandbox = p
            .provision(&SandboxRequest {
                execution_id: &id,
                language: "shell",
                code: "sleep 30",
                memory_mb: 64,
                timeout: Duration::from_secs(30),
            })
            .await
            .unwrap();
        let lease = sandbox.take_lease().unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(Control::Cancel).await;
        });

        let sink = Collect::default();
        let start = Instant::now();
        let outcome = Supervisor::new(&SupervisorConfig::default())
            .run(&sandbox, Duration::from_secs(30), &mut rx, &sink)
            .await;
        assert_eq!(outcome, SupervisorOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        lease.teardown().await;
    }

    struct MissingInterpreter;

    #[async_trait::async_trait]
    impl IsolationBackend for MissingInterpreter {
        fn name(&self) -> &str {
            "missing"
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::default()
        }

        async fn prepare(&self, ctx: &SandboxContext<'_>) -> Result<LaunchSpec, ProvisionError> {
            Ok(LaunchSpec {
                program: PathBuf::from("/nonexistent/runlet-interpreter"),
                args: vec![],
                env: vec![],
                current_dir: ctx.root.to_path_buf(),
                rlimits: vec![],
                join_cgroup: None,
            })
        }
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path(), Arc::new(MissingInterpreter));
        let id = ExecutionId::generate();
        let mut sandbox = p
            .provision(&SandboxRequest {
                execution_id: &id,
                language: "python",
                code: "print(1)",
                memory_mb: 64,
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();
        let lease = sandbox.take_lease().unwrap();

        let (_tx, mut rx) = mpsc::channel(1);
        let sink = Collect::default();
        let outcome = Supervisor::new(&SupervisorConfig::default())
            .run(&sandbox, Duration::from_secs(1), &mut rx, &sink)
            .await;
        assert!(matches!(outcome, SupervisorOutcome::LaunchFailed(_)));
        assert_eq!(sink.pid.load(Ordering::SeqCst), 0);
        lease.teardown().await;
    }

    #[test]
    fn test_decoder_carries_split_sequences() {
        let bytes = "héllo €".as_bytes();
        let mut dec = Utf8Decoder::default();
        let mut out = String::new();
        for byte in bytes {
            out.push_str(&dec.decode(std::slice::from_ref(byte)));
        }
        out.push_str(&dec.finish());
        assert_eq!(out, "héllo €");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut dec = Utf8Decoder::default();
        assert_eq!(dec.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
        assert_eq!(dec.decode(&[0xE2, 0x82]), "");
        assert_eq!(dec.finish(), "\u{FFFD}");
    }
}
