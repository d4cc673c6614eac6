//! Local adapter: launches a process on the host (spec.md §4.2).
//!
//! The two-phase kill on timeout mirrors
//! `environment/docker/power.rs::wait_for_stop`'s `tokio::select!` race
//! between process exit, a deadline, and cancellation, followed by a
//! forceful kill if the grace period elapses — the same shape, without a
//! container in the loop.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout as tokio_timeout;

use crate::engine::spec::{ExecutionResult, ExecutionSpec, ShellPolicy, Sink, StdinSource, Target};
use crate::error::{CrossExecError, ErrorContext};
use crate::quoting;

pub struct LocalAdapter;

impl LocalAdapter {
    pub fn new() -> Self {
        Self
    }

    fn build_command(spec: &ExecutionSpec) -> Result<Command, CrossExecError> {
        let mut cmd = match &spec.shell {
            ShellPolicy::Disabled => {
                let argv = spec
                    .argv
                    .clone()
                    .map(Ok)
                    .unwrap_or_else(|| quoting::split(&spec.command))
                    .map_err(|e| CrossExecError::ValidationError {
                        message: format!("failed to parse argv: {e}"),
                    })?;
                let (prog, rest) = argv
                    .split_first()
                    .ok_or_else(|| CrossExecError::ValidationError {
                        message: "empty command".into(),
                    })?;
                let mut cmd = Command::new(prog);
                cmd.args(rest);
                cmd
            }
            ShellPolicy::Default => {
                let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(&spec.command);
                cmd
            }
            ShellPolicy::Named(name) => {
                let mut cmd = Command::new(name);
                cmd.arg("-c").arg(&spec.command);
                cmd
            }
        };

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        Ok(cmd)
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::Adapter for LocalAdapter {
    fn tag(&self) -> &'static str {
        "local"
    }

    async fn dispatch(&self, spec: &ExecutionSpec) -> Result<ExecutionResult, CrossExecError> {
        let started_at = chrono::Utc::now();
        let start_instant = Instant::now();

        let mut cmd = Self::build_command(spec)?;

        let stdin_mode = match spec.stdin {
            StdinSource::None => Stdio::null(),
            StdinSource::Bytes(_) | StdinSource::Stream => Stdio::piped(),
        };
        cmd.stdin(stdin_mode);
        cmd.stdout(sink_stdio(&spec.stdout_sink));
        cmd.stderr(sink_stdio(&spec.stderr_sink));

        let mut child = cmd.spawn().map_err(|e| CrossExecError::AdapterError {
            adapter: "local",
            message: format!("failed to spawn process: {e}"),
            context: ErrorContext::new().with_command(&spec.command),
            transient: false,
            cause: Some(Box::new(e)),
        })?;

        if let StdinSource::Bytes(bytes) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(bytes).await;
            }
        }

        // Drain stdout and stderr concurrently: reading one to EOF before
        // touching the other risks a deadlock if the child fills the
        // unread pipe's OS buffer while blocked writing to it.
        let total_read = std::sync::atomic::AtomicUsize::new(0);
        let limit = spec.max_buffered_bytes;
        let stdout_fut = read_bounded(child.stdout.take(), &total_read, limit);
        let stderr_fut = read_bounded(child.stderr.take(), &total_read, limit);
        let (stdout_res, stderr_res) = tokio::join!(stdout_fut, stderr_fut);

        if stdout_res.is_none() || stderr_res.is_none() {
            let _ = child.start_kill();
            let _ = tokio_timeout(spec.kill_grace, child.wait()).await;
            let _ = child.kill().await;
            return Err(CrossExecError::AdapterError {
                adapter: "local",
                message: format!("output exceeded max_buffered_bytes ({limit} bytes); process terminated"),
                context: ErrorContext::new().with_command(&spec.command),
                transient: false,
                cause: None,
            });
        }
        let stdout_buf = stdout_res.unwrap_or_default();
        let stderr_buf = stderr_res.unwrap_or_default();

        let wait_fut = child.wait();
        let status = match spec.timeout {
            None => wait_fut.await.map_err(|e| spawn_wait_error(spec, e))?,
            Some(deadline) => match tokio_timeout(deadline, wait_fut).await {
                Ok(status) => status.map_err(|e| spawn_wait_error(spec, e))?,
                Err(_) => {
                    // Two-phase kill: gentle signal already implied by `kill()`
                    // on this platform-agnostic path, then force-kill after grace.
                    let _ = child.start_kill();
                    let _ = tokio_timeout(spec.kill_grace, child.wait()).await;
                    let _ = child.kill().await;
                    return Err(CrossExecError::TimeoutError {
                        elapsed_ms: start_instant.elapsed().as_millis() as u64,
                        context: ErrorContext::new().with_command(&spec.command),
                        partial_stdout: stdout_buf,
                        partial_stderr: stderr_buf,
                    });
                }
            },
        };

        let ended_at = chrono::Utc::now();
        let duration = start_instant.elapsed();

        Ok(ExecutionResult {
            command: spec.command.clone(),
            stdout: Bytes::from(stdout_buf),
            stderr: Bytes::from(stderr_buf),
            exit_code: status.code(),
            signal: unix_signal_name(&status),
            started_at,
            ended_at,
            duration,
            adapter_tag: "local",
            target_descriptor: target_descriptor(&spec.target),
            cause: None,
            cached_at: None,
        })
    }
}

/// Reads a child's pipe to EOF, tracking bytes read against a limit shared
/// with the sibling stream. Returns `None` once the shared total crosses
/// `limit`, signalling the caller to kill the process (spec.md §4.2).
async fn read_bounded<R>(
    reader: Option<R>,
    total: &std::sync::atomic::AtomicUsize,
    limit: usize,
) -> Option<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = match reader {
        Some(r) => r,
        None => return Some(Vec::new()),
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let seen = total.fetch_add(n, std::sync::atomic::Ordering::SeqCst) + n;
        if seen > limit {
            return None;
        }
    }
    Some(buf)
}

fn sink_stdio(sink: &Sink) -> Stdio {
    match sink {
        Sink::Pipe | Sink::Stream(_) => Stdio::piped(),
        Sink::Inherit => Stdio::inherit(),
        Sink::Ignore => Stdio::null(),
    }
}

fn target_descriptor(target: &Target) -> String {
    match target {
        Target::Local => "local".to_string(),
        Target::Ssh { host, port, user, .. } => format!("{user}@{host}:{port}"),
        Target::Container { container_id } => container_id.clone(),
        Target::Pod { namespace, pod, .. } => format!("{namespace}/{pod}"),
    }
}

fn spawn_wait_error(spec: &ExecutionSpec, e: std::io::Error) -> CrossExecError {
    CrossExecError::AdapterError {
        adapter: "local",
        message: format!("wait failed: {e}"),
        context: ErrorContext::new().with_command(&spec.command),
        transient: false,
        cause: Some(Box::new(e)),
    }
}

#[cfg(unix)]
fn unix_signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|s| format!("SIG{s}"))
}

#[cfg(not(unix))]
fn unix_signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Adapter;

    #[tokio::test]
    async fn local_echo_succeeds() {
        let adapter = LocalAdapter::new();
        let spec = ExecutionSpec::new("echo hello", Target::Local);
        let result = adapter.dispatch(&spec).await.unwrap();
        assert_eq!(result.stdout_text(), "hello\n");
        assert!(result.ok());
    }

    #[tokio::test]
    async fn local_nonzero_exit_is_not_ok() {
        let adapter = LocalAdapter::new();
        let spec = ExecutionSpec::new("exit 42", Target::Local);
        let result = adapter.dispatch(&spec).await.unwrap();
        assert_eq!(result.exit_code, Some(42));
        assert!(!result.ok());
    }

    #[tokio::test]
    async fn local_timeout_is_killed() {
        let adapter = LocalAdapter::new();
        let mut spec = ExecutionSpec::new("sleep 5", Target::Local);
        spec.timeout = Some(Duration::from_millis(100));
        spec.kill_grace = Duration::from_millis(50);
        let err = adapter.dispatch(&spec).await.unwrap_err();
        assert!(matches!(err, CrossExecError::TimeoutError { .. }));
    }

    #[tokio::test]
    async fn local_output_over_limit_fails_and_kills_process() {
        let adapter = LocalAdapter::new();
        let mut spec = ExecutionSpec::new("yes", Target::Local);
        spec.max_buffered_bytes = 16;
        let err = adapter.dispatch(&spec).await.unwrap_err();
        assert!(matches!(err, CrossExecError::AdapterError { .. }));
    }

    #[tokio::test]
    async fn local_disabled_shell_uses_argv_directly() {
        let adapter = LocalAdapter::new();
        let mut spec = ExecutionSpec::new("", Target::Local);
        spec.shell = ShellPolicy::Disabled;
        spec.argv = Some(vec!["echo".into(), "hi there".into()]);
        let result = adapter.dispatch(&spec).await.unwrap();
        assert_eq!(result.stdout_text(), "hi there\n");
    }
}
