//! Pod adapter (spec.md §4 component share table: "pod exec, port-forward,
//! log stream, cp, label selection").
//!
//! Grounded on kftray's `kube-connection_pool.rs` for the
//! resolve-then-validate pattern used to pick a ready pod from a label
//! selector (`resolve_target`, `create_validator` checking Running+Ready),
//! and on `environment/traits.rs::ProcessEnvironment` for the
//! create/start/stop/attach surface this adapter narrows down to just exec.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams, LogParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tokio::time::timeout as tokio_timeout;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use tokio_stream::StreamExt;

use super::copy;
use crate::engine::spec::{ExecutionResult, ExecutionSpec, ShellPolicy, Target};
use crate::error::{CrossExecError, ErrorContext};
use crate::stream::ChunkSender;

pub struct PodAdapter {
    client: Client,
}

impl PodAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn argv(spec: &ExecutionSpec) -> Result<Vec<String>, CrossExecError> {
        if let Some(argv) = &spec.argv {
            return Ok(argv.clone());
        }
        match spec.shell {
            ShellPolicy::Disabled => crate::quoting::split(&spec.command).map_err(|e| {
                CrossExecError::ValidationError {
                    message: format!("invalid command: {e}"),
                }
            }),
            _ => Ok(vec!["/bin/sh".into(), "-c".into(), spec.command.clone()]),
        }
    }

    /// Resolves a label selector to one ready pod, mirroring kftray's
    /// `resolve_target`/`create_validator` cache-then-validate shape
    /// (simplified here to a one-shot lookup since the engine's pool, not
    /// this adapter, owns any caching of the resolution).
    pub async fn resolve_pod_by_selector(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<String, CrossExecError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| CrossExecError::ConnectionError {
                message: e.to_string(),
                context: ErrorContext::new().with_pod(selector),
                cause: None,
                suggestions: vec![],
            })?;

        pods.items
            .into_iter()
            .find(|p| is_ready(p))
            .and_then(|p| p.metadata.name)
            .ok_or_else(|| CrossExecError::ResourceError {
                kind: crate::error::ResourceKind::QueueTimeout,
                message: format!("no ready pod matches selector {selector}"),
                context: ErrorContext::new().with_pod(selector),
            })
    }

    /// Copies a local file into the pod via an exec'd `tar xf -`
    /// (spec.md's "cp" component — there is no dedicated copy API).
    pub async fn copy_to(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        local: &Path,
        remote_path: &str,
    ) -> Result<(), CrossExecError> {
        copy::upload_file(&self.client, namespace, pod, container, local, remote_path).await
    }

    /// Downloads a path out of the pod as a tar stream written to `local`.
    pub async fn copy_from(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        remote_path: &str,
        local: &Path,
    ) -> Result<(), CrossExecError> {
        copy::download_path(&self.client, namespace, pod, container, remote_path, local).await
    }

    /// Streams a pod's logs into `sender` as they arrive, following the
    /// teacher's task-plus-channel shape for long-lived background reads.
    /// Returns immediately with a handle to the forwarding task; dropping
    /// the receiving end of `sender` stops the stream.
    pub fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        follow: bool,
        tail_lines: Option<i64>,
        sender: ChunkSender,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let namespace = namespace.to_string();
        let pod = pod.to_string();
        let container = container.map(|c| c.to_string());

        tokio::spawn(async move {
            let api: Api<Pod> = Api::namespaced(client, &namespace);
            let mut lp = LogParams::default();
            lp.follow = follow;
            lp.tail_lines = tail_lines;
            lp.container = container;

            let reader = match api.log_stream(&pod, &lp).await {
                Ok(r) => r,
                Err(_) => return,
            };
            let mut chunks = ReaderStream::new(reader.compat());
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(bytes) => {
                        if sender.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
    }
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[async_trait]
impl super::super::Adapter for PodAdapter {
    fn tag(&self) -> &'static str {
        "pod"
    }

    async fn dispatch(&self, spec: &ExecutionSpec) -> Result<ExecutionResult, CrossExecError> {
        let (namespace, pod, container) = match &spec.target {
            Target::Pod {
                namespace,
                pod,
                container,
            } => (namespace.clone(), pod.clone(), container.clone()),
            _ => {
                return Err(CrossExecError::ValidationError {
                    message: "PodAdapter dispatched against a non-pod target".into(),
                })
            }
        };

        let started_at = chrono::Utc::now();
        let start_instant = Instant::now();

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let mut params = AttachParams::default().stdout(true).stderr(true);
        if let Some(c) = &container {
            params = params.container(c.clone());
        }

        let argv = Self::argv(spec)?;
        let mut attached = api
            .exec(&pod, argv, &params)
            .await
            .map_err(|e| CrossExecError::AdapterError {
                adapter: "pod",
                message: e.to_string(),
                context: ErrorContext::new().with_pod(&pod),
                transient: true,
                cause: None,
            })?;

        let mut stdout_buf = BytesMut::new();
        let mut stderr_buf = BytesMut::new();

        let read_fut = async {
            if let Some(mut stdout) = attached.stdout() {
                let _ = stdout.read_to_end(&mut stdout_buf).await;
            }
            if let Some(mut stderr) = attached.stderr() {
                let _ = stderr.read_to_end(&mut stderr_buf).await;
            }
        };

        match spec.timeout {
            Some(deadline) => {
                tokio_timeout(deadline, read_fut)
                    .await
                    .map_err(|_| CrossExecError::TimeoutError {
                        elapsed_ms: deadline.as_millis() as u64,
                        context: ErrorContext::new().with_pod(&pod),
                        partial_stdout: stdout_buf.to_vec(),
                        partial_stderr: stderr_buf.to_vec(),
                    })?;
            }
            None => read_fut.await,
        }

        let status = match attached.take_status() {
            Some(status_fut) => status_fut.await,
            None => None,
        };
        // `status.status == "Success"` means the command ran and exited 0;
        // a "Failure" status without a parseable ExitCode cause (or no
        // status at all) means the exit code genuinely could not be
        // determined, and must not be reported as success.
        let exit_code = match &status {
            Some(s) if s.status.as_deref() == Some("Success") => Some(0),
            Some(s) => s
                .details
                .as_ref()
                .and_then(|d| d.causes.as_ref())
                .and_then(|causes| causes.iter().find(|c| c.reason.as_deref() == Some("ExitCode")))
                .and_then(|c| c.message.as_ref())
                .and_then(|m| m.parse::<i32>().ok()),
            None => None,
        };

        Ok(ExecutionResult {
            command: spec.command.clone(),
            stdout: Bytes::from(stdout_buf),
            stderr: Bytes::from(stderr_buf),
            exit_code,
            signal: None,
            started_at,
            ended_at: chrono::Utc::now(),
            duration: start_instant.elapsed(),
            adapter_tag: "pod",
            target_descriptor: format!("{namespace}/{pod}"),
            cause: None,
            cached_at: None,
        })
    }
}
