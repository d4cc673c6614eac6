//! Container adapter (spec.md §4 component share table: "exec in
//! container, copy, compose/lifecycle wrappers").
//!
//! Grounded on `environment/docker/container.rs` (`shell_words::split` for
//! argv parsing, the `bollard::Config`/`HostConfig` building style) and
//! `environment/docker/power.rs::attach_container` (the two-task
//! output-reader/input-writer stdio wiring, generalized here to
//! `docker.create_exec`/`start_exec` instead of container attach).

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{StartContainerOptions, StopContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::time::timeout as tokio_timeout;

use super::copy;
use crate::engine::spec::{ExecutionResult, ExecutionSpec, ShellPolicy, Target};
use crate::error::{CrossExecError, ErrorContext};

pub struct ContainerAdapter {
    docker: Docker,
}

impl ContainerAdapter {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
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

    /// Copies a local file into the container, the `copy` half of spec.md's
    /// "exec in container, copy, compose/lifecycle wrappers" component.
    pub async fn copy_to(
        &self,
        container_id: &str,
        local: &Path,
        remote_path: &str,
    ) -> Result<(), CrossExecError> {
        copy::upload_file(&self.docker, container_id, local, remote_path).await
    }

    /// Downloads a path out of the container as a tar stream written to
    /// `local`, mirroring `docker cp container:remote local`.
    pub async fn copy_from(
        &self,
        container_id: &str,
        remote_path: &str,
        local: &Path,
    ) -> Result<(), CrossExecError> {
        copy::download_path(&self.docker, container_id, remote_path, local).await
    }

    /// Starts an existing (created but stopped) container. One of the
    /// lifecycle wrappers the core uses rather than re-implements — spec.md's
    /// Non-goals exclude a compose/cluster control plane, not single-container
    /// start/stop.
    pub async fn start_container(&self, container_id: &str) -> Result<(), CrossExecError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| adapter_err(container_id, e))
    }

    /// Stops a running container, sending the daemon's default signal and
    /// waiting up to `timeout_secs` before it force-kills.
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout_secs: Option<i64>,
    ) -> Result<(), CrossExecError> {
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: timeout_secs.unwrap_or(10) }))
            .await
            .map_err(|e| adapter_err(container_id, e))
    }

    /// Whether `container_id` currently exists (in any state), used by
    /// callers deciding whether to create or reuse a target container.
    pub async fn container_exists(&self, container_id: &str) -> Result<bool, CrossExecError> {
        match self.docker.inspect_container(container_id, None).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(adapter_err(container_id, e)),
        }
    }
}

#[async_trait]
impl super::super::Adapter for ContainerAdapter {
    fn tag(&self) -> &'static str {
        "container"
    }

    async fn dispatch(&self, spec: &ExecutionSpec) -> Result<ExecutionResult, CrossExecError> {
        let container_id = match &spec.target {
            Target::Container { container_id } => container_id.clone(),
            _ => {
                return Err(CrossExecError::ValidationError {
                    message: "ContainerAdapter dispatched against a non-container target".into(),
                })
            }
        };

        let started_at = chrono::Utc::now();
        let start_instant = Instant::now();

        let env_vars: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let exec = self
            .docker
            .create_exec(
                &container_id,
                CreateExecOptions {
                    cmd: Some(Self::argv(spec)?),
                    env: Some(env_vars),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: spec.cwd.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| adapter_err(&container_id, e))?;

        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();

        let run = async {
            match self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| adapter_err(&container_id, e))?
            {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(msg) = output.next().await {
                        match msg {
                            Ok(bollard::container::LogOutput::StdOut { message }) => {
                                stdout.extend_from_slice(&message)
                            }
                            Ok(bollard::container::LogOutput::StdErr { message }) => {
                                stderr.extend_from_slice(&message)
                            }
                            Ok(_) => {}
                            Err(e) => return Err(adapter_err(&container_id, e)),
                        }
                    }
                    Ok(())
                }
                StartExecResults::Detached => Ok(()),
            }
        };

        match spec.timeout {
            Some(deadline) => tokio_timeout(deadline, run).await.map_err(|_| {
                CrossExecError::TimeoutError {
                    elapsed_ms: deadline.as_millis() as u64,
                    context: ErrorContext::new().with_container(&container_id),
                    partial_stdout: stdout.to_vec(),
                    partial_stderr: stderr.to_vec(),
                }
            })??,
            None => run.await?,
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| adapter_err(&container_id, e))?;

        Ok(ExecutionResult {
            command: spec.command.clone(),
            stdout: Bytes::from(stdout),
            stderr: Bytes::from(stderr),
            exit_code: inspect.exit_code.map(|c| c as i32),
            signal: None,
            started_at,
            ended_at: chrono::Utc::now(),
            duration: start_instant.elapsed(),
            adapter_tag: "container",
            target_descriptor: container_id,
            cause: None,
            cached_at: None,
        })
    }
}

fn adapter_err(container_id: &str, e: bollard::errors::Error) -> CrossExecError {
    CrossExecError::AdapterError {
        adapter: "container",
        message: e.to_string(),
        context: ErrorContext::new().with_container(container_id),
        transient: matches!(e, bollard::errors::Error::DockerResponseServerError { status_code, .. } if status_code >= 500),
        cause: None,
    }
}
