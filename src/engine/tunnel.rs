//! Unified `Tunnel(spec)` entry point (spec.md §4.1 "`Tunnel(spec)` opens a
//! forward; see §4.5").
//!
//! The Engine dispatches each `TunnelSpec` variant to the adapter that
//! actually understands it — the three SSH forward kinds, or the
//! Kubernetes port-forward — and hands back one handle type so callers
//! don't need to match on adapter kind themselves.

use std::net::SocketAddr;

use crate::adapter::pod::portforward::{self, PodPortForward};
use crate::adapter::ssh::tunnel::{self, Tunnel};
use crate::error::CrossExecError;

use super::context::Engine;
use super::spec::Target;

/// What to forward and where to bind. Each variant requires the Engine's
/// current target to match (SSH for the first three, Pod for the last);
/// mismatches fail with `ValidationError` rather than panicking.
#[derive(Debug, Clone)]
pub enum TunnelSpec {
    /// `ssh -L bind:remoteHost:remotePort`.
    Local {
        bind_addr: SocketAddr,
        remote_host: String,
        remote_port: u16,
    },
    /// `ssh -R bindAddress:bindPort:localHost:localPort`.
    Remote {
        bind_address: String,
        bind_port: u16,
        local_host: String,
        local_port: u16,
    },
    /// SOCKS5 dynamic forward (connect-only, per spec.md §6).
    Dynamic { bind_addr: SocketAddr },
    /// Kubernetes port-forward to the Engine's current pod target.
    PodForward { bind_addr: SocketAddr, pod_port: u16 },
}

/// A live forward. `Close()` is idempotent and resolves only once all
/// in-flight copy loops have drained (spec.md §4.5 invariants).
pub enum PortForwardHandle {
    Ssh(Tunnel),
    Pod(PodPortForward),
}

impl PortForwardHandle {
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Self::Ssh(t) => t.local_addr(),
            Self::Pod(p) => p.local_addr(),
        }
    }

    pub async fn close(&mut self) {
        match self {
            Self::Ssh(t) => t.close().await,
            Self::Pod(p) => p.close(),
        }
    }
}

impl Engine {
    /// `Engine.Tunnel(spec)`.
    pub async fn tunnel(&self, spec: TunnelSpec) -> Result<PortForwardHandle, CrossExecError> {
        let events = Some(self.inner.events.clone());
        match spec {
            TunnelSpec::Local {
                bind_addr,
                remote_host,
                remote_port,
            } => {
                let connection = self.ssh_session().await?;
                let t = tunnel::open_local_forward(connection, bind_addr, remote_host, remote_port, events).await?;
                Ok(PortForwardHandle::Ssh(t))
            }
            TunnelSpec::Remote {
                bind_address,
                bind_port,
                local_host,
                local_port,
            } => {
                let connection = self.ssh_session().await?;
                let t = tunnel::open_remote_forward(connection, bind_address, bind_port, local_host, local_port, events)
                    .await?;
                Ok(PortForwardHandle::Ssh(t))
            }
            TunnelSpec::Dynamic { bind_addr } => {
                let connection = self.ssh_session().await?;
                let t = tunnel::open_dynamic_forward(connection, bind_addr, events).await?;
                Ok(PortForwardHandle::Ssh(t))
            }
            TunnelSpec::PodForward { bind_addr, pod_port } => {
                let (client, namespace, pod) = self.pod_endpoint()?;
                let p = portforward::open(client, &namespace, &pod, pod_port, bind_addr, events).await?;
                Ok(PortForwardHandle::Pod(p))
            }
        }
    }

    async fn ssh_session(&self) -> Result<std::sync::Arc<crate::adapter::ssh::adapter::RusshConnection>, CrossExecError> {
        if !matches!(self.inner.target, Target::Ssh { .. }) {
            return Err(CrossExecError::ValidationError {
                message: "this tunnel kind requires an SSH target; call Engine::ssh(..) first".into(),
            });
        }
        let adapter = self.inner.adapters.ssh.clone().ok_or_else(|| CrossExecError::ValidationError {
            message: "no SSH adapter configured; call Engine::ssh(..) first".into(),
        })?;
        adapter.acquire_session().await
    }

    fn pod_endpoint(&self) -> Result<(kube::Client, String, String), CrossExecError> {
        let Target::Pod { namespace, pod, .. } = &self.inner.target else {
            return Err(CrossExecError::ValidationError {
                message: "pod port-forward requires a Pod target; call Engine::k8s(..) first".into(),
            });
        };
        let adapter = self.inner.adapters.pod.clone().ok_or_else(|| CrossExecError::ValidationError {
            message: "no pod adapter configured; call Engine::k8s(..) first".into(),
        })?;
        Ok((adapter.client(), namespace.clone(), pod.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tunnel_without_ssh_target_is_validation_error() {
        let engine = Engine::new();
        let err = engine
            .tunnel(TunnelSpec::Local {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                remote_host: "example.com".into(),
                remote_port: 80,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CrossExecError::ValidationError { .. }));
    }
}
