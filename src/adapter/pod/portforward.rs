//! Kubernetes port-forward (spec.md §4.5 "Kubernetes port-forward").
//!
//! The accept-loop/semaphore shape is the same one used for SSH local
//! forwards (`adapter::ssh::tunnel`), grounded directly on kftray's
//! `kube-connection_pool.rs::handle_tcp_listener`, here driving the
//! cluster API's port-forward subresource instead of an SSH channel.

use std::net::SocketAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::error::{CrossExecError, ErrorContext};
use crate::events::{Event, EventBus};

pub struct PodPortForward {
    local_addr: SocketAddr,
    close_signal: Arc<Notify>,
}

impl PodPortForward {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.close_signal.notify_waiters();
    }
}

/// Opens a forward from `bind_addr` to `pod_port` on `pod`. Multi-port
/// forwards share a single upstream `Portforwarder` where the API permits,
/// but each accepted local connection still gets its own forwarded stream.
pub async fn open(
    client: kube::Client,
    namespace: &str,
    pod: &str,
    pod_port: u16,
    bind_addr: SocketAddr,
    events: Option<EventBus>,
) -> Result<PodPortForward, CrossExecError> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| CrossExecError::ResourceError {
            kind: crate::error::ResourceKind::PortInUse,
            message: format!("failed to bind {bind_addr}: {e}"),
            context: ErrorContext::new().with_pod(pod),
        })?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);
    let close_signal = Arc::new(Notify::new());

    if let Some(bus) = &events {
        bus.publish(Event::TunnelOpen {
            local_addr: local_addr.to_string(),
        });
    }

    let pod_name = pod.to_string();
    let accept_close = close_signal.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_close.notified() => break,
                accepted = listener.accept() => {
                    let (stream, _peer) = match accepted { Ok(p) => p, Err(_) => continue };
                    let api = api.clone();
                    let pod_name = pod_name.clone();
                    tokio::spawn(async move {
                        let _ = forward_one(api, &pod_name, pod_port, stream).await;
                    });
                }
            }
        }
    });

    Ok(PodPortForward {
        local_addr,
        close_signal,
    })
}

async fn forward_one(
    api: Api<Pod>,
    pod: &str,
    pod_port: u16,
    mut stream: TcpStream,
) -> Result<(), CrossExecError> {
    let mut forwarder = api
        .portforward(pod, &[pod_port])
        .await
        .map_err(|e| CrossExecError::ConnectionError {
            message: e.to_string(),
            context: ErrorContext::new().with_pod(pod),
            cause: None,
            suggestions: vec![],
        })?;
    let mut upstream = forwarder
        .take_stream(pod_port)
        .ok_or_else(|| CrossExecError::AdapterError {
            adapter: "pod",
            message: "port-forward stream unavailable".into(),
            context: ErrorContext::new().with_pod(pod),
            transient: true,
            cause: None,
        })?;

    copy_bidirectional(&mut stream, &mut upstream)
        .await
        .map_err(|e| CrossExecError::StreamError {
            message: format!("port-forward copy failed: {e}"),
            context: ErrorContext::new().with_pod(pod),
        })?;
    Ok(())
}
