//! SSH tunnels and port forwards (spec.md §4.5).
//!
//! The accept-loop-per-listener, semaphore-bounded-copy-tasks shape follows
//! kftray's `kube-connection_pool.rs::handle_tcp_listener`, adapted from a
//! Kubernetes port-forward to an SSH `direct-tcpip` channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::error::{CrossExecError, ErrorContext};
use crate::events::{Event, EventBus};

use super::adapter::RusshConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ForwardSpec {
    Local { remote_host: String, remote_port: u16 },
    Remote { local_host: String, local_port: u16 },
    /// Dynamic (SOCKS5) forward; connect-only per spec.md §9 open question.
    Dynamic,
}

const MAX_CONCURRENT_FORWARDED_CONNECTIONS: usize = 64;

/// Per-connection copy loops spawned by an accept loop, tracked so `close()`
/// can await all of them draining instead of leaving them detached
/// (spec.md invariant 8: `Close()` resolves only once all in-flight copies
/// have ended).
type CopyTaskSet = Arc<AsyncMutex<JoinSet<()>>>;

pub struct Tunnel {
    state: Arc<std::sync::Mutex<TunnelState>>,
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
    copy_tasks: CopyTaskSet,
    close_signal: Arc<Notify>,
    closed: Arc<AtomicBool>,
    events: Option<EventBus>,
    /// Set only for `open_remote_forward`: cancels the server-side
    /// `tcpip-forward` registration on close.
    remote_forward: Option<(Arc<RusshConnection>, String, u32)>,
}

impl Tunnel {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock().unwrap()
    }

    /// Idempotent: stops accepting new clients and waits for in-flight
    /// copy loops to drain before returning.
    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock().unwrap() = TunnelState::Closing;
        self.close_signal.notify_waiters();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        {
            let mut tasks = self.copy_tasks.lock().await;
            while tasks.join_next().await.is_some() {}
        }
        if let Some((connection, bind_address, bind_port)) = self.remote_forward.take() {
            connection.cancel_remote_forward(&bind_address, bind_port).await;
        }
        *self.state.lock().unwrap() = TunnelState::Closed;
        if let Some(bus) = &self.events {
            bus.publish(Event::TunnelClose {
                local_addr: self.local_addr.to_string(),
            });
        }
    }
}

/// Opens a local forward: a listener on `bind_addr` (port 0 ⇒ OS-assigned);
/// each accepted client is bridged to `spec`'s remote endpoint over a fresh
/// SSH `direct-tcpip` channel.
pub async fn open_local_forward(
    connection: Arc<RusshConnection>,
    bind_addr: SocketAddr,
    remote_host: String,
    remote_port: u16,
    events: Option<EventBus>,
) -> Result<Tunnel, CrossExecError> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| CrossExecError::ResourceError {
            kind: crate::error::ResourceKind::PortInUse,
            message: format!("failed to bind {bind_addr}: {e}"),
            context: ErrorContext::new(),
        })?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);

    let state = Arc::new(std::sync::Mutex::new(TunnelState::Opening));
    let close_signal = Arc::new(Notify::new());
    let closed = Arc::new(AtomicBool::new(false));
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_FORWARDED_CONNECTIONS));
    let copy_tasks: CopyTaskSet = Arc::new(AsyncMutex::new(JoinSet::new()));

    if let Some(bus) = &events {
        bus.publish(Event::TunnelOpen {
            local_addr: local_addr.to_string(),
        });
    }
    *state.lock().unwrap() = TunnelState::Open;

    let accept_state = state.clone();
    let accept_close = close_signal.clone();
    let accept_copy_tasks = copy_tasks.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            let permit = semaphore.clone().acquire_owned();
            tokio::select! {
                _ = accept_close.notified() => break,
                accepted = listener.accept() => {
                    let (stream, _peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => { warn!("tunnel accept failed: {e}"); continue; }
                    };
                    let Ok(permit) = permit.await else { continue };
                    let conn = connection.clone();
                    let host = remote_host.clone();
                    accept_copy_tasks.lock().await.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = copy_to_direct_tcpip(conn, stream, &host, remote_port).await {
                            debug!("forwarded connection ended: {e}");
                        }
                    });
                }
            }
        }
        *accept_state.lock().unwrap() = TunnelState::Closing;
    });

    Ok(Tunnel {
        state,
        local_addr,
        accept_task: Some(accept_task),
        copy_tasks,
        close_signal,
        closed,
        events,
        remote_forward: None,
    })
}

async fn copy_to_direct_tcpip(
    connection: Arc<RusshConnection>,
    mut stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
) -> Result<(), CrossExecError> {
    let mut channel = connection
        .open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
        .await?;

    let (mut read_half, mut write_half) = stream.split();
    tokio::io::copy_bidirectional_with_sizes(
        &mut read_half,
        &mut write_half,
        &mut channel,
        8192,
        8192,
    )
    .await
    .map_err(|e| CrossExecError::StreamError {
        message: format!("tunnel copy failed: {e}"),
        context: ErrorContext::new(),
    })?;
    Ok(())
}

/// SOCKS5 dynamic forward: the local listener speaks SOCKS5 CONNECT only
/// (no BIND/UDP ASSOCIATE), matching spec.md's explicit scope decision on
/// an incompletely-specified source behavior.
pub async fn open_dynamic_forward(
    connection: Arc<RusshConnection>,
    bind_addr: SocketAddr,
    events: Option<EventBus>,
) -> Result<Tunnel, CrossExecError> {
    // The SOCKS5 handshake itself (greeting, CONNECT request parsing) lives
    // in the accept loop below; everything downstream reuses the same
    // direct-tcpip bridging as the local forward.
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| CrossExecError::ResourceError {
            kind: crate::error::ResourceKind::PortInUse,
            message: format!("failed to bind {bind_addr}: {e}"),
            context: ErrorContext::new(),
        })?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);

    let state = Arc::new(std::sync::Mutex::new(TunnelState::Open));
    let close_signal = Arc::new(Notify::new());
    let closed = Arc::new(AtomicBool::new(false));
    let copy_tasks: CopyTaskSet = Arc::new(AsyncMutex::new(JoinSet::new()));

    if let Some(bus) = &events {
        bus.publish(Event::TunnelOpen {
            local_addr: local_addr.to_string(),
        });
    }

    let accept_close = close_signal.clone();
    let accept_copy_tasks = copy_tasks.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_close.notified() => break,
                accepted = listener.accept() => {
                    let (stream, _peer) = match accepted {
                        Ok(pair) => pair,
                        Err(_) => continue,
                    };
                    let conn = connection.clone();
                    accept_copy_tasks.lock().await.spawn(async move {
                        let _ = handle_socks5_connect(conn, stream).await;
                    });
                }
            }
        }
    });

    Ok(Tunnel {
        state,
        local_addr,
        accept_task: Some(accept_task),
        copy_tasks,
        close_signal,
        closed,
        events,
        remote_forward: None,
    })
}

async fn handle_socks5_connect(
    connection: Arc<RusshConnection>,
    mut stream: TcpStream,
) -> Result<(), CrossExecError> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut greeting = [0u8; 2];
    stream
        .read_exact(&mut greeting)
        .await
        .map_err(|e| stream_err(e))?;
    let nmethods = greeting[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await.map_err(stream_err)?;
    // No-auth only.
    stream.write_all(&[0x05, 0x00]).await.map_err(stream_err)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(stream_err)?;
    if header[1] != 0x01 {
        // CONNECT only (spec.md §6: "connect-only, no BIND/UDP ASSOCIATE").
        stream.write_all(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.ok();
        return Ok(());
    }
    let (host, port) = match header[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await.map_err(stream_err)?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await.map_err(stream_err)?;
            (
                std::net::Ipv4Addr::from(addr).to_string(),
                u16::from_be_bytes(port_buf),
            )
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(stream_err)?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await.map_err(stream_err)?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await.map_err(stream_err)?;
            (
                String::from_utf8_lossy(&domain).into_owned(),
                u16::from_be_bytes(port_buf),
            )
        }
        _ => return Ok(()),
    };

    let mut channel = connection.open_direct_tcpip(&host, port as u32, "127.0.0.1", 0).await?;
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .map_err(stream_err)?;

    let (mut read_half, mut write_half) = stream.split();
    tokio::io::copy_bidirectional_with_sizes(&mut read_half, &mut write_half, &mut channel, 8192, 8192)
        .await
        .map_err(stream_err)?;
    Ok(())
}

fn stream_err(e: std::io::Error) -> CrossExecError {
    CrossExecError::StreamError {
        message: e.to_string(),
        context: ErrorContext::new(),
    }
}

/// Opens a remote forward (`ssh -R`): asks the server to bind
/// `bind_port` on its side (0 ⇒ server-assigned) and bridges every
/// `forwarded-tcpip` channel the server opens back at us to a local TCP
/// connection at `local_host:local_port`.
///
/// Unlike local/dynamic forwards this has no listener of our own — the
/// "accept loop" instead drains an mpsc fed by the connection's
/// `server_channel_open_forwarded_tcpip` handler.
pub async fn open_remote_forward(
    connection: Arc<RusshConnection>,
    bind_address: String,
    bind_port: u16,
    local_host: String,
    local_port: u16,
    events: Option<EventBus>,
) -> Result<Tunnel, CrossExecError> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let bound_port = connection
        .request_remote_forward(&bind_address, bind_port as u32, tx)
        .await?;

    let local_addr: SocketAddr = format!("{bind_address}:{bound_port}")
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], bound_port as u16)));

    let state = Arc::new(std::sync::Mutex::new(TunnelState::Open));
    let close_signal = Arc::new(Notify::new());
    let closed = Arc::new(AtomicBool::new(false));
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_FORWARDED_CONNECTIONS));
    let copy_tasks: CopyTaskSet = Arc::new(AsyncMutex::new(JoinSet::new()));

    if let Some(bus) = &events {
        bus.publish(Event::TunnelOpen {
            local_addr: local_addr.to_string(),
        });
    }

    let accept_close = close_signal.clone();
    let accept_copy_tasks = copy_tasks.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            let permit = semaphore.clone().acquire_owned();
            tokio::select! {
                _ = accept_close.notified() => break,
                forwarded = rx.recv() => {
                    let Some(channel) = forwarded else { break };
                    let Ok(permit) = permit.await else { continue };
                    let host = local_host.clone();
                    accept_copy_tasks.lock().await.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = bridge_forwarded_channel(channel, &host, local_port).await {
                            debug!("remote-forwarded connection ended: {e}");
                        }
                    });
                }
            }
        }
    });

    Ok(Tunnel {
        state,
        local_addr,
        accept_task: Some(accept_task),
        copy_tasks,
        close_signal,
        closed,
        events,
        remote_forward: Some((connection, bind_address, bound_port)),
    })
}

async fn bridge_forwarded_channel(
    channel: russh::Channel<russh::client::Msg>,
    local_host: &str,
    local_port: u16,
) -> Result<(), CrossExecError> {
    let mut local = TcpStream::connect((local_host, local_port))
        .await
        .map_err(stream_err)?;
    let mut remote = channel.into_stream();
    let (mut read_half, mut write_half) = local.split();
    tokio::io::copy_bidirectional_with_sizes(&mut read_half, &mut write_half, &mut remote, 8192, 8192)
        .await
        .map_err(stream_err)?;
    Ok(())
}
