//! SSH adapter (spec.md §4.3): acquires a pooled connection, execs a
//! command over a channel, and exposes SFTP-based file transfer.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg};
use russh_keys::key;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout as tokio_timeout;
use tracing::warn;

use crate::engine::spec::{ExecutionResult, ExecutionSpec, ShellPolicy, SshAuth, StdinSource, Target};
use crate::error::{CrossExecError, ErrorContext};

use super::pool::{self, Pool, PoolKey, SshSession};

/// A fully-resolved SSH target, derived from `Target::Ssh` — split out
/// because the pool key needs the auth fingerprint before a connection
/// exists.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

impl SshTarget {
    pub fn pool_key(&self) -> PoolKey {
        pool::pool_key(&self.user, &self.host, self.port, &self.auth.fingerprint())
    }
}

impl<'a> TryFrom<&'a Target> for SshTarget {
    type Error = CrossExecError;

    fn try_from(target: &'a Target) -> Result<Self, Self::Error> {
        match target {
            Target::Ssh { host, port, user, auth } => Ok(SshTarget {
                host: host.clone(),
                port: *port,
                user: user.clone(),
                auth: auth.clone(),
            }),
            _ => Err(CrossExecError::ValidationError {
                message: "SshAdapter dispatched against a non-SSH target".into(),
            }),
        }
    }
}

/// Registry of pending remote-forward listeners, keyed by the bound port on
/// the remote side. Populated by `open_remote_forward` before the
/// `tcpip-forward` request is sent, drained by the handler as the server
/// opens `forwarded-tcpip` channels back at us.
pub type ForwardedChannelSender = mpsc::UnboundedSender<Channel<client::Msg>>;
type ForwardRegistry = Arc<Mutex<HashMap<u32, ForwardedChannelSender>>>;

struct AcceptAllHostKeys {
    forwards: ForwardRegistry,
}

impl client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // A strict deployment plugs in known-hosts verification here; left
        // permissive because the knownhosts store is an external
        // collaborator per spec.md §6.
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let forwards = self.forwards.lock().await;
        if let Some(sender) = forwards.get(&connected_port) {
            let _ = sender.send(channel);
        } else {
            warn!(
                port = connected_port,
                address = connected_address,
                "forwarded-tcpip channel with no registered listener"
            );
        }
        Ok(())
    }
}

pub struct RusshConnection {
    handle: Mutex<Handle<AcceptAllHostKeys>>,
    forwards: ForwardRegistry,
}

#[async_trait]
impl SshSession for RusshConnection {
    async fn is_alive(&self) -> bool {
        // `channel_open_session` is cheap relative to a full reconnect and
        // is the validator kftray's connection pool uses for liveness too.
        self.handle.lock().await.channel_open_session().await.is_ok()
    }

    async fn close(&self) {
        let _ = self
            .handle
            .lock()
            .await
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

impl RusshConnection {
    /// Opens a `direct-tcpip` channel and returns it as a plain
    /// `AsyncRead + AsyncWrite` stream, used by both local forwards and the
    /// SOCKS5 dynamic forward to bridge an accepted client.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_addr: &str,
        originator_port: u32,
    ) -> Result<russh::ChannelStream<client::Msg>, CrossExecError> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_direct_tcpip(host, port, originator_addr, originator_port)
            .await
            .map_err(|e| CrossExecError::ConnectionError {
                message: format!("direct-tcpip open failed: {e}"),
                context: ErrorContext::new().with_host(host),
                cause: None,
                suggestions: vec![],
            })?;
        Ok(channel.into_stream())
    }

    /// Asks the server to listen on `bind_port` (0 ⇒ server-assigned) and
    /// registers `sender` to receive each `forwarded-tcpip` channel the
    /// server opens back for connections on that port. Returns the port the
    /// server actually bound.
    pub async fn request_remote_forward(
        &self,
        bind_address: &str,
        bind_port: u32,
        sender: ForwardedChannelSender,
    ) -> Result<u32, CrossExecError> {
        let bound_port = self
            .handle
            .lock()
            .await
            .tcpip_forward(bind_address, bind_port)
            .await
            .map_err(|e| CrossExecError::ConnectionError {
                message: format!("tcpip-forward request failed: {e}"),
                context: ErrorContext::new().with_host(bind_address),
                cause: None,
                suggestions: vec![],
            })?;
        let effective_port = if bind_port == 0 { bound_port } else { bind_port };
        self.forwards.lock().await.insert(effective_port, sender);
        Ok(effective_port)
    }

    pub async fn cancel_remote_forward(&self, bind_address: &str, bind_port: u32) {
        self.forwards.lock().await.remove(&bind_port);
        let _ = self
            .handle
            .lock()
            .await
            .cancel_tcpip_forward(bind_address, bind_port)
            .await;
    }
}

/// Opens a new `RusshConnection`; passed to `Pool::new` as the `ConnectFn`.
pub async fn connect(target: SshTarget) -> Result<RusshConnection, CrossExecError> {
    let config = Arc::new(client::Config::default());
    let addr = (target.host.as_str(), target.port);
    let forwards: ForwardRegistry = Arc::new(Mutex::new(HashMap::new()));
    let mut handle = client::connect(
        config,
        addr,
        AcceptAllHostKeys {
            forwards: forwards.clone(),
        },
    )
    .await
    .map_err(|e| CrossExecError::ConnectionError {
        message: e.to_string(),
        context: ErrorContext::new().with_host(&target.host),
        cause: None,
        suggestions: vec![],
    })?;

    let authenticated = match &target.auth {
        SshAuth::Password(password) => handle
            .authenticate_password(&target.user, password)
            .await
            .map_err(|e| CrossExecError::AuthenticationError {
                message: e.to_string(),
                context: ErrorContext::new().with_host(&target.host),
            })?,
        SshAuth::KeyFile { path, passphrase } => {
            let key_pair = russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                CrossExecError::AuthenticationError {
                    message: format!("failed to load key {path}: {e}"),
                    context: ErrorContext::new().with_host(&target.host),
                }
            })?;
            handle
                .authenticate_publickey(&target.user, Arc::new(key_pair))
                .await
                .map_err(|e| CrossExecError::AuthenticationError {
                    message: e.to_string(),
                    context: ErrorContext::new().with_host(&target.host),
                })?
        }
        SshAuth::Agent => {
            return Err(CrossExecError::AuthenticationError {
                message: "agent auth requires an external agent-socket collaborator".into(),
                context: ErrorContext::new().with_host(&target.host),
            })
        }
    };

    if !authenticated {
        return Err(CrossExecError::AuthenticationError {
            message: "ssh authentication rejected".into(),
            context: ErrorContext::new().with_host(&target.host),
        });
    }

    Ok(RusshConnection {
        handle: Mutex::new(handle),
        forwards,
    })
}

pub struct SshAdapter {
    pool: Arc<Pool<RusshConnection>>,
    default_key: PoolKey,
}

impl SshAdapter {
    pub fn new(pool: Arc<Pool<RusshConnection>>, default_key: PoolKey) -> Self {
        Self { pool, default_key }
    }

    /// Borrows a session for a tunnel's lifetime. Unlike `exec`'s
    /// acquire-then-release-immediately pattern, the tunnel keeps using this
    /// connection directly: `russh` multiplexes channels over one session,
    /// so sharing it with concurrent `exec` dispatches is safe. The pool
    /// slot itself is released right away so it doesn't stay pinned for as
    /// long as the tunnel is open.
    pub async fn acquire_session(&self) -> Result<Arc<RusshConnection>, CrossExecError> {
        let pooled = self.pool.acquire(&self.default_key).await?;
        let session = pooled.session.clone();
        self.pool.release(pooled);
        Ok(session)
    }

    /// Builds the remote command line and, when sudo is configured, the
    /// password to deliver over the channel's stdin once it's open. The
    /// password never appears in the command line itself — only in the
    /// returned tuple's second slot, which `run_exec` writes via
    /// `channel.data` and which `crate::mask` scrubs from logged commands.
    fn remote_command_line(spec: &ExecutionSpec) -> (String, Option<String>) {
        let mut parts = Vec::new();
        if let Some(cwd) = &spec.cwd {
            parts.push(format!("cd {}", crate::quoting::quote(cwd)));
        }
        for (k, v) in &spec.env {
            parts.push(format!("export {}={}", k, crate::quoting::quote(v)));
        }
        let command = match &spec.shell {
            ShellPolicy::Disabled => spec.argv.clone().unwrap_or_default().join(" "),
            _ => spec.command.clone(),
        };
        let mut sudo_password = None;
        if let Some(sudo) = &spec.sudo {
            parts.push(format!("sudo -S -p '' {command}"));
            sudo_password = sudo.password.clone();
        } else {
            parts.push(command);
        }
        (parts.join(" && "), sudo_password)
    }
}

#[async_trait]
impl super::super::Adapter for SshAdapter {
    fn tag(&self) -> &'static str {
        "ssh"
    }

    async fn dispatch(&self, spec: &ExecutionSpec) -> Result<ExecutionResult, CrossExecError> {
        let target = SshTarget::try_from(&spec.target)?;
        let key = target.pool_key();
        let pooled = self.pool.acquire(&key).await?;

        let started_at = chrono::Utc::now();
        let start_instant = Instant::now();
        let (command_line, sudo_password) = Self::remote_command_line(spec);

        let exec_result = Self::run_exec(&pooled.session, &command_line, sudo_password.as_deref(), spec).await;
        self.pool.release(pooled);

        let (stdout, stderr, exit_code) = exec_result?;
        let ended_at = chrono::Utc::now();

        Ok(ExecutionResult {
            command: spec.command.clone(),
            stdout,
            stderr,
            exit_code,
            signal: None,
            started_at,
            ended_at,
            duration: start_instant.elapsed(),
            adapter_tag: "ssh",
            target_descriptor: format!("{}@{}:{}", target.user, target.host, target.port),
            cause: None,
            cached_at: None,
        })
    }
}

impl SshAdapter {
    async fn run_exec(
        session: &RusshConnection,
        command_line: &str,
        sudo_password: Option<&str>,
        spec: &ExecutionSpec,
    ) -> Result<(Bytes, Bytes, Option<i32>), CrossExecError> {
        let mut handle = session.handle.lock().await;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| CrossExecError::ConnectionError {
                message: e.to_string(),
                context: ErrorContext::new().with_command(command_line),
                cause: None,
                suggestions: vec![],
            })?;
        channel
            .exec(true, command_line.as_bytes())
            .await
            .map_err(|e| CrossExecError::AdapterError {
                adapter: "ssh",
                message: e.to_string(),
                context: ErrorContext::new().with_command(command_line),
                transient: true,
                cause: None,
            })?;

        if let Some(password) = sudo_password {
            let mut line = password.as_bytes().to_vec();
            line.push(b'\n');
            channel
                .data(line.as_slice())
                .await
                .map_err(|e| CrossExecError::AdapterError {
                    adapter: "ssh",
                    message: format!("failed to write sudo password: {e}"),
                    context: ErrorContext::new().with_command(command_line),
                    transient: true,
                    cause: None,
                })?;
        }
        if let StdinSource::Bytes(bytes) = &spec.stdin {
            channel
                .data(bytes.as_ref())
                .await
                .map_err(|e| CrossExecError::AdapterError {
                    adapter: "ssh",
                    message: format!("failed to write stdin: {e}"),
                    context: ErrorContext::new().with_command(command_line),
                    transient: true,
                    cause: None,
                })?;
        }
        channel
            .eof()
            .await
            .map_err(|e| CrossExecError::AdapterError {
                adapter: "ssh",
                message: format!("failed to close stdin: {e}"),
                context: ErrorContext::new().with_command(command_line),
                transient: true,
                cause: None,
            })?;

        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();
        let mut exit_code = None;

        let read_loop = async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, .. }) => stderr.extend_from_slice(&data),
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status as i32)
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        };

        match spec.timeout {
            Some(deadline) => {
                tokio_timeout(deadline, read_loop)
                    .await
                    .map_err(|_| CrossExecError::TimeoutError {
                        elapsed_ms: deadline.as_millis() as u64,
                        context: ErrorContext::new().with_command(command_line),
                        partial_stdout: stdout.to_vec(),
                        partial_stderr: stderr.to_vec(),
                    })?;
            }
            None => read_loop.await,
        }

        Ok((stdout.freeze(), stderr.freeze(), exit_code))
    }
}

/// Builds the `BTreeMap` merge used when `Engine::ssh(opts)` stacks onto an
/// existing env; kept here since it is SSH-specific (sudo env handling).
pub fn merge_env(base: &BTreeMap<String, String>, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_command_line_includes_cwd_and_env() {
        let mut spec = ExecutionSpec::new(
            "echo hi",
            Target::Ssh {
                host: "h".into(),
                port: 22,
                user: "u".into(),
                auth: SshAuth::Agent,
            },
        );
        spec.cwd = Some("/tmp".into());
        spec.env.insert("FOO".into(), "bar".into());

        let (line, password) = SshAdapter::remote_command_line(&spec);
        assert!(line.contains("cd /tmp"));
        assert!(line.contains("export FOO=bar"));
        assert!(line.ends_with("echo hi"));
        assert!(password.is_none());
    }

    #[test]
    fn remote_command_line_carries_sudo_password_out_of_band() {
        let mut spec = ExecutionSpec::new(
            "whoami",
            Target::Ssh {
                host: "h".into(),
                port: 22,
                user: "u".into(),
                auth: SshAuth::Agent,
            },
        );
        spec.sudo = Some(crate::engine::spec::SudoOptions {
            password: Some("hunter2".into()),
        });

        let (line, password) = SshAdapter::remote_command_line(&spec);
        assert!(line.contains("sudo -S -p ''"));
        assert!(!line.contains("hunter2"));
        assert_eq!(password.as_deref(), Some("hunter2"));
    }
}
