//! The single `ExecutionSpec` struct every adapter consumes (spec.md §9:
//! "Keep a single ExecutionSpec struct that all adapters consume; adapters
//! are responsible only for transport and are forbidden from interpreting
//! semantics").

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use crate::stream::ChunkSender;

/// Shell policy: whether/how the command is wrapped in a shell invocation.
#[derive(Debug, Clone)]
pub enum ShellPolicy {
    /// Use the platform/adapter default shell (`$SHELL` on local, `/bin/sh`
    /// over SSH/container/pod, inspected only when this variant is active).
    Default,
    /// Use a specific named shell executable.
    Named(String),
    /// No shell: `argv[0]` is the first template fragment, all interpolated
    /// values become separate argv entries, unquoted.
    Disabled,
}

/// Where stdin for the command comes from.
#[derive(Debug, Clone, Default)]
pub enum StdinSource {
    #[default]
    None,
    Bytes(Bytes),
    /// Adapter reads from this channel until it closes.
    Stream,
}

/// Where a stdout/stderr byte chunk goes.
#[derive(Clone, Default)]
pub enum Sink {
    #[default]
    Pipe,
    Inherit,
    Ignore,
    /// Chunks are forwarded on this channel as they arrive.
    Stream(ChunkSender),
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipe => write!(f, "Pipe"),
            Self::Inherit => write!(f, "Inherit"),
            Self::Ignore => write!(f, "Ignore"),
            Self::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// Authentication material for an SSH target. Credential *resolution*
/// (reading key files, prompting, agent lookup) is the external credential
/// provider's job (spec.md §6); this just names which method to use.
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    KeyFile {
        path: String,
        passphrase: Option<String>,
    },
    Agent,
}

impl SshAuth {
    /// Fingerprint fed into the pool key so distinct credentials to the same
    /// host never share a pooled connection.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Password(_) => "password".to_string(),
            Self::KeyFile { path, .. } => format!("key:{path}"),
            Self::Agent => "agent".to_string(),
        }
    }
}

/// Adapter-specific target selection, carried alongside the
/// transport-agnostic fields of `ExecutionSpec`.
#[derive(Debug, Clone)]
pub enum Target {
    Local,
    Ssh {
        host: String,
        port: u16,
        user: String,
        auth: SshAuth,
    },
    Container {
        container_id: String,
    },
    Pod {
        namespace: String,
        pod: String,
        container: Option<String>,
    },
}

/// Fully merged description of one command dispatch: engine context +
/// handle overrides + defaults, built once per await (spec.md §4.1 step 5).
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub command: String,
    pub argv: Option<Vec<String>>,
    pub shell: ShellPolicy,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub kill_grace: Duration,
    pub target: Target,
    pub interactive: bool,
    pub stdin: StdinSource,
    pub stdout_sink: Sink,
    pub stderr_sink: Sink,
    pub max_buffered_bytes: usize,
    pub sudo: Option<SudoOptions>,
}

#[derive(Debug, Clone)]
pub struct SudoOptions {
    pub password: Option<String>,
}

impl ExecutionSpec {
    pub fn new(command: impl Into<String>, target: Target) -> Self {
        Self {
            command: command.into(),
            argv: None,
            shell: ShellPolicy::Default,
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
            kill_grace: Duration::from_secs(5),
            target,
            interactive: false,
            stdin: StdinSource::None,
            stdout_sink: Sink::Pipe,
            stderr_sink: Sink::Pipe,
            max_buffered_bytes: 100 * 1024 * 1024,
            sudo: None,
        }
    }
}

/// Result of one adapter dispatch (spec.md §3 "ExecutionResult").
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub command: String,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,
    pub adapter_tag: &'static str,
    pub target_descriptor: String,
    pub cause: Option<String>,
    pub cached_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ExecutionResult {
    /// `ok` ⇔ exitCode == 0 ∧ signal == none ∧ cause == none (spec.md §3).
    pub fn ok(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none() && self.cause.is_none()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}
