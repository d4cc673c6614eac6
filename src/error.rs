//! Unified error taxonomy for the execution engine.
//!
//! Every adapter, the pool, the cache and the stream engine funnel their
//! failures through [`CrossExecError`] so that retry classification,
//! suggestion enhancement and masking all have a single place to live.

use std::collections::BTreeMap;
use std::fmt;

/// Context attached to an error: which target it happened against and what
/// was being run. `command` is the only field masking ever touches.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub host: Option<String>,
    pub container: Option<String>,
    pub pod: Option<String>,
    pub command: Option<String>,
    pub cwd: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_pod(mut self, pod: impl Into<String>) -> Self {
        self.pod = Some(pod.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(h) = &self.host {
            parts.push(format!("host={h}"));
        }
        if let Some(c) = &self.container {
            parts.push(format!("container={c}"));
        }
        if let Some(p) = &self.pod {
            parts.push(format!("pod={p}"));
        }
        if let Some(cwd) = &self.cwd {
            parts.push(format!("cwd={cwd}"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Resource-exhaustion sub-kind, distinguished because callers branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    QueueTimeout,
    QueueFull,
    PortInUse,
}

#[derive(Debug, thiserror::Error)]
pub enum CrossExecError {
    #[error("command exited non-zero (code {exit_code:?}): {context}")]
    CommandError {
        exit_code: Option<i32>,
        context: ErrorContext,
        partial_stdout: Vec<u8>,
        partial_stderr: Vec<u8>,
        suggestions: Vec<String>,
    },

    #[error("timed out after {elapsed_ms}ms: {context}")]
    TimeoutError {
        elapsed_ms: u64,
        context: ErrorContext,
        partial_stdout: Vec<u8>,
        partial_stderr: Vec<u8>,
    },

    #[error("cancelled: {context}")]
    CancelledError {
        context: ErrorContext,
        partial_stdout: Vec<u8>,
        partial_stderr: Vec<u8>,
    },

    #[error("connection failed: {context}: {message}")]
    ConnectionError {
        message: String,
        context: ErrorContext,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
        suggestions: Vec<String>,
    },

    #[error("authentication failed: {context}: {message}")]
    AuthenticationError { message: String, context: ErrorContext },

    #[error("adapter error ({adapter}): {message}")]
    AdapterError {
        adapter: &'static str,
        message: String,
        context: ErrorContext,
        transient: bool,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("resource error ({kind:?}): {message}")]
    ResourceError {
        kind: ResourceKind,
        message: String,
        context: ErrorContext,
    },

    #[error("validation error: {message}")]
    ValidationError { message: String },

    #[error("stream error: {message}")]
    StreamError { message: String, context: ErrorContext },

    #[error("cache error: {message}")]
    CacheError { message: String },
}

impl CrossExecError {
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::CommandError { context, .. }
            | Self::TimeoutError { context, .. }
            | Self::CancelledError { context, .. }
            | Self::ConnectionError { context, .. }
            | Self::AuthenticationError { context, .. }
            | Self::AdapterError { context, .. }
            | Self::ResourceError { context, .. }
            | Self::StreamError { context, .. } => Some(context),
            Self::ValidationError { .. } | Self::CacheError { .. } => None,
        }
    }

    /// Additive enhancement: appends suggestions based on exit code/kind,
    /// never discards any original field.
    pub fn enhance(mut self) -> Self {
        if let Self::CommandError {
            exit_code,
            ref mut suggestions,
            ..
        } = self
        {
            match exit_code {
                Some(127) => suggestions.push("command not found; check PATH".into()),
                Some(126) => suggestions.push("not executable; check permissions".into()),
                _ => {}
            }
        }
        if let Self::ConnectionError {
            ref message,
            ref mut suggestions,
            ..
        } = self
        {
            if message.to_lowercase().contains("refused") {
                suggestions.push("check host and port".into());
            }
        }
        self
    }

    /// Exit code, when this error resulted from a completed process.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandError { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CrossExecError>;
