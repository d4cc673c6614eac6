//! crossexec: a universal command-execution engine.
//!
//! `Engine` is an immutable, cheaply-cloned context (working directory,
//! environment, timeout, retry policy, target) that derives new contexts
//! without mutating the parent. Calling `Engine::exec` builds a deferred
//! `CommandHandle`, which dispatches through one of four adapters —
//! local process, SSH (pooled), container (`bollard`) or Kubernetes pod
//! (`kube`) — the first time it's awaited, memoizing the result for any
//! later awaits.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod mask;
pub mod quoting;
pub mod retry;
pub mod stream;

pub use cache::{CachePolicy, CacheStats, ResultCache};
pub use engine::{
    CommandHandle, DockerOptions, Engine, EngineOptions, ExecValue, ExecutionResult,
    ExecutionSpec, K8sOptions, PipedHandle, PortForwardHandle, ShellPolicy, Sink, SshAuth,
    SshOptions, StdinSource, SudoOptions, Target, TunnelSpec,
};
pub use error::{CrossExecError, ErrorContext, ResourceKind, Result};
pub use events::{Event, EventBus};
pub use retry::{RetryPolicy, RetryStrategy};
