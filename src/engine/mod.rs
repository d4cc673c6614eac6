//! Public entry point: the immutable `Engine` and the deferred
//! `CommandHandle` it produces (spec.md §4.1).

pub mod context;
pub mod handle;
pub mod spec;
pub mod tunnel;

pub use context::{DockerOptions, Engine, EngineOptions, K8sOptions, SshOptions};
pub use handle::{CommandHandle, ExecValue, PipedHandle};
pub use spec::{ExecutionResult, ExecutionSpec, ShellPolicy, Sink, SshAuth, StdinSource, SudoOptions, Target};
pub use tunnel::{PortForwardHandle, TunnelSpec};
