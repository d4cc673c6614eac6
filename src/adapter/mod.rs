//! The pluggable transport trait implemented by the four adapters.
//!
//! Generalized from the teacher's `ProcessEnvironment` trait
//! (`environment/traits.rs`) and its second instance, `BackupAdapter`
//! (`backup/adapter.rs`) — the same "one trait, several transports" idiom
//! the teacher already uses twice.

use async_trait::async_trait;

use crate::engine::spec::{ExecutionResult, ExecutionSpec};
use crate::error::CrossExecError;

pub mod local;
pub mod container;
pub mod pod;
pub mod ssh;

/// Adapters are forbidden from interpreting semantics (retry, caching,
/// quoting) — they only translate an `ExecutionSpec` into a transport-level
/// invocation and report back an `ExecutionResult` (spec.md §9).
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short identifier used in events, errors and `ExecutionResult::adapter_tag`.
    fn tag(&self) -> &'static str;

    async fn dispatch(&self, spec: &ExecutionSpec) -> Result<ExecutionResult, CrossExecError>;
}
