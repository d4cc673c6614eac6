//! `Engine`: the immutable, structurally-shared execution context
//! (spec.md §3 "Engine (immutable context)", §4.1).
//!
//! Every modifier returns a new `Engine` wrapping a fresh `Arc<EngineInner>`
//! that clones the fields it doesn't change — the same "derive, don't
//! mutate" shape `Manager`/`Configuration` use for server-scoped state in
//! the teacher, generalized here to contextual derivation instead of a
//! singleton.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::adapter::container::ContainerAdapter;
use crate::adapter::pod::PodAdapter;
use crate::adapter::ssh::adapter::{connect as ssh_connect, RusshConnection, SshAdapter, SshTarget};
use crate::adapter::ssh::pool::{Pool, PoolConfig};
use crate::adapter::local::LocalAdapter;
use crate::adapter::Adapter;
use crate::cache::{CachePolicy, ResultCache};
use crate::error::CrossExecError;
use crate::events::EventBus;
use crate::retry::RetryPolicy;

use super::handle::{CommandHandle, ExecValue};
use super::spec::{ShellPolicy, SshAuth, Target};

/// Resolved adapters available to a root engine. Child engines share this
/// registry by `Arc`; only `Target` selection differs between them.
pub(crate) struct AdapterRegistry {
    pub local: Arc<LocalAdapter>,
    pub ssh: Option<Arc<SshAdapter>>,
    pub container: Option<Arc<ContainerAdapter>>,
    pub pod: Option<Arc<PodAdapter>>,
}

impl AdapterRegistry {
    fn bare() -> Self {
        Self {
            local: Arc::new(LocalAdapter::new()),
            ssh: None,
            container: None,
            pod: None,
        }
    }

    pub(crate) fn for_target(&self, target: &Target) -> Result<Arc<dyn Adapter>, CrossExecError> {
        match target {
            Target::Local => Ok(self.local.clone() as Arc<dyn Adapter>),
            Target::Ssh { .. } => self
                .ssh
                .clone()
                .map(|a| a as Arc<dyn Adapter>)
                .ok_or_else(|| CrossExecError::ValidationError {
                    message: "no SSH adapter configured; call Engine::ssh(..) first".into(),
                }),
            Target::Container { .. } => self
                .container
                .clone()
                .map(|a| a as Arc<dyn Adapter>)
                .ok_or_else(|| CrossExecError::ValidationError {
                    message: "no container adapter configured; call Engine::docker(..) first".into(),
                }),
            Target::Pod { .. } => self
                .pod
                .clone()
                .map(|a| a as Arc<dyn Adapter>)
                .ok_or_else(|| CrossExecError::ValidationError {
                    message: "no pod adapter configured; call Engine::k8s(..) first".into(),
                }),
        }
    }
}

pub(crate) struct EngineInner {
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub shell: ShellPolicy,
    pub target: Target,
    pub retry: RetryPolicy,
    pub cache_policy: Option<CachePolicy>,
    pub throw_on_nonzero: bool,
    pub cancel: CancellationToken,
    pub events: EventBus,
    pub cache: Arc<ResultCache>,
    pub adapters: Arc<AdapterRegistry>,
}

/// Options bundle for `Engine::with` (spec.md §4.1 `With(options struct)`).
#[derive(Default, Clone)]
pub struct EngineOptions {
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    pub throw_on_nonzero: Option<bool>,
}

/// Options for selecting an SSH target (spec.md §4.3).
#[derive(Clone)]
pub struct SshOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
    pub pool: PoolConfig,
}

#[derive(Clone, Default)]
pub struct DockerOptions {
    pub container_id: String,
}

#[derive(Clone, Default)]
pub struct K8sOptions {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
}

/// Immutable, cheaply-cloneable execution context (spec.md §3).
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    /// Root engine: no adapters configured beyond Local, fresh cache and
    /// event bus. Call `.ssh(..)`/`.docker(..)`/`.k8s(..)` to add transports.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                cwd: None,
                env: BTreeMap::new(),
                timeout: None,
                shell: ShellPolicy::Default,
                target: Target::Local,
                retry: RetryPolicy::none(),
                cache_policy: None,
                throw_on_nonzero: true,
                cancel: CancellationToken::new(),
                events: EventBus::new(),
                cache: Arc::new(ResultCache::new(10_000, 256 * 1024 * 1024, None)),
                adapters: Arc::new(AdapterRegistry::bare()),
            }),
        }
    }

    fn derive(&self, f: impl FnOnce(&mut EngineInner)) -> Self {
        let mut inner = EngineInner {
            cwd: self.inner.cwd.clone(),
            env: self.inner.env.clone(),
            timeout: self.inner.timeout,
            shell: self.inner.shell.clone(),
            target: self.inner.target.clone(),
            retry: self.inner.retry.clone(),
            cache_policy: self.inner.cache_policy.clone(),
            throw_on_nonzero: self.inner.throw_on_nonzero,
            cancel: self.inner.cancel.child_token(),
            events: self.inner.events.clone(),
            cache: self.inner.cache.clone(),
            adapters: self.inner.adapters.clone(),
        };
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.inner.cache
    }

    /// `Cd(path)`.
    pub fn cd(&self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.derive(|inner| inner.cwd = Some(path))
    }

    /// `Env(map)`: merges onto the existing map; a value of `""` removes the
    /// key (spec.md §4.1 "Edge cases").
    pub fn env<I, K, V>(&self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: Vec<(String, String)> = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.derive(|inner| {
            for (k, v) in vars {
                if v.is_empty() {
                    inner.env.remove(&k);
                } else {
                    inner.env.insert(k, v);
                }
            }
        })
    }

    /// `Timeout(d)`. A zero duration disables the timeout; negative durations
    /// cannot be represented by `Duration` in Rust, so callers reaching for
    /// that edge case get a `ValidationError` at dispatch time instead (the
    /// type system already rules it out here).
    pub fn timeout(&self, d: Duration) -> Self {
        self.derive(|inner| {
            inner.timeout = if d.is_zero() { None } else { Some(d) };
        })
    }

    pub fn shell(&self, policy: ShellPolicy) -> Self {
        self.derive(|inner| inner.shell = policy)
    }

    pub fn retry(&self, policy: RetryPolicy) -> Self {
        self.derive(|inner| inner.retry = policy)
    }

    pub fn cache_policy(&self, policy: CachePolicy) -> Self {
        self.derive(|inner| inner.cache_policy = Some(policy))
    }

    pub fn with(&self, opts: EngineOptions) -> Self {
        self.derive(|inner| {
            if let Some(t) = opts.timeout {
                inner.timeout = Some(t);
            }
            if let Some(r) = opts.retry {
                inner.retry = r;
            }
            if opts.cache_policy.is_some() {
                inner.cache_policy = opts.cache_policy;
            }
            if let Some(throw) = opts.throw_on_nonzero {
                inner.throw_on_nonzero = throw;
            }
        })
    }

    /// `Local()`: switches target back to the local host.
    pub fn local(&self) -> Self {
        self.derive(|inner| inner.target = Target::Local)
    }

    /// `Ssh(opts)`: connects (or reuses) a pool for this target and switches
    /// the derived engine's target to it.
    pub async fn ssh(&self, opts: SshOptions) -> Result<Self, CrossExecError> {
        let target = SshTarget {
            host: opts.host.clone(),
            port: opts.port,
            user: opts.user.clone(),
            auth: opts.auth.clone(),
        };
        let events = self.inner.events.clone();
        let pool = Arc::new(Pool::new(
            opts.pool.clone(),
            Arc::new(move |key: String| {
                let target = target.clone();
                Box::pin(async move {
                    let _ = &key;
                    ssh_connect(target).await
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<RusshConnection, CrossExecError>> + Send>>
            }),
            Some(events),
        ));
        let default_key = SshTarget {
            host: opts.host.clone(),
            port: opts.port,
            user: opts.user.clone(),
            auth: opts.auth.clone(),
        }
        .pool_key();
        let adapter = Arc::new(SshAdapter::new(pool, default_key));

        Ok(self.derive(|inner| {
            inner.adapters = Arc::new(AdapterRegistry {
                local: inner.adapters.local.clone(),
                ssh: Some(adapter.clone()),
                container: inner.adapters.container.clone(),
                pod: inner.adapters.pod.clone(),
            });
            inner.target = Target::Ssh {
                host: opts.host,
                port: opts.port,
                user: opts.user,
                auth: opts.auth,
            };
        }))
    }

    /// `Docker(opts)`: connects to the local Docker daemon and targets the
    /// named container.
    pub async fn docker(&self, opts: DockerOptions) -> Result<Self, CrossExecError> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            CrossExecError::ConnectionError {
                message: format!("failed to connect to docker: {e}"),
                context: crate::error::ErrorContext::new(),
                cause: None,
                suggestions: vec!["check DOCKER_HOST and daemon availability".into()],
            }
        })?;
        let adapter = Arc::new(ContainerAdapter::new(docker));
        Ok(self.derive(|inner| {
            inner.adapters = Arc::new(AdapterRegistry {
                local: inner.adapters.local.clone(),
                ssh: inner.adapters.ssh.clone(),
                container: Some(adapter.clone()),
                pod: inner.adapters.pod.clone(),
            });
            inner.target = Target::Container {
                container_id: opts.container_id.clone(),
            };
        }))
    }

    /// `K8s(opts)`: builds a client from the ambient kubeconfig and targets
    /// the named pod/namespace/container.
    pub async fn k8s(&self, opts: K8sOptions) -> Result<Self, CrossExecError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| CrossExecError::ConnectionError {
                message: format!("failed to build kube client: {e}"),
                context: crate::error::ErrorContext::new(),
                cause: None,
                suggestions: vec!["check KUBECONFIG / in-cluster service account".into()],
            })?;
        let adapter = Arc::new(PodAdapter::new(client));
        Ok(self.derive(|inner| {
            inner.adapters = Arc::new(AdapterRegistry {
                local: inner.adapters.local.clone(),
                ssh: inner.adapters.ssh.clone(),
                container: inner.adapters.container.clone(),
                pod: Some(adapter.clone()),
            });
            inner.target = Target::Pod {
                namespace: opts.namespace.clone(),
                pod: opts.pod.clone(),
                container: opts.container.clone(),
            };
        }))
    }

    /// `Signal(abortToken)`: cancels this engine's derived token tree. All
    /// handles built from this engine (and its children) observe the
    /// cancellation.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// `Engine.Exec(template, values...)`: builds a quoted command line from
    /// literal fragments and interpolated values, returning an unstarted
    /// `CommandHandle`. Rust has no tagged-template syntax, so fragments are
    /// passed as a slice already split around each value's position. A
    /// value may be a plain string, an array (interpolated as
    /// space-separated quoted tokens), or a nested handle (awaited and
    /// substituted by its trimmed stdout at dispatch time).
    pub fn exec(&self, fragments: &[&str], values: &[ExecValue]) -> CommandHandle {
        CommandHandle::new(self.clone(), owned_fragments(fragments), values.to_vec(), true)
    }

    /// `Engine.Raw(template, values...)`: identical, without quoting.
    pub fn raw(&self, fragments: &[&str], values: &[ExecValue]) -> CommandHandle {
        CommandHandle::new(self.clone(), owned_fragments(fragments), values.to_vec(), false)
    }

    /// `Engine.Dispose()`: drains pools, clears the cache's in-flight
    /// futures with `CancelledError`, and cancels this engine's token tree
    /// so any outstanding handles observe cancellation.
    pub async fn dispose(&self) {
        self.inner.cache.clear();
        self.cancel();
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn owned_fragments(fragments: &[&str]) -> Vec<String> {
    fragments.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_engine_does_not_mutate_parent() {
        let root = Engine::new();
        let child = root.cd("/tmp");
        assert!(root.inner.cwd.is_none());
        assert_eq!(child.inner.cwd.as_deref(), Some("/tmp"));
    }

    #[test]
    fn env_merge_removes_empty_values() {
        let root = Engine::new().env([("A", "1"), ("B", "2")]);
        let child = root.env([("A", "")]);
        assert!(!child.inner.env.contains_key("A"));
        assert_eq!(child.inner.env.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn exec_quotes_interpolated_values() {
        let engine = Engine::new();
        let handle = engine.exec(&["echo ", ""], &[ExecValue::Str("hello world".to_string())]);
        assert!(handle.command_line().contains("'hello world'"));
    }
}
