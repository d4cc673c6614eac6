//! `CommandHandle`: the deferred, chainable invocation (spec.md §3
//! "CommandHandle (deferred invocation)", §4.1).
//!
//! The Built/Started/Settled one-shot latch follows the same "claim a slot,
//! everyone else joins" shape as the result cache's single-flight map
//! (`cache::ResultCache::get_or_claim`) — here guarding a single handle's
//! dispatch instead of a cache key's.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::CrossExecError;
use crate::mask::Masker;
use crate::retry::RetryPolicy;
use crate::stream::{ChunkSender, ChunkStream, LineReader, LineReaderOptions};

use super::context::Engine;
use super::spec::{ExecutionResult, ExecutionSpec, ShellPolicy, Sink, StdinSource, SudoOptions};

const BUILT: u8 = 0;
const STARTED: u8 = 1;
const SETTLED: u8 = 2;

/// Per-handle overrides layered onto the captured `Engine` at dispatch time
/// (spec.md §4.1 "CommandHandle contract").
#[derive(Default, Clone)]
struct Overrides {
    quiet: bool,
    verbose: bool,
    nothrow: bool,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    cache_key: Option<String>,
    cache_ttl: Option<Duration>,
    cwd: Option<String>,
    env: BTreeMap<String, String>,
    stdin: StdinSource,
    stdout_sink: Sink,
    stderr_sink: Sink,
    interactive: bool,
    shell: Option<ShellPolicy>,
    sudo: Option<SudoOptions>,
    invalidate_on: Vec<String>,
}

/// One interpolated template value (spec.md §4.1 "Template is an alternating
/// sequence of literal fragments and interpolated values (strings, byte
/// slices, nested handles, or promise-like result values)").
#[derive(Clone)]
pub enum ExecValue {
    Str(String),
    /// Interpolates as space-separated tokens, quoted when the owning
    /// handle quotes (`Exec`), raw when it doesn't (`Raw`).
    Array(Vec<String>),
    /// Resolved by awaiting the nested handle and substituting its trimmed
    /// stdout, at the *outer* handle's dispatch time (spec.md "Interpolation
    /// of nested handles").
    Handle(Arc<CommandHandle>),
}

impl From<String> for ExecValue {
    fn from(s: String) -> Self {
        ExecValue::Str(s)
    }
}

impl From<&str> for ExecValue {
    fn from(s: &str) -> Self {
        ExecValue::Str(s.to_string())
    }
}

impl From<Vec<String>> for ExecValue {
    fn from(values: Vec<String>) -> Self {
        ExecValue::Array(values)
    }
}

impl From<Arc<CommandHandle>> for ExecValue {
    fn from(handle: Arc<CommandHandle>) -> Self {
        ExecValue::Handle(handle)
    }
}

impl ExecValue {
    /// Renders this value as its final interpolated token. `ancestors` is
    /// the chain of handle identities already being resolved on this call
    /// stack; a nested handle already present there would dispatch back
    /// into itself, so it fails with `ValidationError` instead of awaiting
    /// forever.
    async fn resolve(&self, quote: bool, ancestors: &[usize]) -> Result<String, CrossExecError> {
        match self {
            ExecValue::Str(s) => Ok(if quote { crate::quoting::quote(s) } else { s.clone() }),
            ExecValue::Array(items) => Ok(if quote {
                crate::quoting::quote_all(items)
            } else {
                crate::quoting::join_raw(items)
            }),
            ExecValue::Handle(handle) => {
                let handle_id = Arc::as_ptr(handle) as usize;
                if ancestors.contains(&handle_id) {
                    return Err(CrossExecError::ValidationError {
                        message: "cyclic command-handle interpolation detected".into(),
                    });
                }
                let result = handle.run_inner(ancestors).await?;
                Ok(result.stdout_text().trim_end_matches('\n').to_string())
            }
        }
    }
}

/// A command invocation captured but not yet dispatched. Chainable
/// modifiers mutate `overrides` until the handle transitions to `Started`;
/// after that, modifier calls return a `ValidationError` instead of
/// panicking, matching spec.md's "fails with a ProgrammingError".
pub struct CommandHandle {
    engine: Engine,
    fragments: Vec<String>,
    values: Vec<ExecValue>,
    /// `true` for `Engine::exec` (quoted), `false` for `Engine::raw`.
    quote: bool,
    state: AtomicU8,
    settle_notify: Arc<Notify>,
    settled: std::sync::Mutex<Option<Result<ExecutionResult, CrossExecError>>>,
    overrides: std::sync::Mutex<Overrides>,
    masker: Masker,
}

impl CommandHandle {
    pub(crate) fn new(engine: Engine, fragments: Vec<String>, values: Vec<ExecValue>, quote: bool) -> Self {
        Self {
            engine,
            fragments,
            values,
            quote,
            state: AtomicU8::new(BUILT),
            settle_notify: Arc::new(Notify::new()),
            settled: std::sync::Mutex::new(None),
            overrides: std::sync::Mutex::new(Overrides::default()),
            masker: Masker::default(),
        }
    }

    /// Best-effort synchronous preview of the command line, for logging
    /// contexts that fire before dispatch. Nested handles render as a
    /// placeholder since resolving them requires awaiting; `run_with_retry`'s
    /// `resolve_command_line` is the authoritative, dispatch-time version.
    pub fn command_line(&self) -> String {
        let mut out = String::new();
        for (i, fragment) in self.fragments.iter().enumerate() {
            out.push_str(fragment);
            if let Some(value) = self.values.get(i) {
                match value {
                    ExecValue::Str(s) => out.push_str(&if self.quote { crate::quoting::quote(s) } else { s.clone() }),
                    ExecValue::Array(items) => out.push_str(&if self.quote {
                        crate::quoting::quote_all(items)
                    } else {
                        crate::quoting::join_raw(items)
                    }),
                    ExecValue::Handle(_) => out.push_str("<pending>"),
                }
            }
        }
        out
    }

    /// Awaits every interpolated value in order, substituting nested handles
    /// by their trimmed stdout (spec.md "Interpolation of nested handles").
    /// `ancestors` carries the identities of handles already being resolved
    /// higher up the call stack, so a handle nested (directly or
    /// transitively) inside its own template is caught before it deadlocks
    /// waiting on itself.
    async fn resolve_command_line(&self, ancestors: &[usize]) -> Result<String, CrossExecError> {
        let mut next = ancestors.to_vec();
        next.push(self as *const CommandHandle as usize);

        let mut out = String::new();
        for (i, fragment) in self.fragments.iter().enumerate() {
            out.push_str(fragment);
            if let Some(value) = self.values.get(i) {
                out.push_str(&value.resolve(self.quote, &next).await?);
            }
        }
        Ok(out)
    }

    fn with_overrides<R>(&self, f: impl FnOnce(&mut Overrides) -> R) -> Result<R, CrossExecError> {
        if self.state.load(Ordering::SeqCst) != BUILT {
            return Err(CrossExecError::ValidationError {
                message: "chainable modifier applied after the handle started".into(),
            });
        }
        Ok(f(&mut self.overrides.lock().unwrap()))
    }

    pub fn quiet(self: Arc<Self>) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.quiet = true);
        self
    }

    pub fn verbose(self: Arc<Self>) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.verbose = true);
        self
    }

    pub fn no_throw(self: Arc<Self>) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.nothrow = true);
        self
    }

    pub fn timeout(self: Arc<Self>, d: Duration) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.timeout = Some(d));
        self
    }

    pub fn retry(self: Arc<Self>, policy: RetryPolicy) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.retry = Some(policy));
        self
    }

    pub fn cache(self: Arc<Self>, key: impl Into<String>, ttl: Duration) -> Arc<Self> {
        let key = key.into();
        let _ = self.with_overrides(|o| {
            o.cache_key = Some(key);
            o.cache_ttl = Some(ttl);
        });
        self
    }

    pub fn invalidate_on(self: Arc<Self>, key_prefix: impl Into<String>) -> Arc<Self> {
        let prefix = key_prefix.into();
        let _ = self.with_overrides(|o| o.invalidate_on.push(prefix));
        self
    }

    pub fn cwd(self: Arc<Self>, path: impl Into<String>) -> Arc<Self> {
        let path = path.into();
        let _ = self.with_overrides(|o| o.cwd = Some(path));
        self
    }

    pub fn env(self: Arc<Self>, vars: impl IntoIterator<Item = (String, String)>) -> Arc<Self> {
        let vars: Vec<_> = vars.into_iter().collect();
        let _ = self.with_overrides(|o| o.env.extend(vars));
        self
    }

    pub fn stdin_bytes(self: Arc<Self>, bytes: bytes::Bytes) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.stdin = StdinSource::Bytes(bytes));
        self
    }

    pub fn stdout(self: Arc<Self>, sink: Sink) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.stdout_sink = sink);
        self
    }

    pub fn stderr(self: Arc<Self>, sink: Sink) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.stderr_sink = sink);
        self
    }

    pub fn interactive(self: Arc<Self>) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.interactive = true);
        self
    }

    pub fn shell(self: Arc<Self>, policy: ShellPolicy) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.shell = Some(policy));
        self
    }

    pub fn sudo(self: Arc<Self>, opts: SudoOptions) -> Arc<Self> {
        let _ = self.with_overrides(|o| o.sudo = Some(opts));
        self
    }

    fn cache_key(&self, overrides: &Overrides) -> Option<String> {
        overrides
            .cache_key
            .clone()
            .or_else(|| self.engine.inner.cache_policy.as_ref().map(|p| p.key.clone()))
    }

    fn build_spec(&self, overrides: &Overrides, command: String) -> ExecutionSpec {
        let inner = &self.engine.inner;
        let mut spec = ExecutionSpec::new(command, inner.target.clone());
        spec.cwd = overrides.cwd.clone().or_else(|| inner.cwd.clone());
        spec.shell = overrides.shell.clone().unwrap_or_else(|| inner.shell.clone());
        spec.timeout = overrides.timeout.or(inner.timeout);
        spec.interactive = overrides.interactive;
        spec.stdin = match &overrides.stdin {
            StdinSource::None => StdinSource::None,
            StdinSource::Bytes(b) => StdinSource::Bytes(b.clone()),
            StdinSource::Stream => StdinSource::Stream,
        };
        spec.stdout_sink = overrides.stdout_sink.clone();
        spec.stderr_sink = overrides.stderr_sink.clone();
        spec.sudo = overrides.sudo.clone();

        // Env merge order (lowest to highest): process env, engine default
        // env, handle-override env (spec.md §4.1 "Edge cases").
        let mut env = BTreeMap::new();
        for (k, v) in std::env::vars() {
            env.insert(k, v);
        }
        for (k, v) in &inner.env {
            env.insert(k.clone(), v.clone());
        }
        for (k, v) in &overrides.env {
            env.insert(k.clone(), v.clone());
        }
        spec.env = env;
        spec
    }

    /// Awaits the handle. Idempotent: a second await returns the memoized
    /// settle-value without dispatching again (spec.md §4.1 step 1).
    pub async fn run(self: &Arc<Self>) -> Result<ExecutionResult, CrossExecError> {
        self.run_inner(&[]).await
    }

    /// `ancestors` is empty for a top-level `run()`; a nested-handle
    /// interpolation (`ExecValue::resolve`) passes the chain of handle
    /// identities already in flight so a cycle is caught by
    /// `ExecValue::resolve`'s check before it ever calls back in here —
    /// by the time a handle is `Started`, a second `run_inner` on it would
    /// just join the `settle_notify` wait and deadlock instead of erroring.
    async fn run_inner(self: &Arc<Self>, ancestors: &[usize]) -> Result<ExecutionResult, CrossExecError> {
        loop {
            match self.state.compare_exchange(
                BUILT,
                STARTED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return self.dispatch_and_settle(ancestors).await,
                Err(STARTED) => {
                    self.settle_notify.notified().await;
                    // fallthrough to re-check; loop picks up SETTLED below
                }
                Err(_settled) => {
                    let guard = self.settled.lock().unwrap();
                    return guard.clone().expect("settled state always carries a value");
                }
            }
            if self.state.load(Ordering::SeqCst) == SETTLED {
                let guard = self.settled.lock().unwrap();
                return guard.clone().expect("settled state always carries a value");
            }
        }
    }

    async fn dispatch_and_settle(self: &Arc<Self>, ancestors: &[usize]) -> Result<ExecutionResult, CrossExecError> {
        let result = self.dispatch_with_policies(ancestors).await;
        *self.settled.lock().unwrap() = Some(result.clone());
        self.state.store(SETTLED, Ordering::SeqCst);
        self.settle_notify.notify_waiters();
        result
    }

    async fn dispatch_with_policies(self: &Arc<Self>, ancestors: &[usize]) -> Result<ExecutionResult, CrossExecError> {
        let token = self.engine.cancellation_token();
        if token.is_cancelled() {
            return Err(CrossExecError::CancelledError {
                context: crate::error::ErrorContext::new().with_command(self.masker.mask(&self.command_line())),
                partial_stdout: Vec::new(),
                partial_stderr: Vec::new(),
            });
        }

        let overrides_snapshot = self.overrides.lock().unwrap().clone();

        let cache_key = self.cache_key(&overrides_snapshot);
        let cache_ttl = overrides_snapshot
            .cache_ttl
            .or_else(|| self.engine.inner.cache_policy.as_ref().map(|p| p.ttl));

        if let (Some(key), Some(ttl)) = (&cache_key, cache_ttl) {
            let policy = crate::cache::CachePolicy::new(key.clone(), ttl);
            if let Some(cached) = self.engine.inner.cache.get_or_claim(key).await? {
                return Ok(cached);
            }
            let result = self.run_with_retry(&overrides_snapshot, &token, ancestors).await;
            match &result {
                Ok(settled) => {
                    self.engine.inner.cache.publish(key, &policy, settled);
                    for prefix in &overrides_snapshot.invalidate_on {
                        self.engine.inner.cache.invalidate_on(prefix);
                    }
                }
                Err(_) => self.engine.inner.cache.abort_claim(key),
            }
            return self.apply_nothrow(result, overrides_snapshot.nothrow);
        }

        let result = self.run_with_retry(&overrides_snapshot, &token, ancestors).await;
        if result.is_ok() {
            for prefix in &overrides_snapshot.invalidate_on {
                self.engine.inner.cache.invalidate_on(prefix);
            }
        }
        self.apply_nothrow(result, overrides_snapshot.nothrow)
    }

    /// With `nothrow`, a failed dispatch is folded into an `ExecutionResult`
    /// carrying `cause`, instead of propagating the error (spec.md §3 "cause
    /// (if non-success and nothrow)").
    fn apply_nothrow(
        &self,
        result: Result<ExecutionResult, CrossExecError>,
        nothrow: bool,
    ) -> Result<ExecutionResult, CrossExecError> {
        match (result, nothrow) {
            (Err(e), true) => Ok(ExecutionResult {
                command: self.command_line(),
                stdout: bytes::Bytes::new(),
                stderr: bytes::Bytes::new(),
                exit_code: e.exit_code(),
                signal: None,
                started_at: chrono::Utc::now(),
                ended_at: chrono::Utc::now(),
                duration: Duration::default(),
                adapter_tag: "none",
                target_descriptor: String::new(),
                cause: Some(e.to_string()),
                cached_at: None,
            }),
            (other, _) => other,
        }
    }

    async fn run_with_retry(
        &self,
        overrides: &Overrides,
        token: &tokio_util::sync::CancellationToken,
        ancestors: &[usize],
    ) -> Result<ExecutionResult, CrossExecError> {
        let policy = overrides
            .retry
            .clone()
            .unwrap_or_else(|| self.engine.inner.retry.clone());
        let command = self.resolve_command_line(ancestors).await?;
        let spec = self.build_spec(overrides, command.clone());
        let adapter = self.engine.inner.adapters.for_target(&spec.target)?;

        self.engine
            .events()
            .publish_command_start(&self.masker.mask(&command), adapter.tag());

        let mut attempt = 1;
        loop {
            let dispatch = adapter.dispatch(&spec);
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(CrossExecError::CancelledError {
                    context: crate::error::ErrorContext::new().with_command(self.masker.mask(&command)),
                    partial_stdout: Vec::new(),
                    partial_stderr: Vec::new(),
                }),
                result = dispatch => result,
            };

            match outcome {
                Ok(mut result) => {
                    result.command = self.masker.mask(&result.command);
                    self.engine.events().publish_command_complete(
                        &result.command,
                        result.exit_code,
                        result.duration.as_millis() as u64,
                    );
                    if !result.ok() && self.engine.inner.throw_on_nonzero {
                        let context = crate::error::ErrorContext::new().with_command(&result.command);
                        let err = CrossExecError::CommandError {
                            exit_code: result.exit_code,
                            context,
                            partial_stdout: result.stdout.to_vec(),
                            partial_stderr: result.stderr.to_vec(),
                            suggestions: vec![],
                        }
                        .enhance();
                        self.engine
                            .events()
                            .publish_command_error(&self.masker.mask(&command), &err.to_string());
                        return Err(err);
                    }
                    return Ok(result);
                }
                Err(e) if attempt < policy.max_attempts && policy.should_retry(&e, attempt) => {
                    if let Some(on_retry) = &policy.on_retry {
                        on_retry(attempt, &e);
                    }
                    tokio::time::sleep(policy.delay_for(attempt + 1)).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.engine
                        .events()
                        .publish_command_error(&self.masker.mask(&command), &e.to_string());
                    return Err(e.enhance());
                }
            }
        }
    }

    /// `Text()`: awaits and returns stdout decoded, trimmed of a trailing
    /// newline.
    pub async fn text(self: &Arc<Self>) -> Result<String, CrossExecError> {
        let result = self.run().await?;
        Ok(result.stdout_text().trim_end_matches('\n').to_string())
    }

    /// `Lines()`: awaits and splits stdout on LF, dropping a trailing empty
    /// element.
    pub async fn lines(self: &Arc<Self>) -> Result<Vec<String>, CrossExecError> {
        let text = self.text().await?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(text.split('\n').map(str::to_string).collect())
    }

    /// `Json()`: awaits and decodes stdout as JSON.
    pub async fn json<T: serde::de::DeserializeOwned>(self: &Arc<Self>) -> Result<T, CrossExecError> {
        let result = self.run().await?;
        serde_json::from_slice(&result.stdout).map_err(|e| CrossExecError::ValidationError {
            message: format!("failed to decode stdout as json: {e}"),
        })
    }

    /// `Stream(opts)`: runs the handle with a live stdout stream instead of
    /// buffering, returning a `LineReader` over the chunks as they arrive.
    /// Requires the caller to have set a `Sink::Stream` stdout sink via
    /// `.stdout(Sink::Stream(tx))` beforehand; this method drives dispatch
    /// and returns the `LineReader` built from the paired receiver.
    pub fn stream_lines(capacity: usize) -> (ChunkSender, LineReader) {
        let (tx, stream) = ChunkStream::new(capacity);
        (tx, LineReader::new(stream, LineReaderOptions::default()))
    }

    pub fn state_is_settled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == SETTLED
    }

    /// `Pipe(target)`: source stdout becomes target stdin (spec.md §4.1,
    /// invariant 10 "bytes ... appear in source-stdout order"). Rejects
    /// piping a handle into itself or into an already-started handle
    /// up front, before either side dispatches.
    pub fn pipe(self: &Arc<Self>, target: Arc<CommandHandle>) -> Result<Arc<PipedHandle>, CrossExecError> {
        if Arc::ptr_eq(self, &target) {
            return Err(CrossExecError::ValidationError {
                message: "cannot pipe a handle into itself".into(),
            });
        }
        if self.state_is_settled() || target.state_is_settled() {
            return Err(CrossExecError::ValidationError {
                message: "cannot pipe into an already-settled handle".into(),
            });
        }
        if target.state.load(Ordering::SeqCst) == STARTED {
            return Err(CrossExecError::ValidationError {
                message: "cannot pipe into a handle that already started".into(),
            });
        }
        Ok(Arc::new(PipedHandle {
            source: self.clone(),
            target,
        }))
    }
}

/// The handle returned by `CommandHandle::pipe`. Awaiting it runs `source`
/// to completion, feeds its stdout to `target` as stdin, then runs `target`
/// and returns its result — both sides have settled by the time it resolves.
pub struct PipedHandle {
    source: Arc<CommandHandle>,
    target: Arc<CommandHandle>,
}

impl PipedHandle {
    pub async fn run(&self) -> Result<ExecutionResult, CrossExecError> {
        let source_result = self.source.run().await?;
        self.target
            .clone()
            .stdin_bytes(source_result.stdout.clone())
            .run()
            .await
    }
}

impl Clone for CrossExecError {
    fn clone(&self) -> Self {
        // Errors are cloned only to memoize an already-settled handle's
        // result for idempotent re-awaits; the wrapped `cause`/`source`
        // (not `Clone`) is intentionally dropped on the copy, the message
        // and context are preserved.
        match self {
            Self::CommandError { exit_code, context, partial_stdout, partial_stderr, suggestions } => {
                Self::CommandError {
                    exit_code: *exit_code,
                    context: context.clone(),
                    partial_stdout: partial_stdout.clone(),
                    partial_stderr: partial_stderr.clone(),
                    suggestions: suggestions.clone(),
                }
            }
            Self::TimeoutError { elapsed_ms, context, partial_stdout, partial_stderr } => Self::TimeoutError {
                elapsed_ms: *elapsed_ms,
                context: context.clone(),
                partial_stdout: partial_stdout.clone(),
                partial_stderr: partial_stderr.clone(),
            },
            Self::CancelledError { context, partial_stdout, partial_stderr } => Self::CancelledError {
                context: context.clone(),
                partial_stdout: partial_stdout.clone(),
                partial_stderr: partial_stderr.clone(),
            },
            Self::ConnectionError { message, context, suggestions, .. } => Self::ConnectionError {
                message: message.clone(),
                context: context.clone(),
                cause: None,
                suggestions: suggestions.clone(),
            },
            Self::AuthenticationError { message, context } => Self::AuthenticationError {
                message: message.clone(),
                context: context.clone(),
            },
            Self::AdapterError { adapter, message, context, transient, .. } => Self::AdapterError {
                adapter,
                message: message.clone(),
                context: context.clone(),
                transient: *transient,
                cause: None,
            },
            Self::ResourceError { kind, message, context } => Self::ResourceError {
                kind: *kind,
                message: message.clone(),
                context: context.clone(),
            },
            Self::ValidationError { message } => Self::ValidationError { message: message.clone() },
            Self::StreamError { message, context } => Self::StreamError {
                message: message.clone(),
                context: context.clone(),
            },
            Self::CacheError { message } => Self::CacheError { message: message.clone() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::Engine;

    #[tokio::test]
    async fn idempotent_await_dispatches_once() {
        let engine = Engine::new();
        let handle = Arc::new(engine.exec(&["echo ", ""], &[ExecValue::Str("hi".to_string())]));
        let first = handle.run().await.unwrap();
        let second = handle.run().await.unwrap();
        assert_eq!(first.stdout, second.stdout);
        assert!(handle.state_is_settled());
    }

    #[tokio::test]
    async fn modifier_after_start_is_rejected() {
        let engine = Engine::new();
        let handle = Arc::new(engine.exec(&["sleep 0"], &[]));
        let _ = handle.run().await;
        let err = handle.with_overrides(|o| o.quiet = true).unwrap_err();
        assert!(matches!(err, CrossExecError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn nothrow_folds_error_into_result() {
        let engine = Engine::new();
        let handle = Arc::new(engine.exec(&["exit 3"], &[])).no_throw();
        let result = handle.run().await.unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.ok());
        assert!(result.cause.is_some());
    }

    #[tokio::test]
    async fn nonzero_exit_throws_by_default() {
        let engine = Engine::new();
        let handle = Arc::new(engine.exec(&["exit 3"], &[]));
        let err = handle.run().await.unwrap_err();
        assert!(matches!(err, CrossExecError::CommandError { exit_code: Some(3), .. }));
    }

    #[tokio::test]
    async fn pipe_feeds_source_stdout_to_target_stdin() {
        let engine = Engine::new();
        let source = Arc::new(engine.exec(&["printf hi"], &[]));
        let target = Arc::new(engine.exec(&["cat"], &[]));
        let piped = source.pipe(target).unwrap();
        let result = piped.run().await.unwrap();
        assert_eq!(result.stdout_text(), "hi");
    }

    #[tokio::test]
    async fn pipe_into_self_is_validation_error() {
        let engine = Engine::new();
        let handle = Arc::new(engine.exec(&["echo hi"], &[]));
        let err = handle.clone().pipe(handle).unwrap_err();
        assert!(matches!(err, CrossExecError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn array_value_interpolates_as_quoted_tokens() {
        let engine = Engine::new();
        let handle = Arc::new(engine.exec(
            &["echo ", ""],
            &[ExecValue::Array(vec!["a".to_string(), "b c".to_string()])],
        ));
        assert!(handle.command_line().contains("a 'b c'"));
        let result = handle.run().await.unwrap();
        assert_eq!(result.stdout_text().trim_end(), "a b c");
    }

    #[tokio::test]
    async fn nested_handle_interpolates_trimmed_stdout() {
        let engine = Engine::new();
        let inner = Arc::new(engine.exec(&["printf hi"], &[]));
        let outer = Arc::new(engine.exec(&["echo ", ""], &[ExecValue::Handle(inner)]));
        let result = outer.run().await.unwrap();
        assert_eq!(result.stdout_text().trim_end(), "hi");
    }
}
