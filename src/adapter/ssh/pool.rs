//! Keyed SSH connection pool (spec.md §4.4).
//!
//! The acquire/release/eviction/circuit-breaker algorithm is hand-rolled
//! rather than built on a generic `bb8`-style pool: spec.md's contract
//! (explicit FIFO/LIFO waiter queue with deadline, four validation
//! strategies, and a breaker with Half-Open probing) does not map cleanly
//! onto `bb8::ManageConnection`. The keyed-map shape and get-or-create flow
//! follow `other_examples` rustible's `ConnectionPool`/`ConnectionFactory`;
//! the failure-counting idea behind the breaker follows kftray's
//! `kube-connection_pool.rs::consecutive_failures`, adapted from
//! pool-recreation to a plain Closed/Open/HalfOpen state machine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

use crate::error::{CrossExecError, ErrorContext, ResourceKind};
use crate::events::{Event, EventBus};

/// Target key: (user, host, port, auth fingerprint).
pub type PoolKey = String;

pub fn pool_key(user: &str, host: &str, port: u16, auth_fingerprint: &str) -> PoolKey {
    format!("{user}@{host}:{port}#{auth_fingerprint}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStrategy {
    Always,
    OnBorrow,
    OnReturn,
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    Fifo,
    Lifo,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub validation: ValidationStrategy,
    pub queue_policy: QueuePolicy,
    pub queue_max: usize,
    pub keepalive_interval: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 8,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(10),
            validation: ValidationStrategy::OnBorrow,
            queue_policy: QueuePolicy::Fifo,
            queue_max: 32,
            keepalive_interval: Duration::from_secs(30),
            circuit_breaker_threshold: 5,
            circuit_breaker_reset: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Active,
    Validating,
    Closing,
}

/// An established SSH session. The actual `russh` client handle lives behind
/// this trait so the pool stays transport-agnostic in its tests.
#[async_trait::async_trait]
pub trait SshSession: Send + Sync {
    async fn is_alive(&self) -> bool;
    async fn close(&self);
}

pub struct PooledConnection<S: SshSession> {
    pub id: u64,
    pub key: PoolKey,
    pub state: ConnState,
    pub acquired_at: Option<Instant>,
    pub last_used_at: Instant,
    pub session: Arc<S>,
}

enum BreakerState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

struct KeyState<S: SshSession> {
    idle: VecDeque<PooledConnection<S>>,
    active_count: usize,
    opening_count: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
    consecutive_failures: u32,
    breaker: BreakerState,
}

impl<S: SshSession> Default for KeyState<S> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            active_count: 0,
            opening_count: 0,
            waiters: VecDeque::new(),
            consecutive_failures: 0,
            breaker: BreakerState::Closed,
        }
    }
}

/// Connect function supplied by the SSH adapter: creates one new session for
/// `key`. Kept generic so the pool can be unit-tested with a fake.
pub type ConnectFn<S> = Arc<
    dyn Fn(PoolKey) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<S, CrossExecError>> + Send>>
        + Send
        + Sync,
>;

pub struct Pool<S: SshSession> {
    config: PoolConfig,
    states: Mutex<HashMap<PoolKey, KeyState<S>>>,
    next_id: AtomicU32,
    connect: ConnectFn<S>,
    events: Option<EventBus>,
    // Bounds total concurrent "opening" work process-wide, independent of
    // per-key max, mirroring the teacher's preference for cheap semaphores
    // over ad-hoc counters for concurrency limiting.
    connect_gate: Semaphore,
}

impl<S: SshSession + 'static> Pool<S> {
    pub fn new(config: PoolConfig, connect: ConnectFn<S>, events: Option<EventBus>) -> Self {
        let gate_permits = config.max.max(1) * 4;
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            connect,
            events,
            connect_gate: Semaphore::new(gate_permits),
        }
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Acquire a connection for `key`, honoring the configured deadline.
    pub async fn acquire(&self, key: &PoolKey) -> Result<PooledConnection<S>, CrossExecError> {
        self.check_breaker(key)?;

        if let Some(conn) = self.try_take_idle(key) {
            return self.validate_or_retry(key, conn).await;
        }

        if self.try_reserve_slot(key) {
            return self.create_and_insert(key).await;
        }

        self.wait_for_slot(key).await?;
        // A slot was handed to us (either idle or newly opened by a releaser).
        if let Some(conn) = self.try_take_idle(key) {
            return self.validate_or_retry(key, conn).await;
        }
        Err(CrossExecError::ResourceError {
            kind: ResourceKind::QueueTimeout,
            message: "woke from wait queue with no available connection".into(),
            context: ErrorContext::new().with_host(key.clone()),
        })
    }

    pub fn release(&self, mut conn: PooledConnection<S>) {
        conn.state = ConnState::Idle;
        conn.last_used_at = Instant::now();
        let key = conn.key.clone();
        let mut states = self.states.lock();
        let state = states.entry(key.clone()).or_default();
        state.active_count = state.active_count.saturating_sub(1);

        if let Some(waiter) = state.waiters.pop_front() {
            // The woken waiter claims this connection through its own
            // `try_take_idle` call, which does the matching increment —
            // incrementing here too would double-count the handoff.
            state.idle.push_back(conn);
            let _ = waiter.send(());
        } else {
            state.idle.push_back(conn);
        }
    }

    /// Idle-eviction sweep; intended to run on a periodic timer owned by the
    /// adapter/engine, honoring `min`.
    pub fn evict_idle(&self) {
        let mut states = self.states.lock();
        for (key, state) in states.iter_mut() {
            let keep = self.config.min;
            let now = Instant::now();
            let mut kept = VecDeque::new();
            while let Some(conn) = state.idle.pop_front() {
                let total_after = kept.len() + state.idle.len() + 1;
                if total_after > keep && now.duration_since(conn.last_used_at) > self.config.idle_timeout {
                    debug!(key = %key, "evicting idle ssh connection");
                    self.emit(Event::ConnectionClose {
                        key: key.clone(),
                        reason: "idle",
                    });
                } else {
                    kept.push_back(conn);
                }
            }
            state.idle = kept;
        }
    }

    fn try_take_idle(&self, key: &PoolKey) -> Option<PooledConnection<S>> {
        let mut states = self.states.lock();
        let state = states.get_mut(key)?;
        let conn = match self.config.queue_policy {
            QueuePolicy::Fifo => state.idle.pop_front(),
            QueuePolicy::Lifo => state.idle.pop_back(),
        }?;
        state.active_count += 1;
        Some(conn)
    }

    fn try_reserve_slot(&self, key: &PoolKey) -> bool {
        let mut states = self.states.lock();
        let state = states.entry(key.clone()).or_default();
        if state.active_count + state.opening_count < self.config.max {
            state.opening_count += 1;
            true
        } else {
            false
        }
    }

    async fn create_and_insert(&self, key: &PoolKey) -> Result<PooledConnection<S>, CrossExecError> {
        let _permit = self.connect_gate.acquire().await;
        let result = (self.connect)(key.clone()).await;
        let mut states = self.states.lock();
        let state = states.entry(key.clone()).or_default();
        state.opening_count = state.opening_count.saturating_sub(1);

        match result {
            Ok(session) => {
                state.consecutive_failures = 0;
                state.breaker = BreakerState::Closed;
                state.active_count += 1;
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u64;
                self.emit(Event::ConnectionOpen { key: key.clone() });
                Ok(PooledConnection {
                    id,
                    key: key.clone(),
                    state: ConnState::Active,
                    acquired_at: Some(Instant::now()),
                    last_used_at: Instant::now(),
                    session: Arc::new(session),
                })
            }
            Err(e) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.circuit_breaker_threshold {
                    state.breaker = BreakerState::Open {
                        since: Instant::now(),
                    };
                    warn!(key = %key, "ssh pool circuit breaker opened");
                }
                self.emit(Event::ConnectionError {
                    key: key.clone(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn validate_or_retry(
        &self,
        key: &PoolKey,
        mut conn: PooledConnection<S>,
    ) -> Result<PooledConnection<S>, CrossExecError> {
        let needs_validation = matches!(
            self.config.validation,
            ValidationStrategy::Always | ValidationStrategy::OnBorrow
        );
        if needs_validation {
            conn.state = ConnState::Validating;
            if !conn.session.is_alive().await {
                // Discard and retry acquire at most once before creating new.
                let mut states = self.states.lock();
                if let Some(state) = states.get_mut(key) {
                    state.active_count = state.active_count.saturating_sub(1);
                }
                drop(states);
                self.emit(Event::ConnectionClose {
                    key: key.clone(),
                    reason: "failed-validation",
                });
                if self.try_reserve_slot(key) {
                    return self.create_and_insert(key).await;
                }
            }
        }
        conn.state = ConnState::Active;
        self.emit(Event::ConnectionReuse { key: key.clone() });
        Ok(conn)
    }

    async fn wait_for_slot(&self, key: &PoolKey) -> Result<(), CrossExecError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut states = self.states.lock();
            let state = states.entry(key.clone()).or_default();
            if state.waiters.len() >= self.config.queue_max {
                return Err(CrossExecError::ResourceError {
                    kind: ResourceKind::QueueFull,
                    message: "ssh pool waiter queue is full".into(),
                    context: ErrorContext::new().with_host(key.clone()),
                });
            }
            state.waiters.push_back(tx);
        }
        match tokio::time::timeout(self.config.acquire_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(CrossExecError::ResourceError {
                kind: ResourceKind::QueueTimeout,
                message: "timed out waiting for an ssh connection".into(),
                context: ErrorContext::new().with_host(key.clone()),
            }),
        }
    }

    fn check_breaker(&self, key: &PoolKey) -> Result<(), CrossExecError> {
        let mut states = self.states.lock();
        let state = states.entry(key.clone()).or_default();
        match state.breaker {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Ok(()),
            BreakerState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_reset {
                    state.breaker = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(CrossExecError::ConnectionError {
                        message: "circuit breaker open".into(),
                        context: ErrorContext::new().with_host(key.clone()),
                        cause: None,
                        suggestions: vec!["wait for the breaker reset window to elapse".into()],
                    })
                }
            }
        }
    }

    pub fn active_plus_opening(&self, key: &PoolKey) -> usize {
        let states = self.states.lock();
        states
            .get(key)
            .map(|s| s.active_count + s.opening_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeSession {
        alive: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl SshSession for FakeSession {
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::Relaxed)
        }
        async fn close(&self) {}
    }

    fn fake_connect(calls: Arc<AtomicUsize>) -> ConnectFn<FakeSession> {
        Arc::new(move |_key| {
            calls.fetch_add(1, Ordering::Relaxed);
            Box::pin(async move {
                Ok(FakeSession {
                    alive: std::sync::atomic::AtomicBool::new(true),
                })
            })
        })
    }

    #[tokio::test]
    async fn acquire_then_release_reuses_connection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(PoolConfig::default(), fake_connect(calls.clone()), None);
        let key = pool_key("u", "h", 22, "fp");

        let conn = pool.acquire(&key).await.unwrap();
        pool.release(conn);
        let _conn2 = pool.acquire(&key).await.unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn pool_ceiling_is_respected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cfg = PoolConfig::default();
        cfg.max = 1;
        cfg.acquire_timeout = Duration::from_millis(50);
        let pool = Pool::new(cfg, fake_connect(calls), None);
        let key = pool_key("u", "h", 22, "fp");

        let _conn1 = pool.acquire(&key).await.unwrap();
        let err = pool.acquire(&key).await.unwrap_err();
        assert!(matches!(err, CrossExecError::ResourceError { kind: ResourceKind::QueueTimeout, .. }));
    }

    #[tokio::test]
    async fn waiter_handoff_does_not_double_count_active() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cfg = PoolConfig::default();
        cfg.max = 1;
        cfg.acquire_timeout = Duration::from_millis(200);
        let pool = Arc::new(Pool::new(cfg, fake_connect(calls), None));
        let key = pool_key("u", "h", 22, "fp");

        let conn1 = pool.acquire(&key).await.unwrap();

        let pool2 = pool.clone();
        let key2 = key.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(&key2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(conn1);

        let conn2 = waiter.await.unwrap().unwrap();
        assert_eq!(pool.active_plus_opening(&key), 1);
        pool.release(conn2);
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_repeated_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing_connect: ConnectFn<FakeSession> = {
            let calls = calls.clone();
            Arc::new(move |_key| {
                calls.fetch_add(1, Ordering::Relaxed);
                Box::pin(async move {
                    Err(CrossExecError::ConnectionError {
                        message: "refused".into(),
                        context: ErrorContext::new(),
                        cause: None,
                        suggestions: vec![],
                    })
                })
            })
        };
        let mut cfg = PoolConfig::default();
        cfg.circuit_breaker_threshold = 2;
        let pool = Pool::new(cfg, failing_connect, None);
        let key = pool_key("u", "h", 22, "fp");

        let _ = pool.acquire(&key).await;
        let _ = pool.acquire(&key).await;
        let err = pool.acquire(&key).await.unwrap_err();
        assert!(matches!(err, CrossExecError::ConnectionError { .. }));
    }
}
