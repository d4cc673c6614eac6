//! Typed configuration shapes (spec.md §6: "Configuration resolver provides
//! ... default engine options" as an input the core *consumes*).
//!
//! The core never reads a file itself — no `Configuration::load(path)`
//! equivalent lives here, that belongs to the external CLI/config-resolver
//! collaborator. These are `Deserialize` structs with field defaults in the
//! style of `config/config.rs`'s `ApiConfiguration`/`SystemConfiguration`,
//! so a resolver can build them from TOML/YAML/JSON and hand the finished
//! value straight to `Engine::ssh`/`Engine::docker`/`Engine::k8s`/retry and
//! cache policy constructors.

use std::time::Duration;

use serde::Deserialize;

use crate::adapter::ssh::pool::{PoolConfig as SshPoolConfig, QueuePolicy, ValidationStrategy};
use crate::engine::SshAuth;
use crate::retry::{RetryPolicy, RetryStrategy};

fn default_ssh_port() -> u16 {
    22
}

fn default_pool_min() -> usize {
    0
}

fn default_pool_max() -> usize {
    8
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_queue_max() -> usize {
    32
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_reset_secs() -> u64 {
    30
}

/// Which credential kind an `SshTargetConfig` resolves to. Agent auth has no
/// extra fields; password/key-file carry the material inline (the resolver
/// is expected to have already read any key file off disk into `key_path`,
/// matching how the core never touches the filesystem for credentials).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuthConfig {
    Password { password: String },
    KeyFile { key_path: String, passphrase: Option<String> },
    Agent,
}

impl From<SshAuthConfig> for SshAuth {
    fn from(value: SshAuthConfig) -> Self {
        match value {
            SshAuthConfig::Password { password } => SshAuth::Password(password),
            SshAuthConfig::KeyFile { key_path, passphrase } => SshAuth::KeyFile {
                path: key_path,
                passphrase,
            },
            SshAuthConfig::Agent => SshAuth::Agent,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshTargetConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub auth: SshAuthConfig,
    #[serde(default)]
    pub pool: PoolConfigShape,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerTargetConfig {
    pub container_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PodTargetConfig {
    pub namespace: String,
    pub pod: String,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
}

/// `Deserialize` mirror of `adapter::ssh::pool::PoolConfig`; converted via
/// `.into()` once a resolver has parsed it, keeping `serde` out of the pool
/// module itself.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfigShape {
    #[serde(default = "default_pool_min")]
    pub min: usize,
    #[serde(default = "default_pool_max")]
    pub max: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default)]
    pub validation: ValidationStrategyShape,
    #[serde(default)]
    pub queue_policy: QueuePolicyShape,
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_reset_secs")]
    pub circuit_breaker_reset_secs: u64,
}

impl Default for PoolConfigShape {
    fn default() -> Self {
        Self {
            min: default_pool_min(),
            max: default_pool_max(),
            idle_timeout_secs: default_idle_timeout_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            validation: ValidationStrategyShape::default(),
            queue_policy: QueuePolicyShape::default(),
            queue_max: default_queue_max(),
            keepalive_secs: default_keepalive_secs(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_reset_secs: default_breaker_reset_secs(),
        }
    }
}

impl From<PoolConfigShape> for SshPoolConfig {
    fn from(shape: PoolConfigShape) -> Self {
        Self {
            min: shape.min,
            max: shape.max,
            idle_timeout: Duration::from_secs(shape.idle_timeout_secs),
            acquire_timeout: Duration::from_secs(shape.acquire_timeout_secs),
            validation: shape.validation.into(),
            queue_policy: shape.queue_policy.into(),
            queue_max: shape.queue_max,
            keepalive_interval: Duration::from_secs(shape.keepalive_secs),
            circuit_breaker_threshold: shape.circuit_breaker_threshold,
            circuit_breaker_reset: Duration::from_secs(shape.circuit_breaker_reset_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStrategyShape {
    Always,
    #[default]
    OnBorrow,
    OnReturn,
    Periodic,
}

impl From<ValidationStrategyShape> for ValidationStrategy {
    fn from(value: ValidationStrategyShape) -> Self {
        match value {
            ValidationStrategyShape::Always => ValidationStrategy::Always,
            ValidationStrategyShape::OnBorrow => ValidationStrategy::OnBorrow,
            ValidationStrategyShape::OnReturn => ValidationStrategy::OnReturn,
            ValidationStrategyShape::Periodic => ValidationStrategy::Periodic,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicyShape {
    #[default]
    Fifo,
    Lifo,
}

impl From<QueuePolicyShape> for QueuePolicy {
    fn from(value: QueuePolicyShape) -> Self {
        match value {
            QueuePolicyShape::Fifo => QueuePolicy::Fifo,
            QueuePolicyShape::Lifo => QueuePolicy::Lifo,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub strategy: RetryStrategyShape,
    #[serde(default)]
    pub jitter: f64,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            strategy: cfg.strategy.into(),
            jitter: cfg.jitter,
            should_retry: None,
            on_retry: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyShape {
    Linear,
    #[default]
    Exponential,
    Fibonacci,
}

impl From<RetryStrategyShape> for RetryStrategy {
    fn from(value: RetryStrategyShape) -> Self {
        match value {
            RetryStrategyShape::Linear => RetryStrategy::Linear,
            RetryStrategyShape::Exponential => RetryStrategy::Exponential { factor: 2.0 },
            RetryStrategyShape::Fibonacci => RetryStrategy::Fibonacci,
        }
    }
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_max_bytes() -> usize {
    256 * 1024 * 1024
}

/// Engine-wide cache sizing; per-handle TTL/key/admission still come from
/// `CommandHandle::cache(key, ttl)` at the call site.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
        }
    }
}

/// Root engine defaults a resolver may hand to the constructor in place of
/// `Engine::new()` + a chain of modifiers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineOptionsConfig {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "default_throw_on_nonzero")]
    pub throw_on_nonzero: bool,
}

fn default_throw_on_nonzero() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_target_config_parses_password_auth() {
        let toml = r#"
            host = "example.com"
            user = "deploy"
            [auth]
            method = "password"
            password = "hunter2"
        "#;
        let cfg: SshTargetConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.port, 22);
        assert!(matches!(cfg.auth, SshAuthConfig::Password { .. }));
    }

    #[test]
    fn pool_config_shape_converts_with_defaults() {
        let shape = PoolConfigShape::default();
        let pool: SshPoolConfig = shape.into();
        assert_eq!(pool.max, 8);
        assert_eq!(pool.queue_policy, QueuePolicy::Fifo);
    }

    #[test]
    fn retry_config_converts_exponential_default() {
        let cfg = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            strategy: RetryStrategyShape::default(),
            jitter: 0.0,
        };
        let policy: RetryPolicy = cfg.into();
        assert_eq!(policy.max_attempts, 5);
        assert!(matches!(policy.strategy, RetryStrategy::Exponential { .. }));
    }
}
