//! SSH adapter: pooled session multiplexing, exec, SFTP transfer and
//! tunnels (spec.md §4.3–§4.5).

pub mod adapter;
pub mod pool;
pub mod sftp;
pub mod tunnel;

pub use adapter::{SshAdapter, SshTarget};
pub use pool::{Pool, PoolConfig, PoolKey, QueuePolicy, ValidationStrategy};
pub use tunnel::{ForwardSpec, Tunnel, TunnelState};
