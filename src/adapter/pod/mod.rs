//! Pod adapter: exec, label-selector resolution and port-forward against a
//! Kubernetes cluster.

pub mod adapter;
pub mod copy;
pub mod portforward;

pub use adapter::PodAdapter;
pub use portforward::{open as open_port_forward, PodPortForward};
