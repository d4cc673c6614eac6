//! Event system module
//!
//! Provides a pub/sub event bus broadcasting command lifecycle, connection
//! pool, tunnel and cache events to passive subscribers.

mod bus;

pub use bus::{Event, EventBus, StreamKind};
