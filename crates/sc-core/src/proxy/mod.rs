//! TCP Proxy Module for Sidecar
//!
//! Per-binding accept loops and the bidirectional relay between accepted
//! connections and their dialed destinations.

pub mod listener;
pub mod relay;

pub use listener::{BindingListener, ProxyStats};
pub use relay::{DirectionReport, RelayReport, relay};
