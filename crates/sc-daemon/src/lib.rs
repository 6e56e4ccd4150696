//! Sidecar Daemon
//!
//! The proxy engine: runs one binding listener per configured binding and
//! supervises them as a group until shutdown.

pub mod engine;

pub use engine::{EngineEvent, EngineReport, ProxyEngine};
