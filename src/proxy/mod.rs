// src/proxy/mod.rs
mod backend;
mod dispatcher;
pub mod headers;
mod registry;
mod upstream;

pub use backend::{Backend, BackendStatus, LoadGuard, LATENCY_SAMPLE_CAPACITY};
pub use dispatcher::{Dispatcher, ProxyError};
pub use registry::{Registry, RegistryError, DRAIN_POLL_INTERVAL};
pub use upstream::{HyperUpstream, Upstream};
