// src/lifecycle/mod.rs
mod shutdown;
mod signals;

pub use shutdown::{AdmissionGuard, Lifecycle, LifecycleState};
pub use signals::shutdown_signal;
