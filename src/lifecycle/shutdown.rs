// src/lifecycle/shutdown.rs
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug)]
struct Inner {
    state: LifecycleState,
    in_flight: usize,
}

/// Admission gate and drain barrier for dispatched requests.
///
/// The state flag and the in-flight count live under one lock, so once
/// `shutdown` has flipped the state no further request can be admitted,
/// and every request admitted before that point is waited for.
#[derive(Debug)]
pub struct Lifecycle {
    inner: Mutex<Inner>,
    drained: Notify,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LifecycleState::Running,
                in_flight: 0,
            }),
            drained: Notify::new(),
        }
    }

    /// Admit one request, or `None` once shutdown has begun.
    pub fn admit(&self) -> Option<AdmissionGuard<'_>> {
        let mut inner = self.inner.lock();
        if inner.state != LifecycleState::Running {
            return None;
        }
        inner.in_flight += 1;
        Some(AdmissionGuard { lifecycle: self })
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != LifecycleState::Running
    }

    /// Stop admitting requests and wait until every admitted one completes.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == LifecycleState::Running {
                inner.state = LifecycleState::Draining;
                info!(in_flight = inner.in_flight, "Draining in-flight requests");
            }
        }

        loop {
            // Registered before the check so a wakeup in between is not lost.
            let notified = self.drained.notified();
            if self.inner.lock().in_flight == 0 {
                break;
            }
            notified.await;
        }

        let mut inner = self.inner.lock();
        if inner.state != LifecycleState::Stopped {
            inner.state = LifecycleState::Stopped;
            info!("All in-flight requests completed");
        }
    }

    fn complete(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight -= 1;
        if inner.in_flight == 0 {
            self.drained.notify_waiters();
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one admitted request; completion is recorded on drop.
#[derive(Debug)]
pub struct AdmissionGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.complete();
    }
}
