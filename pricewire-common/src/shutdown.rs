//! Graceful shutdown coordination
//!
//! Traps SIGTERM/SIGINT, sets a process-wide flag observed by all polling
//! loops, then runs registered cleanup callbacks serially under one total
//! budget. In-flight work is tracked with guard counters so cleanup waits
//! for handlers that were already running when the signal arrived.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub struct ShutdownCoordinator {
    flag: AtomicBool,
    notify: Notify,
    cleanups: Mutex<Vec<(String, CleanupFn)>>,
    in_flight: AtomicUsize,
    budget: Duration,
}

impl ShutdownCoordinator {
    pub fn new(budget_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
            cleanups: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            budget: Duration::from_millis(budget_ms),
        })
    }

    /// Spawn the signal listener task (SIGTERM + SIGINT)
    pub fn listen(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            coordinator.trigger();
        });
    }

    /// Request shutdown programmatically (fatal errors, tests)
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown() {
                return;
            }
            notified.await;
        }
    }

    /// Register a cleanup callback, run serially during [`run_cleanup`]
    pub fn register_cleanup<F, Fut>(&self, name: &str, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut cleanups = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        let cleanup: CleanupFn = Box::new(move || {
            let fut: BoxFuture<'static, ()> = Box::pin(f());
            fut
        });
        cleanups.push((name.to_string(), cleanup));
    }

    /// Mark the start of an in-flight operation; the returned guard marks
    /// its end on drop.
    pub fn begin_operation(self: &Arc<Self>) -> OperationGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        OperationGuard {
            coordinator: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Drain in-flight work and run registered cleanups serially under the
    /// total budget. Returns false when the budget was exceeded; the caller
    /// is expected to exit non-zero in that case.
    pub async fn run_cleanup(&self) -> bool {
        let deadline = Instant::now() + self.budget;

        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                error!(
                    in_flight = self.in_flight(),
                    "shutdown budget exceeded waiting for in-flight work"
                );
                return false;
            }
            sleep(Duration::from_millis(25)).await;
        }

        let cleanups = {
            let mut guard = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        for (name, cleanup) in cleanups {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                error!(cleanup = %name, "shutdown budget exceeded before cleanup ran");
                return false;
            }
            match timeout(remaining, cleanup()).await {
                Ok(()) => info!(cleanup = %name, "cleanup completed"),
                Err(_) => {
                    error!(cleanup = %name, "cleanup exceeded shutdown budget");
                    return false;
                }
            }
        }

        true
    }
}

/// RAII marker for one in-flight operation
pub struct OperationGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.coordinator.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let coordinator = ShutdownCoordinator::new(1000);
        let waiter = {
            let c = Arc::clone(&coordinator);
            tokio::spawn(async move { c.wait().await })
        };
        coordinator.trigger();
        waiter.await.unwrap();
        assert!(coordinator.is_shutdown());
    }

    #[tokio::test]
    async fn cleanup_runs_within_budget() {
        let coordinator = ShutdownCoordinator::new(1000);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        coordinator.register_cleanup("flush", move || async move {
            flag.store(true, Ordering::SeqCst);
        });
        coordinator.trigger();
        assert!(coordinator.run_cleanup().await);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn slow_cleanup_exceeds_budget() {
        let coordinator = ShutdownCoordinator::new(50);
        coordinator.register_cleanup("stuck", || async {
            sleep(Duration::from_millis(500)).await;
        });
        coordinator.trigger();
        assert!(!coordinator.run_cleanup().await);
    }

    #[tokio::test]
    async fn cleanup_waits_for_in_flight_work() {
        let coordinator = ShutdownCoordinator::new(1000);
        let guard = coordinator.begin_operation();
        assert_eq!(coordinator.in_flight(), 1);

        let finisher = {
            let c = Arc::clone(&coordinator);
            tokio::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                drop(guard);
                let _ = c;
            })
        };

        coordinator.trigger();
        assert!(coordinator.run_cleanup().await);
        assert_eq!(coordinator.in_flight(), 0);
        finisher.await.unwrap();
    }
}
