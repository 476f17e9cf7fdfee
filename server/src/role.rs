//! Thread roles and activity measurement
//!
//! A role describes what a pool thread is doing (dispatching inbound frames,
//! flushing send queues, idling) without tying the thread to it. Each pool thread
//! asks its current role for a fresh `RoleWorker`, runs it until the worker's
//! cancellation token fires, then asks again. Workers bracket real work with
//! active zones; the resulting smoothed activity rate is what the scheduler
//! balances on.

use netplus_core::{Result, SteadyHeuristic};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Per-thread activity estimate. Active zones nest; the thread counts as idle
/// only once the outermost zone is left.
pub struct ActivityTracker {
    state: Mutex<TrackerState>,
}

struct TrackerState {
    depth: u32,
    heuristic: SteadyHeuristic,
}

impl ActivityTracker {
    pub fn new(time_constant: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                depth: 0,
                heuristic: SteadyHeuristic::new(0.0, time_constant),
            }),
        }
    }

    pub fn enter_active_zone(&self) {
        let mut state = self.state.lock();
        state.depth += 1;
        if state.depth == 1 {
            state.heuristic.set_level(1.0);
        }
    }

    pub fn exit_active_zone(&self) {
        let mut state = self.state.lock();
        if state.depth == 0 {
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.heuristic.set_level(0.0);
        }
    }

    /// Enters an active zone that is left when the guard drops
    pub fn active_zone(&self) -> ActiveZone<'_> {
        self.enter_active_zone();
        ActiveZone { tracker: self }
    }

    /// Smoothed fraction of recent time spent inside active zones, in `0..=1`
    pub fn activity_rate(&self) -> f64 {
        self.state.lock().heuristic.value()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().depth > 0
    }
}

pub struct ActiveZone<'a> {
    tracker: &'a ActivityTracker,
}

impl Drop for ActiveZone<'_> {
    fn drop(&mut self) {
        self.tracker.exit_active_zone();
    }
}

/// Workers currently running a role, keyed by pool slot
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<usize, Arc<ActivityTracker>>>,
}

impl WorkerRegistry {
    pub fn register(&self, slot: usize, tracker: Arc<ActivityTracker>) {
        self.workers.write().insert(slot, tracker);
    }

    pub fn unregister(&self, slot: usize) {
        self.workers.write().remove(&slot);
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mean activity of the registered workers; `None` without workers
    pub fn mean_activity(&self) -> Option<f64> {
        let workers = self.workers.read();
        if workers.is_empty() {
            return None;
        }
        let total: f64 = workers.values().map(|tracker| tracker.activity_rate()).sum();
        Some(total / workers.len() as f64)
    }
}

/// The blocking loop a pool thread runs for its current role
pub trait RoleWorker: Send {
    /// Runs until `token` is cancelled or the worker decides to stop. An error is
    /// treated like a crash: the pool replaces the thread.
    fn start_worker(&mut self, tracker: &ActivityTracker, token: &CancellationToken) -> Result<()>;
}

pub trait ThreadRole: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn min_threads(&self) -> usize;

    fn max_threads(&self) -> usize;

    /// Builds the worker for pool slot `slot`
    fn create_worker(&self, slot: usize) -> Box<dyn RoleWorker>;

    fn registry(&self) -> &WorkerRegistry;

    /// Role-specific balancing, run at the end of every scheduling pass
    fn invoke_scheduler(&self) {}

    fn activity_rate(&self) -> Option<f64> {
        self.registry().mean_activity()
    }
}

/// Identity comparison for role handles
pub fn same_role(a: &Arc<dyn ThreadRole>, b: &Arc<dyn ThreadRole>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Parking spot for threads no other role needs
pub struct IdleRole {
    runtime: Handle,
    registry: WorkerRegistry,
}

impl IdleRole {
    pub const NAME: &'static str = "idle";

    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            registry: WorkerRegistry::default(),
        }
    }
}

impl ThreadRole for IdleRole {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn min_threads(&self) -> usize {
        0
    }

    fn max_threads(&self) -> usize {
        usize::MAX
    }

    fn create_worker(&self, _slot: usize) -> Box<dyn RoleWorker> {
        Box::new(IdleWorker {
            runtime: self.runtime.clone(),
        })
    }

    fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }
}

struct IdleWorker {
    runtime: Handle,
}

impl RoleWorker for IdleWorker {
    fn start_worker(&mut self, _tracker: &ActivityTracker, token: &CancellationToken) -> Result<()> {
        self.runtime.block_on(token.cancelled());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_nested_zones_stay_active_until_outermost_exit() {
        let tracker = ActivityTracker::new(Duration::from_millis(100));
        assert!(!tracker.is_active());

        {
            let _outer = tracker.active_zone();
            {
                let _inner = tracker.active_zone();
            }
            assert!(tracker.is_active());
        }
        assert!(!tracker.is_active());

        tracker.exit_active_zone();
        assert!(!tracker.is_active());
    }

    #[test]
    fn test_activity_rises_while_busy() {
        let tracker = ActivityTracker::new(Duration::from_millis(20));
        assert_approx_eq!(tracker.activity_rate(), 0.0);

        let zone = tracker.active_zone();
        std::thread::sleep(Duration::from_millis(100));
        assert!(tracker.activity_rate() > 0.9);
        drop(zone);

        std::thread::sleep(Duration::from_millis(100));
        assert!(tracker.activity_rate() < 0.1);
    }

    #[test]
    fn test_registry_mean() {
        let registry = WorkerRegistry::default();
        assert!(registry.mean_activity().is_none());

        let busy = Arc::new(ActivityTracker::new(Duration::from_millis(10)));
        let _zone = busy.active_zone();
        std::thread::sleep(Duration::from_millis(80));

        registry.register(0, Arc::clone(&busy));
        registry.register(1, Arc::new(ActivityTracker::new(Duration::from_millis(10))));
        let mean = registry.mean_activity().unwrap();
        assert!(mean > 0.45 && mean <= 0.5, "mean {}", mean);

        registry.unregister(1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_idle_worker_returns_on_cancel() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let role = IdleRole::new(runtime.handle().clone());
        assert_eq!(role.min_threads(), 0);

        let token = CancellationToken::new();
        let canceller = token.clone();
        let worker = std::thread::spawn(move || {
            let tracker = ActivityTracker::new(Duration::from_secs(1));
            role.create_worker(0).start_worker(&tracker, &token)
        });

        std::thread::sleep(Duration::from_millis(20));
        canceller.cancel();
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn test_same_role_is_identity() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let a: Arc<dyn ThreadRole> = Arc::new(IdleRole::new(runtime.handle().clone()));
        let b: Arc<dyn ThreadRole> = Arc::new(IdleRole::new(runtime.handle().clone()));
        assert!(same_role(&a, &Arc::clone(&a)));
        assert!(!same_role(&a, &b));
    }
}
