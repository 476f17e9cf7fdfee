//! Role-switching thread pool
//!
//! The pool owns a fixed number of OS threads. Each thread loops forever:
//! build a worker for its current role, hand out the role-switch permit, run the
//! worker until its token is cancelled, repeat. Changing a thread's role takes
//! that permit first, so the switch only ever lands between two workers of the
//! thread, then swaps the role and cancels the running worker.
//!
//! A worker that panics or returns an error takes its thread down with it. The
//! pool logs the crash and starts a new OS thread for the same slot, which keeps
//! the role it had. Nothing is respawned once the pool is shutting down.

use crate::config::PoolConfig;
use crate::role::{same_role, ActivityTracker, IdleRole, ThreadRole};
use crate::scheduler::{RoleLimits, RoleScheduler, ScheduleReport, ThreadStat};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use netplus_core::{NetError, Result};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Index of the idle role in the role list
const IDLE: usize = 0;
const PERMIT_POLL: Duration = Duration::from_millis(20);
const PERMIT_WAIT: Duration = Duration::from_secs(2);
/// Pause before restarting a worker that returned on its own
const RESTART_BACKOFF: Duration = Duration::from_millis(10);

/// Point-in-time view of one pool thread
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    pub slot: usize,
    pub role: String,
    pub activity: f64,
    pub respawns: usize,
}

struct SlotState {
    role: Arc<dyn ThreadRole>,
    worker_token: CancellationToken,
    /// Activity of the current worker; replaced with every new worker so a
    /// moved thread carries no history into its new role
    tracker: Arc<ActivityTracker>,
}

struct PoolThread {
    slot: usize,
    state: Mutex<SlotState>,
    permit_tx: Sender<()>,
    permit_rx: Receiver<()>,
    /// Every OS thread started for this slot and not yet joined
    handles: Mutex<Vec<JoinHandle<()>>>,
    respawns: AtomicUsize,
}

impl PoolThread {
    fn new(slot: usize, role: Arc<dyn ThreadRole>, config: &PoolConfig) -> Self {
        let (permit_tx, permit_rx) = bounded(1);
        Self {
            slot,
            state: Mutex::new(SlotState {
                role,
                worker_token: CancellationToken::new(),
                tracker: Arc::new(ActivityTracker::new(config.activity_time_constant)),
            }),
            permit_tx,
            permit_rx,
            handles: Mutex::new(Vec::new()),
            respawns: AtomicUsize::new(0),
        }
    }

    fn role(&self) -> Arc<dyn ThreadRole> {
        Arc::clone(&self.state.lock().role)
    }

    fn activity_rate(&self) -> f64 {
        self.state.lock().tracker.activity_rate()
    }
}

struct PoolInner {
    config: PoolConfig,
    runtime: Handle,
    token: CancellationToken,
    threads: RwLock<Vec<Arc<PoolThread>>>,
    roles: RwLock<Vec<Arc<dyn ThreadRole>>>,
    scheduler: RoleScheduler,
    live: AtomicUsize,
    disposed: AtomicBool,
    scheduler_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Decrements the live-thread count when a pool thread exits, however it exits
struct LiveThread<'a>(&'a AtomicUsize);

impl Drop for LiveThread<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PoolInner {
    fn spawn(self: &Arc<Self>, thread: &Arc<PoolThread>) -> Result<()> {
        let mut handles = thread.handles.lock();
        if self.token.is_cancelled() {
            return Err(NetError::PoolShutdown);
        }
        handles.retain(|handle| !handle.is_finished());
        let pool = Arc::clone(self);
        let slot = Arc::clone(thread);
        let join = std::thread::Builder::new()
            .name(format!("netplus-pool-{}", thread.slot))
            .spawn(move || pool.run_thread(slot))?;
        handles.push(join);
        Ok(())
    }

    fn run_thread(self: Arc<Self>, thread: Arc<PoolThread>) {
        self.live.fetch_add(1, Ordering::SeqCst);
        let _live = LiveThread(&self.live);

        while !self.token.is_cancelled() {
            let (role, token, tracker) = {
                let mut state = thread.state.lock();
                let token = self.token.child_token();
                let tracker = Arc::new(ActivityTracker::new(self.config.activity_time_constant));
                state.worker_token = token.clone();
                state.tracker = Arc::clone(&tracker);
                (Arc::clone(&state.role), token, tracker)
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let mut worker = role.create_worker(thread.slot);
                role.registry().register(thread.slot, Arc::clone(&tracker));
                let _ = thread.permit_tx.try_send(());
                worker.start_worker(&tracker, &token)
            }));
            role.registry().unregister(thread.slot);

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };

            match failure {
                None => {
                    if !token.is_cancelled() {
                        std::thread::sleep(RESTART_BACKOFF);
                    }
                }
                Some(reason) => {
                    error!(
                        "Pool thread {} crashed in role {}: {}",
                        thread.slot,
                        role.name(),
                        reason
                    );
                    if !self.token.is_cancelled() {
                        thread.respawns.fetch_add(1, Ordering::SeqCst);
                        warn!("Respawning pool thread {} in role {}", thread.slot, role.name());
                        if let Err(e) = self.spawn(&thread) {
                            error!("Could not respawn pool thread {}: {}", thread.slot, e);
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Moves `thread` to `role` once it is between workers. Returns whether the
    /// role actually changed.
    fn set_role(&self, thread: &PoolThread, role: Arc<dyn ThreadRole>) -> Result<bool> {
        let deadline = Instant::now() + PERMIT_WAIT;
        loop {
            match thread.permit_rx.recv_timeout(PERMIT_POLL) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if self.token.is_cancelled() {
                        return Err(NetError::PoolShutdown);
                    }
                    if Instant::now() >= deadline {
                        return Err(NetError::WorkerFailed(format!(
                            "pool thread {} did not yield its role",
                            thread.slot
                        )));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(NetError::PoolShutdown),
            }
        }

        let mut state = thread.state.lock();
        if same_role(&state.role, &role) {
            drop(state);
            let _ = thread.permit_tx.try_send(());
            return Ok(false);
        }
        debug!(
            "Pool thread {}: {} -> {}",
            thread.slot,
            state.role.name(),
            role.name()
        );
        state.role = role;
        state.worker_token.cancel();
        Ok(true)
    }

    fn schedule_now(&self) -> Result<ScheduleReport> {
        if self.token.is_cancelled() {
            return Err(NetError::PoolShutdown);
        }
        let _pass = self.scheduler.lock_pass();
        let started = Instant::now();
        let threads = self.threads.read();
        let roles = self.roles.read().clone();

        let limits: Vec<RoleLimits> = roles
            .iter()
            .map(|role| RoleLimits {
                min_threads: role.min_threads(),
                max_threads: role.max_threads(),
            })
            .collect();
        let stats: Vec<ThreadStat> = threads
            .iter()
            .map(|thread| {
                let current = thread.role();
                ThreadStat {
                    slot: thread.slot,
                    role: roles.iter().position(|role| same_role(role, &current)),
                    activity: thread.activity_rate(),
                }
            })
            .collect();

        let mut report = ScheduleReport::default();
        for change in self.scheduler.plan(&limits, &stats, IDLE) {
            let Some(thread) = threads.get(change.slot) else {
                continue;
            };
            match self.set_role(thread, Arc::clone(&roles[change.to])) {
                Ok(true) => {
                    report.reassigned += 1;
                    if change.to == IDLE {
                        report.idled += 1;
                    }
                }
                Ok(false) => {}
                Err(NetError::PoolShutdown) => return Err(NetError::PoolShutdown),
                Err(e) => warn!("Skipping reassignment of thread {}: {}", change.slot, e),
            }
        }

        for role in &roles {
            role.invoke_scheduler();
        }

        report.duration = started.elapsed();
        debug!(
            "Scheduler pass took {:?}: {} reassigned, {} idled",
            report.duration, report.reassigned, report.idled
        );
        Ok(report)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Starts `config.threads` threads, all in the idle role
    pub fn new(config: PoolConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let idle: Arc<dyn ThreadRole> = Arc::new(IdleRole::new(runtime.clone()));
        let threads: Vec<Arc<PoolThread>> = (0..config.threads)
            .map(|slot| Arc::new(PoolThread::new(slot, Arc::clone(&idle), &config)))
            .collect();

        let inner = Arc::new(PoolInner {
            scheduler: RoleScheduler::new(&config),
            config,
            runtime,
            token: CancellationToken::new(),
            threads: RwLock::new(threads.clone()),
            roles: RwLock::new(vec![idle]),
            live: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            scheduler_task: Mutex::new(None),
        });
        let pool = Self { inner };

        for thread in &threads {
            pool.inner.spawn(thread)?;
        }
        info!("Thread pool started with {} threads", threads.len());
        Ok(pool)
    }

    /// Registers a role and runs a scheduling pass so it gets its minimum
    pub fn add_role(&self, role: Arc<dyn ThreadRole>) -> Result<ScheduleReport> {
        if self.inner.token.is_cancelled() {
            return Err(NetError::PoolShutdown);
        }
        info!(
            "Adding role {} ({}..={} threads)",
            role.name(),
            role.min_threads(),
            role.max_threads()
        );
        self.inner.roles.write().push(role);
        self.schedule_now()
    }

    /// Runs one scheduling pass on the calling thread
    pub fn schedule_now(&self) -> Result<ScheduleReport> {
        self.inner.schedule_now()
    }

    /// Runs a scheduling pass every `scheduler_interval` until the pool is disposed
    pub fn start_scheduler(&self) {
        let mut task = self.inner.scheduler_task.lock();
        if task.is_some() || self.inner.token.is_cancelled() {
            return;
        }
        let pool = Arc::clone(&self.inner);
        *task = Some(self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.scheduler_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = pool.token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let pass = Arc::clone(&pool);
                match tokio::task::spawn_blocking(move || pass.schedule_now()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(NetError::PoolShutdown)) => break,
                    Ok(Err(e)) => warn!("Scheduler pass failed: {}", e),
                    Err(e) => error!("Scheduler pass panicked: {}", e),
                }
            }
        }));
    }

    pub fn threads(&self) -> Vec<ThreadSnapshot> {
        self.inner
            .threads
            .read()
            .iter()
            .map(|thread| ThreadSnapshot {
                slot: thread.slot,
                role: thread.role().name().to_string(),
                activity: thread.activity_rate(),
                respawns: thread.respawns.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Threads currently assigned to the role called `name`
    pub fn role_thread_count(&self, name: &str) -> usize {
        self.inner
            .threads
            .read()
            .iter()
            .filter(|thread| thread.role().name() == name)
            .count()
    }

    /// OS threads currently running a pool loop
    pub fn live_threads(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Cancels every worker and joins every pool thread, including threads
    /// respawned while shutting down
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.token.cancel();
        if let Some(task) = self.inner.scheduler_task.lock().take() {
            task.abort();
        }

        let current = std::thread::current().id();
        let threads = self.inner.threads.read().clone();
        for thread in threads {
            loop {
                let handles = std::mem::take(&mut *thread.handles.lock());
                if handles.is_empty() {
                    break;
                }
                for handle in handles {
                    if handle.thread().id() == current {
                        continue;
                    }
                    if handle.join().is_err() {
                        warn!("Pool thread {} ended with a panic", thread.slot);
                    }
                }
            }
        }
        info!("Thread pool disposed");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.dispose();
    }
}
