//! Role scheduler
//!
//! Each pass looks at a snapshot of every pool thread (current role, smoothed
//! activity) and decides which threads should change roles:
//!
//! 1. Roles that are overloaded, or short of their minimum, take the least active
//!    thread that is underloaded and whose role can spare it. A role can spare a
//!    thread when it is above its minimum and not itself busy (mean activity at or
//!    below the steal threshold). Threads move one at a time and the running
//!    estimates are updated after every move, so a role stops asking as soon as
//!    it is satisfied or reaches its maximum.
//! 2. Whatever underloaded threads are left in a role that can spare them are
//!    parked in the idle role.
//!
//! Roles without threads have no mean and are served first; they are needy only
//! when their minimum is above zero. Planning is pure; `ThreadPool` applies the
//! plan and reports what actually changed.

use crate::config::PoolConfig;
use parking_lot::{Mutex, MutexGuard};
use std::cmp::Ordering;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleLimits {
    pub min_threads: usize,
    pub max_threads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreadStat {
    pub slot: usize,
    /// Index into the role list; `None` when the thread's role is not tracked
    pub role: Option<usize>,
    pub activity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reassignment {
    pub slot: usize,
    pub from: Option<usize>,
    pub to: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleReport {
    pub duration: Duration,
    /// Threads whose role changed in the pass
    pub reassigned: usize,
    /// Of those, threads parked in the idle role
    pub idled: usize,
}

#[derive(Debug, Clone, Copy)]
struct RoleStat {
    limits: RoleLimits,
    threads: usize,
    total_activity: f64,
}

impl RoleStat {
    fn mean(&self) -> Option<f64> {
        if self.threads == 0 {
            None
        } else {
            Some(self.total_activity / self.threads as f64)
        }
    }

    fn add(&mut self, activity: f64) {
        self.threads += 1;
        self.total_activity += activity;
    }

    fn remove(&mut self, activity: f64) {
        self.threads = self.threads.saturating_sub(1);
        self.total_activity = (self.total_activity - activity).max(0.0);
    }
}

pub struct RoleScheduler {
    underload: f64,
    overload: f64,
    steal: f64,
    pass: Mutex<()>,
}

impl RoleScheduler {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            underload: config.underload_threshold,
            overload: config.overload_threshold,
            steal: config.steal_threshold,
            pass: Mutex::new(()),
        }
    }

    /// Serialises passes; held for the whole snapshot-plan-apply sequence
    pub fn lock_pass(&self) -> MutexGuard<'_, ()> {
        self.pass.lock()
    }

    pub fn plan(&self, roles: &[RoleLimits], threads: &[ThreadStat], idle: usize) -> Vec<Reassignment> {
        let mut stats: Vec<RoleStat> = roles
            .iter()
            .map(|limits| RoleStat {
                limits: *limits,
                threads: 0,
                total_activity: 0.0,
            })
            .collect();
        let tracked = |role: Option<usize>| role.filter(|index| *index < roles.len());

        for thread in threads {
            if let Some(index) = tracked(thread.role) {
                stats[index].add(thread.activity);
            }
        }

        let mut candidates: Vec<ThreadStat> = threads.to_vec();
        candidates.sort_by(|a, b| a.activity.total_cmp(&b.activity));
        let mut taken = vec![false; candidates.len()];
        let mut moves = Vec::new();

        let mut order: Vec<usize> = (0..stats.len()).collect();
        order.sort_by(|a, b| by_mean(stats[*a].mean(), stats[*b].mean()));

        for &needy in order.iter().rev() {
            if needy == idle {
                continue;
            }
            while self.is_needy(&stats[needy]) {
                let donor = candidates.iter().enumerate().find(|(i, thread)| {
                    !taken[*i]
                        && tracked(thread.role) != Some(needy)
                        && thread.activity <= self.underload
                        && self.can_spare(tracked(thread.role).map(|index| &stats[index]))
                });
                let Some((i, thread)) = donor.map(|(i, thread)| (i, *thread)) else {
                    break;
                };

                taken[i] = true;
                let from = tracked(thread.role);
                if let Some(index) = from {
                    stats[index].remove(thread.activity);
                }
                stats[needy].add(thread.activity);
                moves.push(Reassignment {
                    slot: thread.slot,
                    from,
                    to: needy,
                });
            }
        }

        if idle < stats.len() {
            for (i, thread) in candidates.iter().enumerate() {
                if taken[i] || thread.activity > self.underload {
                    continue;
                }
                let Some(index) = tracked(thread.role).filter(|index| *index != idle) else {
                    continue;
                };
                if !self.can_spare(Some(&stats[index])) {
                    continue;
                }
                stats[index].remove(thread.activity);
                stats[idle].add(thread.activity);
                moves.push(Reassignment {
                    slot: thread.slot,
                    from: Some(index),
                    to: idle,
                });
            }
        }

        moves
    }

    fn is_needy(&self, role: &RoleStat) -> bool {
        if role.threads >= role.limits.max_threads {
            return false;
        }
        role.threads < role.limits.min_threads || role.mean().map_or(false, |mean| mean >= self.overload)
    }

    fn can_spare(&self, role: Option<&RoleStat>) -> bool {
        match role {
            None => true,
            Some(role) => {
                role.threads > role.limits.min_threads
                    && role.mean().map_or(true, |mean| mean <= self.steal)
            }
        }
    }
}

/// Ascending by mean; roles without a mean sort last so they are served first
fn by_mean(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.total_cmp(&b),
    }
}
