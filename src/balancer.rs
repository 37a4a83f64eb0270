//! Placement of new actors and the background loop that migrates actors between runners.
//!
//! Load is compared as each runner's share of the total per-cycle cost, where a runner's
//! cost is the sum of the average step durations of its actors. The busy fraction a runner
//! measures saturates at 1.0 as soon as its actors keep it occupied, so it cannot tell three
//! saturated actors from one; shares can. A handle of share `h` only moves from a source of
//! share `S` to a destination of share `D` when `h < S - D`, which strictly lowers the sum of
//! squared shares. Stable measurements therefore never make the balancer oscillate.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use itertools::{Itertools, MinMaxResult};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::actor_handle::ActorHandle;
use crate::error::{Result, SchedulerError};
use crate::runner::{ActorRunner, RunnerLoad};
use crate::runner_pool::count_spawn;
use crate::steady_config;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalancerState {
    Running,
    Rebalancing,
    Stopped,
}

/// One handle moved by the balancer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Migration {
    pub handle_id: u64,
    pub from: usize,
    pub to: usize,
}

/// Doubles `current`, capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.checked_mul(2).unwrap_or(max).min(max)
}

/// Chooses which candidate `(id, cost)` to move from a runner with cycle cost `source_cost` to
/// one with `destination_cost`. Costs are in nanoseconds so ties compare exactly.
///
/// Only candidates with `cost < source_cost - destination_cost` qualify. The largest
/// qualifying cost up to half the gap is preferred, otherwise the smallest qualifying one.
pub fn pick_candidate(source_cost: u128, destination_cost: u128, candidates: &[(u64, u128)]) -> Option<u64> {
    let gap = source_cost.saturating_sub(destination_cost);
    let qualifying = candidates.iter().filter(|(_, cost)| *cost < gap);

    qualifying
        .clone()
        .filter(|(_, cost)| cost * 2 <= gap)
        .max_by_key(|(_, cost)| *cost)
        .or_else(|| qualifying.min_by_key(|(_, cost)| *cost))
        .map(|(id, _)| *id)
}

/// Spread between the highest and the lowest load share.
pub fn imbalance_of(loads: &[RunnerLoad]) -> f64 {
    match loads.iter().map(|l| l.share).minmax_by(|a, b| a.total_cmp(b)) {
        MinMaxResult::MinMax(min, max) => max - min,
        MinMaxResult::OneElement(_) | MinMaxResult::NoElements => 0.0,
    }
}

pub struct ActorBalancer {
    runners: Vec<Arc<ActorRunner>>,
    imbalance_threshold: f64,
    initial_backoff: Duration,
    max_backoff: Duration,
    state: Mutex<BalancerState>,
    backoff_nanos: AtomicU64,
    next_round_robin: AtomicUsize,
    checks: AtomicU64,
    rebalances: AtomicU64,
    migrations: AtomicU64,
}

impl ActorBalancer {
    pub(crate) fn new(runners: Vec<Arc<ActorRunner>>, imbalance_threshold: f64, initial_backoff: Duration, max_backoff: Duration) -> Self {
        ActorBalancer {
            runners,
            imbalance_threshold,
            initial_backoff: steady_config::bounded_wait(initial_backoff),
            max_backoff: steady_config::bounded_wait(max_backoff),
            state: Mutex::new(BalancerState::Running),
            backoff_nanos: AtomicU64::new(steady_config::bounded_wait(initial_backoff).as_nanos() as u64),
            next_round_robin: AtomicUsize::new(0),
            checks: AtomicU64::new(0),
            rebalances: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
        }
    }

    pub fn runners(&self) -> &[Arc<ActorRunner>] {
        &self.runners
    }

    pub fn state(&self) -> BalancerState {
        *self.state.lock()
    }

    fn set_state(&self, state: BalancerState) {
        *self.state.lock() = state;
    }

    /// Sleep the balancer takes before its next check.
    pub fn current_backoff(&self) -> Duration {
        Duration::from_nanos(self.backoff_nanos.load(Ordering::Relaxed))
    }

    /// Completed imbalance checks.
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Checks that found the imbalance above the threshold and entered `Rebalancing`.
    pub fn rebalances(&self) -> u64 {
        self.rebalances.load(Ordering::Relaxed)
    }

    pub fn migrations(&self) -> u64 {
        self.migrations.load(Ordering::Relaxed)
    }

    /// Load of every runner with its share of the total cycle cost filled in.
    pub fn runner_loads(&self) -> Vec<RunnerLoad> {
        let mut loads: Vec<RunnerLoad> = self.runners.iter().map(|r| r.load()).collect();
        let total = loads.iter().map(|l| l.cycle_cost.as_secs_f64()).sum::<f64>();
        if total > 0.0 {
            for load in &mut loads {
                load.share = load.cycle_cost.as_secs_f64() / total;
            }
        }
        loads
    }

    pub fn imbalance(&self) -> f64 {
        imbalance_of(&self.runner_loads())
    }

    /// Assigns `handle` to the runner with the lowest share, fewest actors breaking ties.
    /// Round-robin while no runner has any measured cost. Returns the chosen runner index.
    pub(crate) fn place(&self, handle: ActorHandle) -> usize {
        let loads = self.runner_loads();
        let index = if loads.iter().all(|l| l.share == 0.0) {
            self.next_round_robin.fetch_add(1, Ordering::Relaxed) % self.runners.len()
        } else {
            loads
                .iter()
                .min_by(|a, b| a.share.total_cmp(&b.share).then(a.actors.cmp(&b.actors)))
                .map(|l| l.index)
                .unwrap_or(0)
        };
        debug!("placing actor {} on runner {}", handle.id(), index);
        self.runners[index].assign(handle);
        index
    }

    /// Assigns `handle` to a specific runner.
    pub(crate) fn place_on(&self, index: usize, handle: ActorHandle) -> Result<()> {
        let runner = self.runners.get(index).ok_or(SchedulerError::NoSuchRunner(index))?;
        debug!("placing actor {} on requested runner {}", handle.id(), index);
        runner.assign(handle);
        Ok(())
    }

    /// Moves `handle` from runner `from` to runner `to`. False if it was no longer on `from`.
    pub(crate) fn migrate(&self, handle: &ActorHandle, from: usize, to: usize) -> bool {
        let (Some(source), Some(destination)) = (self.runners.get(from), self.runners.get(to)) else {
            return false;
        };
        if from == to || !source.remove(handle) {
            return false;
        }
        destination.assign(handle.clone());
        self.migrations.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// One imbalance check. Moves at most one handle and reports it.
    pub fn rebalance_once(&self) -> Option<Migration> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let loads = self.runner_loads();
        let (min, max) = match loads.iter().position_minmax_by(|a, b| a.share.total_cmp(&b.share)) {
            MinMaxResult::MinMax(min, max) => (min, max),
            MinMaxResult::OneElement(_) | MinMaxResult::NoElements => return None,
        };
        let (source, destination) = (&loads[max], &loads[min]);
        let imbalance = source.share - destination.share;
        if imbalance <= self.imbalance_threshold {
            return None;
        }

        self.rebalances.fetch_add(1, Ordering::Relaxed);
        self.set_state(BalancerState::Rebalancing);
        let moved = self.move_one(source, destination, imbalance);
        self.set_state(BalancerState::Running);
        moved
    }

    /// Moves the best fitting handle from `source` to `destination`, if any fits the gap.
    fn move_one(&self, source: &RunnerLoad, destination: &RunnerLoad, imbalance: f64) -> Option<Migration> {
        let handles: Vec<ActorHandle> = self.runners[source.index]
            .handles()
            .into_iter()
            .filter(|h| !h.is_cancelled())
            .collect();
        let candidates: Vec<(u64, u128)> = handles.iter().map(|h| (h.id(), h.average_load().as_nanos())).collect();

        let Some(chosen) = pick_candidate(source.cycle_cost.as_nanos(), destination.cycle_cost.as_nanos(), &candidates) else {
            trace!(
                "imbalance {:.3} between runner {} and {} but no actor fits the gap",
                imbalance, source.index, destination.index
            );
            return None;
        };
        let handle = handles.iter().find(|h| h.id() == chosen)?;
        if !self.migrate(handle, source.index, destination.index) {
            return None;
        }
        debug!(
            "migrated actor {} from runner {} to runner {}, imbalance was {:.3}",
            chosen, source.index, destination.index, imbalance
        );
        Some(Migration { handle_id: chosen, from: source.index, to: destination.index })
    }

    /// Balancer thread body. Checks after every backoff sleep until `stop` fires or its sender
    /// is dropped.
    fn run(&self, stop: Receiver<()>) {
        info!("balancer started for {} runners", self.runners.len());
        let mut backoff = self.initial_backoff;
        loop {
            self.backoff_nanos.store(backoff.as_nanos() as u64, Ordering::Relaxed);
            match stop.recv_deadline(steady_config::deadline_after(backoff)) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let moved = self.rebalance_once();
            backoff = match moved {
                Some(_) => self.initial_backoff,
                None => next_backoff(backoff, self.max_backoff),
            };
            trace!("balancer backoff {:?}", backoff);
        }
        self.set_state(BalancerState::Stopped);
        info!("balancer stopped after {} migrations", self.migrations());
    }
}

/// Control side of the running balancer thread.
pub(crate) struct BalancerThread {
    stop_tx: Sender<()>,
    // never sent on; disconnects when the thread exits
    done_rx: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl BalancerThread {
    pub(crate) fn spawn(balancer: Arc<ActorBalancer>) -> io::Result<Self> {
        let (stop_tx, stop_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded::<()>(1);
        let join = thread::Builder::new().name("steady-balancer".to_string()).spawn(move || {
            let _done = done_tx;
            balancer.run(stop_rx);
        })?;
        count_spawn();
        Ok(BalancerThread { stop_tx, done_rx, join: Some(join) })
    }

    /// Stops the thread and joins it if it exits within `timeout`. Returns true if joined.
    pub(crate) fn close(&mut self, timeout: Duration) -> bool {
        let Some(join) = self.join.take() else {
            return true;
        };
        let _ = self.stop_tx.try_send(());
        match self.done_rx.recv_deadline(steady_config::deadline_after(timeout)) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("balancer did not stop within {:?}, abandoning it", timeout);
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if join.join().is_err() {
                    error!("balancer thread panicked");
                }
                true
            }
        }
    }
}
