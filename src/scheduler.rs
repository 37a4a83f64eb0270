//! The public facade: owns the runner threads and the balancer and hands out actor handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::actor::Actor;
use crate::actor_handle::ActorHandle;
use crate::balancer::{imbalance_of, ActorBalancer, BalancerThread};
use crate::error::{Result, SchedulerError};
use crate::runner::{ActorRunner, RunnerLoad};
use crate::runner_pool::RunnerPool;
use crate::scheduler_builder::SchedulerBuilder;
use crate::steady_config;

/// Lifecycle of a scheduler. Only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Closing,
    Terminated,
}

/// Upper bounds for the waits performed by [`ActorScheduler::close`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseTimeouts {
    pub balancer: Duration,
    pub runners: Duration,
    pub pool: Duration,
}

impl Default for CloseTimeouts {
    fn default() -> Self {
        CloseTimeouts {
            balancer: steady_config::DEFAULT_BALANCER_CLOSE_TIMEOUT,
            runners: steady_config::DEFAULT_RUNNER_CLOSE_TIMEOUT,
            pool: steady_config::DEFAULT_POOL_TERMINATION_TIMEOUT,
        }
    }
}

impl CloseTimeouts {
    /// Longest time `close` can take.
    pub fn total(&self) -> Duration {
        self.balancer.saturating_add(self.runners).saturating_add(self.pool)
    }
}

/// Runs many long lived actors on a fixed set of runner threads and keeps their load even.
///
/// ```no_run
/// use steady_scheduler::{ActorScheduler, StepResult};
///
/// let scheduler = ActorScheduler::with_threads(2)?;
/// let mut ticks = 0u64;
/// let handle = scheduler.schedule(move || -> StepResult {
///     ticks += 1;
///     Ok(true)
/// })?;
/// handle.cancel();
/// scheduler.close();
/// # Ok::<(), steady_scheduler::SchedulerError>(())
/// ```
pub struct ActorScheduler {
    balancer: Arc<ActorBalancer>,
    balancer_thread: Mutex<BalancerThread>,
    pool: Mutex<RunnerPool>,
    state: RwLock<SchedulerState>,
    next_id: AtomicU64,
    sample_count: usize,
    idle_alias: &'static str,
    timeouts: CloseTimeouts,
}

impl ActorScheduler {
    pub(crate) fn new(
        balancer: Arc<ActorBalancer>,
        balancer_thread: BalancerThread,
        pool: RunnerPool,
        sample_count: usize,
        idle_alias: &'static str,
        timeouts: CloseTimeouts,
    ) -> Self {
        ActorScheduler {
            balancer,
            balancer_thread: Mutex::new(balancer_thread),
            pool: Mutex::new(pool),
            state: RwLock::new(SchedulerState::Running),
            next_id: AtomicU64::new(1),
            sample_count,
            idle_alias,
            timeouts,
        }
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Scheduler with every default, including a single runner thread.
    pub fn create_default() -> Result<Self> {
        SchedulerBuilder::new().build()
    }

    /// Scheduler with `threads` runners and every other default.
    pub fn with_threads(threads: usize) -> Result<Self> {
        SchedulerBuilder::new().thread_count(threads).build()
    }

    /// Hands `actor` to the least loaded runner and returns its handle.
    ///
    /// Safe to call from any thread, including from inside an actor step.
    ///
    /// # Errors
    ///
    /// `Closed` once [`ActorScheduler::close`] has started.
    pub fn schedule<A: Actor + 'static>(&self, actor: A) -> Result<ActorHandle> {
        let state = self.state.read();
        self.ensure_running(*state)?;
        let handle = self.new_handle(Box::new(actor));
        self.balancer.place(handle.clone());
        Ok(handle)
    }

    /// Hands `actor` to runner `index`. The balancer may move it later.
    ///
    /// # Errors
    ///
    /// `Closed` once closing started, `NoSuchRunner` for an index outside the pool.
    pub fn schedule_on<A: Actor + 'static>(&self, index: usize, actor: A) -> Result<ActorHandle> {
        let state = self.state.read();
        self.ensure_running(*state)?;
        if index >= self.runner_count() {
            return Err(SchedulerError::NoSuchRunner(index));
        }
        let handle = self.new_handle(Box::new(actor));
        self.balancer.place_on(index, handle.clone())?;
        Ok(handle)
    }

    fn ensure_running(&self, state: SchedulerState) -> Result<()> {
        if state != SchedulerState::Running {
            warn!("rejected actor, scheduler is {:?}", state);
            return Err(SchedulerError::Closed);
        }
        Ok(())
    }

    fn new_handle(&self, actor: Box<dyn Actor>) -> ActorHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        ActorHandle::new(id, actor, self.sample_count)
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn runner_count(&self) -> usize {
        self.balancer.runners().len()
    }

    /// Current load of every runner, shares filled in.
    pub fn runner_loads(&self) -> Vec<RunnerLoad> {
        self.balancer.runner_loads()
    }

    /// Spread between the highest and lowest runner load share.
    pub fn imbalance(&self) -> f64 {
        self.balancer.imbalance()
    }

    /// Current sleep of the balancer between checks.
    pub fn balancer_backoff(&self) -> Duration {
        self.balancer.current_backoff()
    }

    /// Actors moved by the balancer so far.
    pub fn migrations(&self) -> u64 {
        self.balancer.migrations()
    }

    #[cfg(test)]
    pub(crate) fn balancer(&self) -> &ActorBalancer {
        &self.balancer
    }

    fn runners(&self) -> &[Arc<ActorRunner>] {
        self.balancer.runners()
    }

    /// Stops the balancer and every runner, then waits for the runner threads.
    ///
    /// Each wait is bounded by its [`CloseTimeouts`] entry; a thread that does not stop in
    /// time is abandoned with a warning and `close` returns anyway. Calling `close` again, or
    /// concurrently, returns immediately.
    pub fn close(&self) {
        {
            let mut state = self.state.write();
            if *state != SchedulerState::Running {
                return;
            }
            *state = SchedulerState::Closing;
        }
        info!("closing scheduler with {} runners", self.runner_count());

        self.balancer_thread.lock().close(self.timeouts.balancer);

        let deadline = steady_config::deadline_after(self.timeouts.runners);
        self.runners().iter().for_each(|r| r.close());
        for runner in self.runners() {
            if !runner.await_stopped(deadline) {
                warn!("runner {} did not stop within {:?}", runner.index(), self.timeouts.runners);
            }
        }

        let terminated = self.pool.lock().await_termination(self.timeouts.pool);
        *self.state.write() = SchedulerState::Terminated;
        if terminated {
            info!("scheduler closed");
        } else {
            warn!("scheduler closed with abandoned runner threads");
        }
    }
}

impl Drop for ActorScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for ActorScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loads = self.runner_loads();
        write!(
            f,
            "ActorScheduler[{:?}, idle={}, imbalance={:.3}, backoff={:?}, migrations={}]",
            self.state(),
            self.idle_alias,
            imbalance_of(&loads),
            self.balancer_backoff(),
            self.migrations()
        )?;
        for load in &loads {
            write!(
                f,
                " runner#{}(actors={}, busy={:.2}, cost={:?}, share={:.3})",
                load.index, load.actors, load.busy_fraction, load.cycle_cost, load.share
            )?;
        }
        Ok(())
    }
}
