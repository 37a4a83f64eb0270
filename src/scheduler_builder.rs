use std::sync::Arc;
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::balancer::{ActorBalancer, BalancerThread};
use crate::error::{log_error_handler, ActorError, ErrorHandler, Result, SchedulerError};
use crate::idle_strategy::{BackoffIdleStrategy, IdleStrategy};
use crate::runner::{ActorRunner, RunnerLoop};
use crate::runner_pool::RunnerPool;
use crate::scheduler::{ActorScheduler, CloseTimeouts};
use crate::steady_config;

/// Configures and starts an [`ActorScheduler`].
///
/// Every setter takes and returns the builder by value. Nothing is checked until
/// [`SchedulerBuilder::build`], which validates the whole configuration before starting any
/// thread.
pub struct SchedulerBuilder {
    thread_count: usize,
    base_iterations_per_actor: usize,
    idle_strategy: Box<dyn IdleStrategy>,
    error_handler: ErrorHandler,
    imbalance_threshold: f64,
    initial_backoff: Duration,
    max_backoff: Duration,
    duration_sample_period: Duration,
    duration_sample_count: usize,
    timeouts: CloseTimeouts,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        SchedulerBuilder {
            thread_count: steady_config::DEFAULT_THREAD_COUNT,
            base_iterations_per_actor: steady_config::DEFAULT_BASE_ITERATIONS_PER_ACTOR,
            idle_strategy: Box::new(BackoffIdleStrategy::default()),
            error_handler: log_error_handler(),
            imbalance_threshold: steady_config::DEFAULT_IMBALANCE_THRESHOLD,
            initial_backoff: steady_config::DEFAULT_BALANCER_INITIAL_BACKOFF,
            max_backoff: steady_config::DEFAULT_BALANCER_MAX_BACKOFF,
            duration_sample_period: steady_config::DEFAULT_DURATION_SAMPLE_PERIOD,
            duration_sample_count: steady_config::DEFAULT_DURATION_SAMPLE_COUNT,
            timeouts: CloseTimeouts::default(),
        }
    }
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with thread count and imbalance threshold taken from the environment when
    /// `STEADY_SCHEDULER_THREADS` / `STEADY_SCHEDULER_IMBALANCE` are set.
    pub fn from_env() -> Self {
        Self::default()
            .thread_count(steady_config::thread_count_from_env())
            .imbalance_threshold(steady_config::imbalance_threshold_from_env())
    }

    /// Number of runner threads. Must be at least 1.
    pub fn thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Steps an actor may take per cycle while it keeps making progress. Must be at least 1.
    pub fn base_iterations_per_actor(mut self, iterations: usize) -> Self {
        self.base_iterations_per_actor = iterations;
        self
    }

    /// Idle policy; every runner gets its own fresh copy.
    pub fn idle_strategy<I: IdleStrategy + 'static>(mut self, idle_strategy: I) -> Self {
        self.idle_strategy = Box::new(idle_strategy);
        self
    }

    /// Called on the runner thread for every failed or panicked step.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ActorError) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Share gap between the busiest and idlest runner that triggers a migration, in `[0, 1]`.
    pub fn imbalance_threshold(mut self, threshold: f64) -> Self {
        self.imbalance_threshold = threshold;
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Length of the window over which a runner measures its busy fraction.
    pub fn duration_sample_period(mut self, period: Duration) -> Self {
        self.duration_sample_period = period;
        self
    }

    /// Step durations kept per actor for its average load.
    pub fn duration_sample_count(mut self, count: usize) -> Self {
        self.duration_sample_count = count;
        self
    }

    /// Bounds for the three waits in [`ActorScheduler::close`]: balancer join, runner stop
    /// and pool termination.
    pub fn close_timeouts(mut self, balancer: Duration, runners: Duration, pool: Duration) -> Self {
        self.timeouts = CloseTimeouts { balancer, runners, pool };
        self
    }

    /// Checks every parameter, in declaration order, and reports the first invalid one.
    pub fn validate(&self) -> Result<()> {
        self.ensure_thread_count()?;
        self.ensure_base_iterations()?;
        self.ensure_sample_period()?;
        self.ensure_sample_count()?;
        self.ensure_imbalance_threshold()?;
        self.ensure_backoff()?;
        Ok(())
    }

    fn ensure_thread_count(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(SchedulerError::invalid("thread_count", "must be greater than 0"));
        }
        Ok(())
    }

    fn ensure_base_iterations(&self) -> Result<()> {
        if self.base_iterations_per_actor == 0 {
            return Err(SchedulerError::invalid("base_iterations_per_actor", "must be greater than 0"));
        }
        Ok(())
    }

    fn ensure_sample_period(&self) -> Result<()> {
        if self.duration_sample_period.is_zero() {
            return Err(SchedulerError::invalid("duration_sample_period", "must be greater than 0"));
        }
        Ok(())
    }

    fn ensure_sample_count(&self) -> Result<()> {
        if self.duration_sample_count == 0 {
            return Err(SchedulerError::invalid("duration_sample_count", "must be greater than 0"));
        }
        Ok(())
    }

    fn ensure_imbalance_threshold(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.imbalance_threshold) {
            return Err(SchedulerError::invalid(
                "imbalance_threshold",
                format!("{} is outside [0.0, 1.0]", self.imbalance_threshold),
            ));
        }
        Ok(())
    }

    fn ensure_backoff(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(SchedulerError::invalid("initial_backoff", "must be greater than 0"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(SchedulerError::invalid(
                "max_backoff",
                format!("{:?} is below the initial backoff {:?}", self.max_backoff, self.initial_backoff),
            ));
        }
        Ok(())
    }

    /// Validates the configuration, then starts the runner threads and the balancer.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` before any thread is started, or `ThreadSpawn` if the OS refuses a
    /// thread, in which case the threads already started are stopped again.
    pub fn build(self) -> Result<ActorScheduler> {
        self.validate()?;

        let runners: Vec<Arc<ActorRunner>> = (0..self.thread_count).map(|i| Arc::new(ActorRunner::new(i))).collect();
        let mut pool = RunnerPool::new();
        for runner in &runners {
            let runner_loop = RunnerLoop::new(
                runner.clone(),
                self.idle_strategy.fresh(),
                self.error_handler.clone(),
                self.base_iterations_per_actor,
                self.duration_sample_period,
            );
            if let Err(e) = pool.spawn(runner_loop) {
                error!("unable to start runner {}: {}", runner.index(), e);
                runners.iter().for_each(|r| r.close());
                pool.await_termination(self.timeouts.pool);
                return Err(SchedulerError::ThreadSpawn(e));
            }
        }

        let balancer = Arc::new(ActorBalancer::new(
            runners.clone(),
            self.imbalance_threshold,
            self.initial_backoff,
            self.max_backoff,
        ));
        let balancer_thread = match BalancerThread::spawn(balancer.clone()) {
            Ok(thread) => thread,
            Err(e) => {
                error!("unable to start balancer: {}", e);
                runners.iter().for_each(|r| r.close());
                pool.await_termination(self.timeouts.pool);
                return Err(SchedulerError::ThreadSpawn(e));
            }
        };

        info!(
            "scheduler started with {} runners, idle strategy {}, imbalance threshold {}",
            self.thread_count,
            self.idle_strategy.alias(),
            self.imbalance_threshold
        );
        Ok(ActorScheduler::new(
            balancer,
            balancer_thread,
            pool,
            self.duration_sample_count,
            self.idle_strategy.alias(),
            self.timeouts,
        ))
    }
}
