//! Runners: one worker thread each, stepping every actor assigned to it once per cycle.
//!
//! [`ActorRunner`] is the shared half. It holds the assignment set, the only structure in the
//! scheduler written by more than one thread (the runner itself and the balancer), plus the
//! load figures the runner publishes. [`RunnerLoop`] is the thread confined half that drives
//! the actors, measures busy time and engages the idle strategy.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use dashmap::DashMap;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::actor_handle::ActorHandle;
use crate::error::{ActorError, ErrorHandler};
use crate::idle_strategy::IdleStrategy;

/// Point in time load of one runner, as seen by the balancer.
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerLoad {
    /// Runner index within its scheduler.
    pub index: usize,
    /// Number of assigned, non cancelled actors.
    pub actors: usize,
    /// Fraction of the last measurement window spent stepping actors.
    pub busy_fraction: f64,
    /// Fraction of the last measurement window spent in the idle strategy.
    pub idle_fraction: f64,
    /// Sum of the average step durations of the assigned actors.
    pub cycle_cost: Duration,
    /// This runner's part of the total cycle cost of all runners, in `[0, 1]`.
    pub share: f64,
}

/// Shared state of one runner.
pub struct ActorRunner {
    index: usize,
    assigned: DashMap<u64, ActorHandle>,
    running: AtomicBool,
    stopped: AtomicBool,
    busy_fraction_bits: AtomicU64,
    idle_fraction_bits: AtomicU64,
    cycles: AtomicU64,
    thread: OnceLock<Thread>,
}

impl ActorRunner {
    pub(crate) fn new(index: usize) -> Self {
        ActorRunner {
            index,
            assigned: DashMap::new(),
            running: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            busy_fraction_bits: AtomicU64::new(0f64.to_bits()),
            idle_fraction_bits: AtomicU64::new(0f64.to_bits()),
            cycles: AtomicU64::new(0),
            thread: OnceLock::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Adds a handle to this runner's set. Safe while the runner is mid cycle; the handle is
    /// picked up on the next cycle.
    pub fn assign(&self, handle: ActorHandle) {
        handle.set_owner(self.index);
        self.assigned.insert(handle.id(), handle);
    }

    /// Takes a handle out of this runner's set. Returns false if it was not assigned here.
    pub fn remove(&self, handle: &ActorHandle) -> bool {
        match self.assigned.remove(&handle.id()) {
            Some((_, removed)) => {
                removed.clear_owner(self.index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, handle: &ActorHandle) -> bool {
        self.assigned.contains_key(&handle.id())
    }

    /// Number of assigned actors that have not been cancelled.
    pub fn actor_count(&self) -> usize {
        self.assigned.iter().filter(|e| !e.value().is_cancelled()).count()
    }

    /// Snapshot of the assigned handles, cancelled ones included.
    pub fn handles(&self) -> Vec<ActorHandle> {
        self.assigned.iter().map(|e| e.value().clone()).collect()
    }

    /// Busy fraction of the last completed measurement window.
    pub fn busy_fraction(&self) -> f64 {
        f64::from_bits(self.busy_fraction_bits.load(Ordering::Relaxed))
    }

    pub fn idle_fraction(&self) -> f64 {
        f64::from_bits(self.idle_fraction_bits.load(Ordering::Relaxed))
    }

    /// Sum of the average step durations of all assigned, non cancelled actors.
    pub fn cycle_cost(&self) -> Duration {
        self.assigned
            .iter()
            .filter(|e| !e.value().is_cancelled())
            .map(|e| e.value().average_load())
            .sum()
    }

    /// Cycles completed since the runner started.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Load figures with `share` left at zero; the balancer fills it in.
    pub fn load(&self) -> RunnerLoad {
        RunnerLoad {
            index: self.index,
            actors: self.actor_count(),
            busy_fraction: self.busy_fraction(),
            idle_fraction: self.idle_fraction(),
            cycle_cost: self.cycle_cost(),
            share: 0.0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once the runner thread left its loop.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Asks the runner to stop after its current cycle and wakes it if it is parked.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Waits until the runner thread stopped or `deadline` passed. Returns true if stopped.
    pub fn await_stopped(&self, deadline: Instant) -> bool {
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(1)));
        }
    }

    fn publish_window(&self, busy_fraction: f64, idle_fraction: f64) {
        self.busy_fraction_bits.store(busy_fraction.to_bits(), Ordering::Relaxed);
        self.idle_fraction_bits.store(idle_fraction.to_bits(), Ordering::Relaxed);
    }
}

/// Thread confined half of a runner.
pub(crate) struct RunnerLoop {
    runner: Arc<ActorRunner>,
    idle_strategy: Box<dyn IdleStrategy>,
    error_handler: ErrorHandler,
    base_iterations: usize,
    sample_period: Duration,
    cycle: Vec<ActorHandle>,
    progressed: Vec<ActorHandle>,
    window_start: Instant,
    window_busy: Duration,
    window_idle: Duration,
}

impl RunnerLoop {
    pub(crate) fn new(
        runner: Arc<ActorRunner>,
        idle_strategy: Box<dyn IdleStrategy>,
        error_handler: ErrorHandler,
        base_iterations: usize,
        sample_period: Duration,
    ) -> Self {
        RunnerLoop {
            runner,
            idle_strategy,
            error_handler,
            base_iterations: base_iterations.max(1),
            sample_period,
            cycle: Vec::new(),
            progressed: Vec::new(),
            window_start: Instant::now(),
            window_busy: Duration::ZERO,
            window_idle: Duration::ZERO,
        }
    }

    /// Drives the assigned actors until the runner is closed, then drains and releases them.
    pub(crate) fn run(mut self) {
        let _ = self.runner.thread.set(thread::current());
        info!("runner {} started", self.runner.index);
        self.window_start = Instant::now();
        while self.runner.is_running() {
            self.cycle_once();
        }
        self.drain();
        self.release_all();
        self.runner.stopped.store(true, Ordering::SeqCst);
        info!("runner {} stopped after {} cycles", self.runner.index, self.runner.cycles());
    }

    /// One cycle followed by the idle strategy when nothing progressed. Returns the progress flag.
    pub(crate) fn cycle_once(&mut self) -> bool {
        let progress = self.run_cycle();
        if progress {
            self.idle_strategy.reset();
        } else {
            let start = Instant::now();
            self.idle_strategy.idle();
            self.window_idle += start.elapsed();
        }
        self.roll_window();
        progress
    }

    fn run_cycle(&mut self) -> bool {
        let mut cycle = mem::take(&mut self.cycle);
        cycle.extend(self.runner.assigned.iter().map(|e| e.value().clone()));
        self.progressed.clear();

        let mut progress = false;
        for handle in &cycle {
            if handle.is_cancelled() {
                self.retire(handle);
                continue;
            }
            if self.step_actor(handle, self.base_iterations) {
                progress = true;
                self.progressed.push(handle.clone());
            }
        }

        cycle.clear();
        self.cycle = cycle;
        self.runner.cycles.fetch_add(1, Ordering::Relaxed);
        progress
    }

    /// Steps one actor up to `iterations` times while it reports progress. Returns true if
    /// any step made progress.
    fn step_actor(&mut self, handle: &ActorHandle, iterations: usize) -> bool {
        let Some(mut guard) = handle.try_lock_actor() else {
            // still held by the runner it was migrated away from
            return false;
        };
        if !handle.is_owned_by(self.runner.index) {
            return false;
        }
        let Some(actor) = guard.as_mut() else {
            return false;
        };

        let mut progress = false;
        for _ in 0..iterations {
            if handle.is_cancelled() {
                break;
            }
            let start = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| actor.step()));
            let elapsed = start.elapsed();
            handle.record_duration(elapsed);
            handle.count_invocation();
            self.window_busy += elapsed;

            match outcome {
                Ok(Ok(true)) => progress = true,
                Ok(Ok(false)) => break,
                Ok(Err(source)) => {
                    self.report(ActorError::Failed { actor_id: handle.id(), source });
                    break;
                }
                Err(payload) => {
                    self.report(ActorError::from_panic(handle.id(), payload));
                    break;
                }
            }
        }
        progress
    }

    fn report(&self, error: ActorError) {
        let handler = &self.error_handler;
        if panic::catch_unwind(AssertUnwindSafe(|| handler(&error))).is_err() {
            error!("runner {} error handler panicked while handling: {}", self.runner.index, error);
        }
    }

    /// Removes and drops a cancelled actor. Retried next cycle if another runner still holds it.
    fn retire(&self, handle: &ActorHandle) {
        if let Some(mut guard) = handle.try_lock_actor() {
            let actor = guard.take();
            drop(guard);
            self.runner.assigned.remove(&handle.id());
            handle.clear_owner(self.runner.index);
            if let Some(actor) = actor {
                debug!("runner {} released cancelled actor {} ({})", self.runner.index, handle.id(), actor.name());
            }
        }
    }

    fn roll_window(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.sample_period && !elapsed.is_zero() {
            let span = elapsed.as_secs_f64();
            let busy = (self.window_busy.as_secs_f64() / span).clamp(0.0, 1.0);
            let idle = (self.window_idle.as_secs_f64() / span).clamp(0.0, 1.0);
            self.runner.publish_window(busy, idle);
            self.window_start = Instant::now();
            self.window_busy = Duration::ZERO;
            self.window_idle = Duration::ZERO;
        }
    }

    /// Best effort: one more step for every actor that was still making progress.
    fn drain(&mut self) {
        let progressed = mem::take(&mut self.progressed);
        for handle in &progressed {
            if !handle.is_cancelled() {
                self.step_actor(handle, 1);
            }
        }
        trace!("runner {} drained {} actors", self.runner.index, progressed.len());
    }

    fn release_all(&mut self) {
        for handle in self.runner.handles() {
            self.runner.assigned.remove(&handle.id());
            handle.clear_owner(self.runner.index);
            if let Some(mut guard) = handle.try_lock_actor() {
                guard.take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::StepResult;
    use crate::error::log_error_handler;
    use crate::idle_strategy::NoOpIdleStrategy;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct CountingIdle {
        idles: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
    }

    impl IdleStrategy for CountingIdle {
        fn idle(&mut self) {
            self.idles.fetch_add(1, Ordering::SeqCst);
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn fresh(&self) -> Box<dyn IdleStrategy> {
            Box::new(self.clone())
        }

        fn alias(&self) -> &'static str {
            "counting"
        }
    }

    fn test_loop(runner: &Arc<ActorRunner>, iterations: usize) -> RunnerLoop {
        RunnerLoop::new(runner.clone(), Box::new(NoOpIdleStrategy), log_error_handler(), iterations, Duration::from_millis(1))
    }

    fn counting_handle(id: u64, progress: bool) -> (ActorHandle, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = calls.clone();
        let handle = ActorHandle::new(id, Box::new(move || -> StepResult {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(progress)
        }), 16);
        (handle, calls)
    }

    #[test]
    fn test_each_actor_stepped_once_per_cycle() {
        let runner = Arc::new(ActorRunner::new(0));
        let mut runner_loop = test_loop(&runner, 1);
        let (a, a_calls) = counting_handle(1, true);
        let (b, b_calls) = counting_handle(2, false);
        runner.assign(a.clone());
        runner.assign(b.clone());

        assert!(runner_loop.cycle_once());
        assert!(runner_loop.cycle_once());
        assert_eq!(a_calls.load(Ordering::SeqCst), 2);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.invocation_count(), 2);
        assert_eq!(a.sample_count(), 2);
        assert_eq!(runner.cycles(), 2);
    }

    #[test]
    fn test_base_iterations_repeat_progressing_actors() {
        let runner = Arc::new(ActorRunner::new(0));
        let mut runner_loop = test_loop(&runner, 3);
        let (busy, busy_calls) = counting_handle(1, true);
        let (quiet, quiet_calls) = counting_handle(2, false);
        runner.assign(busy);
        runner.assign(quiet);

        runner_loop.cycle_once();
        assert_eq!(busy_calls.load(Ordering::SeqCst), 3);
        assert_eq!(quiet_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_strategy_engaged_only_without_progress() {
        let runner = Arc::new(ActorRunner::new(0));
        let idle = CountingIdle::default();
        let mut runner_loop = RunnerLoop::new(runner.clone(), idle.fresh(), log_error_handler(), 1, Duration::from_millis(1));
        let (quiet, _) = counting_handle(1, false);
        runner.assign(quiet.clone());

        assert!(!runner_loop.cycle_once());
        assert!(!runner_loop.cycle_once());
        assert_eq!(idle.idles.load(Ordering::SeqCst), 2);
        assert_eq!(idle.resets.load(Ordering::SeqCst), 0);

        let (busy, _) = counting_handle(2, true);
        runner.assign(busy);
        assert!(runner_loop.cycle_once());
        assert_eq!(idle.idles.load(Ordering::SeqCst), 2);
        assert_eq!(idle.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_actor_reported_and_kept() {
        let runner = Arc::new(ActorRunner::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: ErrorHandler = Arc::new(move |e: &ActorError| {
            sink.lock().expect("sink").push(e.to_string());
        });
        let mut runner_loop = RunnerLoop::new(runner.clone(), Box::new(NoOpIdleStrategy), handler, 1, Duration::from_millis(1));
        let failing = ActorHandle::new(5, Box::new(|| -> StepResult { Err("no connection".into()) }), 8);
        runner.assign(failing.clone());

        for _ in 0..4 {
            runner_loop.cycle_once();
        }
        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], "actor 5 failed: no connection");
        assert!(runner.contains(&failing));
        assert_eq!(failing.runner_index(), Some(0));
    }

    #[test]
    fn test_panicking_actor_reported_and_kept() {
        let runner = Arc::new(ActorRunner::new(0));
        let panics = Arc::new(AtomicUsize::new(0));
        let counter = panics.clone();
        let handler: ErrorHandler = Arc::new(move |e: &ActorError| {
            if matches!(e, ActorError::Panicked { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let mut runner_loop = RunnerLoop::new(runner.clone(), Box::new(NoOpIdleStrategy), handler, 1, Duration::from_millis(1));
        let (healthy, healthy_calls) = counting_handle(1, true);
        let exploding = ActorHandle::new(2, Box::new(|| -> StepResult { panic!("exploded") }), 8);
        runner.assign(healthy);
        runner.assign(exploding.clone());

        runner_loop.cycle_once();
        runner_loop.cycle_once();
        assert_eq!(panics.load(Ordering::SeqCst), 2);
        assert_eq!(healthy_calls.load(Ordering::SeqCst), 2);
        assert!(runner.contains(&exploding));
    }

    #[test]
    fn test_cancelled_actor_removed_and_released() {
        let runner = Arc::new(ActorRunner::new(0));
        let mut runner_loop = test_loop(&runner, 1);
        let (handle, calls) = counting_handle(1, true);
        runner.assign(handle.clone());

        runner_loop.cycle_once();
        handle.cancel();
        runner_loop.cycle_once();
        runner_loop.cycle_once();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!runner.contains(&handle));
        assert!(handle.is_released());
        assert_eq!(runner.actor_count(), 0);
    }

    #[test]
    fn test_actor_owned_elsewhere_is_skipped() {
        let runner = Arc::new(ActorRunner::new(0));
        let mut runner_loop = test_loop(&runner, 1);
        let (handle, calls) = counting_handle(1, true);
        runner.assign(handle.clone());
        handle.set_owner(1);

        runner_loop.cycle_once();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_locked_actor_is_skipped() {
        let runner = Arc::new(ActorRunner::new(0));
        let mut runner_loop = test_loop(&runner, 1);
        let (handle, calls) = counting_handle(1, true);
        runner.assign(handle.clone());

        let guard = handle.try_lock_actor().expect("lock");
        assert!(!runner_loop.cycle_once());
        drop(guard);
        assert!(runner_loop.cycle_once());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_and_assign_move_ownership() {
        let source = ActorRunner::new(0);
        let destination = ActorRunner::new(1);
        let (handle, _) = counting_handle(1, true);
        source.assign(handle.clone());
        assert_eq!(handle.runner_index(), Some(0));

        assert!(source.remove(&handle));
        assert_eq!(handle.runner_index(), None);
        destination.assign(handle.clone());
        assert_eq!(handle.runner_index(), Some(1));
        assert!(!source.remove(&handle));
        assert_eq!(handle.runner_index(), Some(1));
    }

    #[test]
    fn test_cycle_cost_sums_average_loads() {
        let runner = ActorRunner::new(0);
        let (a, _) = counting_handle(1, true);
        let (b, _) = counting_handle(2, true);
        let (c, _) = counting_handle(3, true);
        a.record_duration(Duration::from_micros(10));
        b.record_duration(Duration::from_micros(30));
        c.record_duration(Duration::from_micros(500));
        c.cancel();
        runner.assign(a);
        runner.assign(b);
        runner.assign(c);
        assert_eq!(runner.cycle_cost(), Duration::from_micros(40));
        let load = runner.load();
        assert_eq!(load.actors, 2);
        assert_eq!(load.share, 0.0);
    }

    #[test]
    fn test_busy_window_published() {
        let runner = Arc::new(ActorRunner::new(0));
        let mut runner_loop = RunnerLoop::new(runner.clone(), Box::new(NoOpIdleStrategy), log_error_handler(), 1, Duration::from_millis(2));
        let spinning = ActorHandle::new(1, Box::new(|| -> StepResult {
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(3) {
                std::hint::spin_loop();
            }
            Ok(true)
        }), 8);
        runner.assign(spinning);
        runner_loop.cycle_once();
        assert!(runner.busy_fraction() > 0.5, "busy fraction {}", runner.busy_fraction());
    }

    #[test]
    fn test_thread_runs_until_closed() {
        let runner = Arc::new(ActorRunner::new(0));
        let runner_loop = test_loop(&runner, 1);
        let (handle, calls) = counting_handle(1, true);
        runner.assign(handle.clone());

        let join = thread::spawn(move || runner_loop.run());
        let deadline = Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(calls.load(Ordering::SeqCst) > 0);

        runner.close();
        assert!(runner.await_stopped(Instant::now() + Duration::from_secs(5)));
        join.join().expect("runner thread");
        assert_eq!(runner.actor_count(), 0);
        assert_eq!(handle.runner_index(), None);
    }
}
