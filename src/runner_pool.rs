//! Fixed set of named OS threads, one per runner, with bounded shutdown.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::runner::RunnerLoop;
use crate::steady_config;

#[cfg(test)]
thread_local! {
    // threads started by the builder on this thread
    pub(crate) static SPAWNED_HERE: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Counts a scheduler thread started from the current thread. Only tracked in tests.
pub(crate) fn count_spawn() {
    #[cfg(test)]
    SPAWNED_HERE.with(|count| count.set(count.get() + 1));
}

/// Reports thread exit, normal or by panic, to the pool.
struct DoneSignal {
    index: usize,
    tx: Sender<usize>,
}

impl Drop for DoneSignal {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("runner thread {} is exiting on a panic", self.index);
        }
        let _ = self.tx.send(self.index);
    }
}

pub(crate) struct RunnerPool {
    threads: Vec<Option<JoinHandle<()>>>,
    finished: Vec<bool>,
    done_tx: Sender<usize>,
    done_rx: Receiver<usize>,
}

impl RunnerPool {
    pub(crate) fn new() -> Self {
        let (done_tx, done_rx) = flume::unbounded();
        RunnerPool { threads: Vec::new(), finished: Vec::new(), done_tx, done_rx }
    }

    /// Starts the next runner thread. Its index is the number of threads started before it.
    pub(crate) fn spawn(&mut self, runner_loop: RunnerLoop) -> io::Result<()> {
        let index = self.threads.len();
        let done = DoneSignal { index, tx: self.done_tx.clone() };
        let handle = thread::Builder::new()
            .name(format!("steady-runner-{}", index))
            .spawn(move || {
                let _done = done;
                runner_loop.run();
            })?;
        count_spawn();
        self.threads.push(Some(handle));
        self.finished.push(false);
        Ok(())
    }

    /// Waits up to `timeout` for every thread to exit and joins those that did.
    ///
    /// Threads still running at the deadline are detached with a warning. Returns true when
    /// every thread terminated.
    pub(crate) fn await_termination(&mut self, timeout: Duration) -> bool {
        let deadline = steady_config::deadline_after(timeout);
        while self.finished.iter().any(|f| !f) {
            match self.done_rx.recv_deadline(deadline) {
                Ok(index) => {
                    if let Some(flag) = self.finished.get_mut(index) {
                        *flag = true;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                // unreachable while we hold done_tx
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut all_terminated = true;
        for (index, slot) in self.threads.iter_mut().enumerate() {
            let Some(handle) = slot.take() else {
                continue;
            };
            if self.finished[index] {
                if handle.join().is_err() {
                    error!("runner thread {} panicked", index);
                }
            } else {
                warn!("runner thread {} did not terminate within {:?}, abandoning it", index, timeout);
                all_terminated = false;
            }
        }
        all_terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::StepResult;
    use crate::actor_handle::ActorHandle;
    use crate::error::log_error_handler;
    use crate::idle_strategy::NoOpIdleStrategy;
    use crate::runner::ActorRunner;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn start(pool: &mut RunnerPool, count: usize) -> Vec<Arc<ActorRunner>> {
        (0..count)
            .map(|index| {
                let runner = Arc::new(ActorRunner::new(index));
                let runner_loop = RunnerLoop::new(runner.clone(), Box::new(NoOpIdleStrategy), log_error_handler(), 1, Duration::from_millis(1));
                pool.spawn(runner_loop).expect("spawn");
                runner
            })
            .collect()
    }

    #[test]
    fn test_all_threads_terminate_after_close() {
        let mut pool = RunnerPool::new();
        let runners = start(&mut pool, 3);
        assert_eq!(pool.threads.len(), 3);
        runners.iter().for_each(|r| r.close());
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(runners.iter().all(|r| r.is_stopped()));
    }

    #[test]
    fn test_unbounded_termination_wait_returns() {
        let mut pool = RunnerPool::new();
        let runners = start(&mut pool, 2);
        runners.iter().for_each(|r| r.close());
        assert!(pool.await_termination(Duration::MAX));
    }

    #[test]
    fn test_stuck_thread_is_abandoned_at_deadline() {
        let mut pool = RunnerPool::new();
        let runners = start(&mut pool, 2);
        let release = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicBool::new(false));
        let (gate, flag) = (release.clone(), entered.clone());
        let blocking = ActorHandle::new(1, Box::new(move || -> StepResult {
            flag.store(true, Ordering::SeqCst);
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(false)
        }), 4);
        runners[1].assign(blocking);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !entered.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(entered.load(Ordering::SeqCst));

        runners.iter().for_each(|r| r.close());
        let start = Instant::now();
        assert!(!pool.await_termination(Duration::from_millis(100)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(runners[0].is_stopped());
        release.store(true, Ordering::SeqCst);
    }
}
