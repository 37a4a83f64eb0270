//! The scheduler's tracking record for one actor.
//!
//! A handle is shared between the caller (as a cancellation and introspection token), the
//! runner currently driving the actor and the balancer. The actor itself sits behind its own
//! lock: a runner only steps an actor while holding that lock, which is what keeps a migrated
//! actor from ever running on two runners at once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::actor::Actor;
use crate::duration_samples::DurationSamples;

/// Sentinel owner index for a handle not assigned to any runner.
pub(crate) const NO_RUNNER: usize = usize::MAX;

struct HandleInner {
    id: u64,
    name: String,
    actor: Mutex<Option<Box<dyn Actor>>>,
    samples: Mutex<DurationSamples>,
    cancelled: AtomicBool,
    owner: AtomicUsize,
    invocations: AtomicU64,
}

/// Cheaply cloneable reference to a scheduled actor.
#[derive(Clone)]
pub struct ActorHandle {
    inner: Arc<HandleInner>,
}

impl ActorHandle {
    pub(crate) fn new(id: u64, actor: Box<dyn Actor>, sample_count: usize) -> Self {
        let name = actor.name().to_string();
        ActorHandle {
            inner: Arc::new(HandleInner {
                id,
                name,
                actor: Mutex::new(Some(actor)),
                samples: Mutex::new(DurationSamples::new(sample_count)),
                cancelled: AtomicBool::new(false),
                owner: AtomicUsize::new(NO_RUNNER),
                invocations: AtomicU64::new(0),
            }),
        }
    }

    /// Unique id within the scheduler that created this handle.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Name reported by the actor when it was scheduled.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Requests that the actor is no longer invoked.
    ///
    /// Asynchronous: the actor may see at most one more step on its current runner, then it
    /// is removed and dropped.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Mean duration of the recent invocations, zero until the actor has run once.
    pub fn average_load(&self) -> Duration {
        self.inner.samples.lock().average()
    }

    /// Number of durations currently held in the rolling window.
    pub fn sample_count(&self) -> usize {
        self.inner.samples.lock().len()
    }

    /// Total number of steps performed so far.
    pub fn invocation_count(&self) -> u64 {
        self.inner.invocations.load(Ordering::SeqCst)
    }

    /// Index of the runner this handle is assigned to, if any.
    pub fn runner_index(&self) -> Option<usize> {
        match self.inner.owner.load(Ordering::SeqCst) {
            NO_RUNNER => None,
            index => Some(index),
        }
    }

    /// True once the runner has dropped the actor after cancellation.
    pub fn is_released(&self) -> bool {
        self.is_cancelled() && self.runner_index().is_none()
    }

    pub fn record_duration(&self, duration: Duration) {
        self.inner.samples.lock().record(duration);
    }

    pub(crate) fn set_owner(&self, runner: usize) {
        self.inner.owner.store(runner, Ordering::SeqCst);
    }

    /// Clears the owner only if it is still `runner`, so a late removal by a previous
    /// owner cannot undo a newer assignment.
    pub(crate) fn clear_owner(&self, runner: usize) {
        let _ = self.inner.owner.compare_exchange(runner, NO_RUNNER, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub(crate) fn is_owned_by(&self, runner: usize) -> bool {
        self.inner.owner.load(Ordering::SeqCst) == runner
    }

    /// Exclusive access to the actor. `None` while another runner is still finishing a step
    /// after a migration; the caller skips the actor for this cycle.
    pub(crate) fn try_lock_actor(&self) -> Option<MutexGuard<'_, Option<Box<dyn Actor>>>> {
        self.inner.actor.try_lock()
    }

    pub(crate) fn count_invocation(&self) {
        self.inner.invocations.fetch_add(1, Ordering::SeqCst);
    }
}

impl PartialEq for ActorHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ActorHandle {}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("runner", &self.runner_index())
            .field("cancelled", &self.is_cancelled())
            .field("average_load", &self.average_load())
            .finish()
    }
}
