//! Rolling window of per invocation execution costs for one actor.
//!
//! The window is a fixed capacity ring buffer. Once full, every new sample evicts the
//! oldest one, so the average only follows sustained changes in cost and a single slow
//! invocation cannot move an actor between runners on its own.

use std::time::Duration;

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

/// Fixed capacity window of the most recent invocation durations, in nanoseconds.
pub struct DurationSamples {
    samples: HeapRb<u64>,
    total_nanos: u128,
}

impl DurationSamples {
    /// Creates an empty window holding at most `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        DurationSamples {
            samples: HeapRb::new(capacity.max(1)),
            total_nanos: 0,
        }
    }

    /// Appends a sample, evicting the oldest one when the window is full.
    pub fn record(&mut self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        if self.samples.is_full() {
            if let Some(oldest) = self.samples.try_pop() {
                self.total_nanos -= oldest as u128;
            }
        }
        if self.samples.try_push(nanos).is_ok() {
            self.total_nanos += nanos as u128;
        }
    }

    /// Arithmetic mean of the held samples, zero while the window is empty.
    pub fn average(&self) -> Duration {
        let count = self.samples.occupied_len();
        if count == 0 {
            return Duration::ZERO;
        }
        let mean = self.total_nanos / count as u128;
        Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX))
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples the window retains.
    pub fn capacity(&self) -> usize {
        self.samples.capacity().get()
    }

    /// Iterates the held samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = Duration> + '_ {
        self.samples.iter().map(|n| Duration::from_nanos(*n))
    }
}
