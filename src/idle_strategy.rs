//! Policies for what a runner does with a cycle in which no actor made progress.
//!
//! The runner calls [`IdleStrategy::idle`] once per unproductive cycle and
//! [`IdleStrategy::reset`] as soon as any actor makes progress again. Sleeping inside an
//! idle strategy is the only sanctioned blocking point on a runner thread.

use std::hint;
use std::thread;
use std::time::Duration;

use crate::steady_config;

/// Idle policy for one runner. Every runner works on its own copy, see [`IdleStrategy::fresh`].
pub trait IdleStrategy: Send {
    /// Called once for each cycle that produced no progress.
    fn idle(&mut self);

    /// Called when progress was made; drops any accumulated backoff.
    fn reset(&mut self);

    /// New instance with the same configuration and no accumulated state.
    fn fresh(&self) -> Box<dyn IdleStrategy>;

    /// Short label used in the scheduler summary.
    fn alias(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackoffState {
    NotIdle,
    Spinning,
    Yielding,
    Parking,
}

/// Spins, then yields, then parks for exponentially growing periods.
///
/// Keeps wake up latency low right after work dries up while bounding CPU burn for runners
/// that stay idle.
#[derive(Clone, Debug)]
pub struct BackoffIdleStrategy {
    max_spins: u64,
    max_yields: u64,
    min_park_period: Duration,
    max_park_period: Duration,
    state: BackoffState,
    spins: u64,
    yields: u64,
    park_period: Duration,
}

impl BackoffIdleStrategy {
    /// # Arguments
    ///
    /// * `max_spins` - busy spins before switching to yields.
    /// * `max_yields` - thread yields before switching to parking.
    /// * `min_park_period` - first park duration.
    /// * `max_park_period` - cap of the doubling park duration.
    pub fn new(max_spins: u64, max_yields: u64, min_park_period: Duration, max_park_period: Duration) -> Self {
        BackoffIdleStrategy {
            max_spins,
            max_yields,
            min_park_period,
            max_park_period: max_park_period.max(min_park_period),
            state: BackoffState::NotIdle,
            spins: 0,
            yields: 0,
            park_period: min_park_period,
        }
    }

    /// Current park duration; only meaningful once the strategy reached the parking phase.
    pub fn park_period(&self) -> Duration {
        self.park_period
    }

    pub(crate) fn is_parking(&self) -> bool {
        self.state == BackoffState::Parking
    }
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        BackoffIdleStrategy::new(
            steady_config::DEFAULT_IDLE_MAX_SPINS,
            steady_config::DEFAULT_IDLE_MAX_YIELDS,
            steady_config::DEFAULT_IDLE_MIN_PARK,
            steady_config::DEFAULT_IDLE_MAX_PARK,
        )
    }
}

impl IdleStrategy for BackoffIdleStrategy {
    fn idle(&mut self) {
        match self.state {
            BackoffState::NotIdle => {
                self.state = BackoffState::Spinning;
                self.spins += 1;
            }
            BackoffState::Spinning => {
                hint::spin_loop();
                self.spins += 1;
                if self.spins > self.max_spins {
                    self.state = BackoffState::Yielding;
                    self.yields = 0;
                }
            }
            BackoffState::Yielding => {
                self.yields += 1;
                if self.yields > self.max_yields {
                    self.state = BackoffState::Parking;
                    self.park_period = self.min_park_period;
                } else {
                    thread::yield_now();
                }
            }
            BackoffState::Parking => {
                thread::park_timeout(self.park_period);
                self.park_period = (self.park_period * 2).min(self.max_park_period);
            }
        }
    }

    fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park_period = self.min_park_period;
        self.state = BackoffState::NotIdle;
    }

    fn fresh(&self) -> Box<dyn IdleStrategy> {
        let mut copy = self.clone();
        copy.reset();
        Box::new(copy)
    }

    fn alias(&self) -> &'static str {
        "backoff"
    }
}

/// Never gives up the core. Lowest latency, one full CPU per runner.
#[derive(Clone, Copy, Debug, Default)]
pub struct BusySpinIdleStrategy;

impl IdleStrategy for BusySpinIdleStrategy {
    fn idle(&mut self) {
        hint::spin_loop();
    }

    fn reset(&mut self) {}

    fn fresh(&self) -> Box<dyn IdleStrategy> {
        Box::new(*self)
    }

    fn alias(&self) -> &'static str {
        "spin"
    }
}

/// Yields the thread on every idle cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct YieldingIdleStrategy;

impl IdleStrategy for YieldingIdleStrategy {
    fn idle(&mut self) {
        thread::yield_now();
    }

    fn reset(&mut self) {}

    fn fresh(&self) -> Box<dyn IdleStrategy> {
        Box::new(*self)
    }

    fn alias(&self) -> &'static str {
        "yield"
    }
}

/// Sleeps for a fixed period on every idle cycle.
#[derive(Clone, Copy, Debug)]
pub struct SleepingIdleStrategy {
    period: Duration,
}

impl SleepingIdleStrategy {
    pub fn new(period: Duration) -> Self {
        SleepingIdleStrategy { period }
    }
}

impl IdleStrategy for SleepingIdleStrategy {
    fn idle(&mut self) {
        thread::sleep(self.period);
    }

    fn reset(&mut self) {}

    fn fresh(&self) -> Box<dyn IdleStrategy> {
        Box::new(*self)
    }

    fn alias(&self) -> &'static str {
        "sleep"
    }
}

/// Does nothing; the runner immediately starts its next cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpIdleStrategy;

impl IdleStrategy for NoOpIdleStrategy {
    fn idle(&mut self) {}

    fn reset(&mut self) {}

    fn fresh(&self) -> Box<dyn IdleStrategy> {
        Box::new(*self)
    }

    fn alias(&self) -> &'static str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_backoff_walks_through_phases() {
        let mut idle = BackoffIdleStrategy::new(2, 2, Duration::from_micros(1), Duration::from_micros(8));
        // enter spinning, then exceed two spins
        for _ in 0..3 {
            idle.idle();
        }
        assert_eq!(idle.state, BackoffState::Yielding);
        for _ in 0..3 {
            idle.idle();
        }
        assert!(idle.is_parking());
        assert_eq!(idle.park_period(), Duration::from_micros(1));
        for _ in 0..6 {
            idle.idle();
        }
        assert_eq!(idle.park_period(), Duration::from_micros(8));
    }

    #[test]
    fn test_backoff_reset_returns_to_not_idle() {
        let mut idle = BackoffIdleStrategy::new(0, 0, Duration::from_micros(1), Duration::from_micros(4));
        for _ in 0..10 {
            idle.idle();
        }
        assert!(idle.is_parking());
        idle.reset();
        assert_eq!(idle.state, BackoffState::NotIdle);
        assert_eq!(idle.park_period(), Duration::from_micros(1));
    }

    #[test]
    fn test_fresh_copy_has_no_backoff() {
        let mut idle = BackoffIdleStrategy::new(0, 0, Duration::from_micros(1), Duration::from_micros(4));
        for _ in 0..10 {
            idle.idle();
        }
        let copy = idle.fresh();
        assert_eq!(copy.alias(), "backoff");
        assert!(idle.is_parking());
    }

    #[test]
    fn test_max_park_never_below_min() {
        let idle = BackoffIdleStrategy::new(1, 1, Duration::from_millis(2), Duration::from_millis(1));
        assert_eq!(idle.max_park_period, Duration::from_millis(2));
    }

    #[test]
    fn test_sleeping_strategy_sleeps() {
        let mut idle = SleepingIdleStrategy::new(Duration::from_millis(5));
        let start = Instant::now();
        idle.idle();
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_simple_strategies_alias() {
        assert_eq!(BusySpinIdleStrategy.alias(), "spin");
        assert_eq!(YieldingIdleStrategy.alias(), "yield");
        assert_eq!(NoOpIdleStrategy.fresh().alias(), "noop");
    }
}
