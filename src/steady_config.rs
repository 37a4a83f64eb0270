//! Configuration defaults for the scheduler.
//!
//! Builder defaults live here as constants. A few of them can be overridden from the
//! environment, see [`thread_count_from_env`] and [`imbalance_threshold_from_env`].

use std::env;
use std::time::{Duration, Instant};

/// Runner threads when nothing else is configured.
pub const DEFAULT_THREAD_COUNT: usize = 1;

/// Steps an actor may take per cycle while it keeps reporting progress.
pub const DEFAULT_BASE_ITERATIONS_PER_ACTOR: usize = 1;

/// Load share gap between the busiest and the idlest runner that triggers a migration.
pub const DEFAULT_IMBALANCE_THRESHOLD: f64 = 0.25;

/// First balancer sleep, and the value the backoff resets to after a migration.
pub const DEFAULT_BALANCER_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Cap of the doubling balancer sleep.
pub const DEFAULT_BALANCER_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Length of a runner's busy/idle measurement window.
pub const DEFAULT_DURATION_SAMPLE_PERIOD: Duration = Duration::from_millis(1);

/// Invocation durations kept per actor for its moving average.
pub const DEFAULT_DURATION_SAMPLE_COUNT: usize = 128;

/// How long `close` waits for the balancer thread.
pub const DEFAULT_BALANCER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `close` waits for the runners to acknowledge the stop.
pub const DEFAULT_RUNNER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `close` waits for the runner threads to terminate.
pub const DEFAULT_POOL_TERMINATION_TIMEOUT: Duration = Duration::from_secs(10);

// Default backoff idle strategy
pub const DEFAULT_IDLE_MAX_SPINS: u64 = 100;
pub const DEFAULT_IDLE_MAX_YIELDS: u64 = 10;
pub const DEFAULT_IDLE_MIN_PARK: Duration = Duration::from_micros(1);
pub const DEFAULT_IDLE_MAX_PARK: Duration = Duration::from_millis(1);

/// Longest single wait the scheduler performs. Larger configured durations are capped here so
/// deadlines never overflow `Instant`.
pub const MAX_WAIT: Duration = Duration::from_secs(u32::MAX as u64);

/// `duration` capped at [`MAX_WAIT`].
pub fn bounded_wait(duration: Duration) -> Duration {
    duration.min(MAX_WAIT)
}

/// Point in time `duration` from now, with `duration` capped at [`MAX_WAIT`].
pub fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(bounded_wait(duration))
        .or_else(|| now.checked_add(Duration::from_secs(86_400)))
        .unwrap_or(now)
}

/// Environment variable overriding the runner thread count.
pub const THREADS_ENV: &str = "STEADY_SCHEDULER_THREADS";

/// Environment variable overriding the imbalance threshold.
pub const IMBALANCE_ENV: &str = "STEADY_SCHEDULER_IMBALANCE";

/// Runner thread count from `STEADY_SCHEDULER_THREADS`.
///
/// # Behavior
/// - If the variable is unset, returns `DEFAULT_THREAD_COUNT`.
/// - If the variable cannot be parsed as `usize`, returns the default.
pub fn thread_count_from_env() -> usize {
    env::var(THREADS_ENV)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_THREAD_COUNT)
}

/// Imbalance threshold from `STEADY_SCHEDULER_IMBALANCE`, falling back to
/// `DEFAULT_IMBALANCE_THRESHOLD` when unset or unparsable. Range checks happen in the builder.
pub fn imbalance_threshold_from_env() -> f64 {
    env::var(IMBALANCE_ENV)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .unwrap_or(DEFAULT_IMBALANCE_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_THREAD_COUNT, 1);
        assert_eq!(DEFAULT_BASE_ITERATIONS_PER_ACTOR, 1);
        assert_eq!(DEFAULT_DURATION_SAMPLE_COUNT, 128);
        assert!(DEFAULT_BALANCER_MAX_BACKOFF >= DEFAULT_BALANCER_INITIAL_BACKOFF);
        assert!((0.0..=1.0).contains(&DEFAULT_IMBALANCE_THRESHOLD));
        assert!(DEFAULT_IDLE_MAX_PARK >= DEFAULT_IDLE_MIN_PARK);
    }

    #[test]
    fn test_waits_are_capped() {
        assert_eq!(bounded_wait(Duration::from_millis(5)), Duration::from_millis(5));
        assert_eq!(bounded_wait(Duration::MAX), MAX_WAIT);
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > Instant::now() + Duration::from_secs(3600));
        assert!(deadline_after(Duration::ZERO) <= Instant::now());
    }

    // one test touches both variables so parallel tests never race on them
    #[test]
    fn test_env_overrides() {
        env::remove_var(THREADS_ENV);
        env::remove_var(IMBALANCE_ENV);
        assert_eq!(thread_count_from_env(), DEFAULT_THREAD_COUNT);
        assert_eq!(imbalance_threshold_from_env(), DEFAULT_IMBALANCE_THRESHOLD);

        env::set_var(THREADS_ENV, "6");
        env::set_var(IMBALANCE_ENV, " 0.4 ");
        assert_eq!(thread_count_from_env(), 6);
        assert_eq!(imbalance_threshold_from_env(), 0.4);

        env::set_var(THREADS_ENV, "many");
        env::set_var(IMBALANCE_ENV, "high");
        assert_eq!(thread_count_from_env(), DEFAULT_THREAD_COUNT);
        assert_eq!(imbalance_threshold_from_env(), DEFAULT_IMBALANCE_THRESHOLD);

        env::remove_var(THREADS_ENV);
        env::remove_var(IMBALANCE_ENV);
    }
}
