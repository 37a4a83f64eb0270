//! The capability every scheduled unit of work implements.

use std::error::Error;

/// Outcome of one actor step: `Ok(true)` when progress was made, `Ok(false)` when there was
/// nothing to do.
pub type StepResult = Result<bool, Box<dyn Error + Send + Sync>>;

/// A long lived unit of cooperative work driven by a runner.
///
/// `step` performs one bounded slice of work and returns. It must never block: a slow
/// operation is expressed as repeated polls across cycles. The runner driving an actor may
/// change between two steps, and a cancelled actor may still see one more step.
pub trait Actor: Send {
    /// Do one unit of work and report whether progress was made.
    fn step(&mut self) -> StepResult;

    /// Label used in log lines.
    fn name(&self) -> &str {
        "actor"
    }
}

impl<F> Actor for F
where
    F: FnMut() -> StepResult + Send,
{
    fn step(&mut self) -> StepResult {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown(u32);

    impl Actor for Countdown {
        fn step(&mut self) -> StepResult {
            if self.0 == 0 {
                return Ok(false);
            }
            self.0 -= 1;
            Ok(true)
        }

        fn name(&self) -> &str {
            "countdown"
        }
    }

    #[test]
    fn test_struct_actor() {
        let mut actor = Countdown(2);
        assert!(actor.step().expect("step"));
        assert!(actor.step().expect("step"));
        assert!(!actor.step().expect("step"));
        assert_eq!(actor.name(), "countdown");
    }

    #[test]
    fn test_closure_actor() {
        let mut calls = 0;
        let mut actor = move || -> StepResult {
            calls += 1;
            Ok(calls < 3)
        };
        assert!(actor.step().expect("step"));
        assert!(actor.step().expect("step"));
        assert!(!actor.step().expect("step"));
    }
}
