//! Runs many long lived, cooperative actors on a small fixed pool of threads and keeps the
//! load of those threads even by migrating actors between them.
//!
//! An [`Actor`] exposes one non-blocking `step`. The [`ActorScheduler`] wraps each actor in an
//! [`ActorHandle`], assigns it to one of its runners, and a background balancer moves handles
//! from the most to the least loaded runner while the spread exceeds the configured threshold.

pub mod actor;
pub mod actor_handle;
pub mod balancer;
pub mod duration_samples;
pub mod error;
pub mod idle_strategy;
pub mod runner;
pub(crate) mod runner_pool;
pub mod scheduler;
pub mod scheduler_builder;
pub mod steady_config;
pub mod util;


pub use actor::{Actor, StepResult};
pub use actor_handle::ActorHandle;
pub use balancer::{BalancerState, Migration};
pub use error::{log_error_handler, ActorError, ErrorHandler, Result, SchedulerError};
pub use idle_strategy::{
    BackoffIdleStrategy, BusySpinIdleStrategy, IdleStrategy, NoOpIdleStrategy, SleepingIdleStrategy,
    YieldingIdleStrategy,
};
pub use runner::RunnerLoad;
pub use scheduler::{ActorScheduler, CloseTimeouts, SchedulerState};
pub use scheduler_builder::SchedulerBuilder;
pub use util::{init_logging, LogLevel};

// Re-export the logging crates
pub use flexi_logger;
pub use log;
