//! Error types for the scheduler and for the actors it drives.

use std::error::Error as StdError;
use std::sync::Arc;

use log::error;
use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors returned by the scheduler facade and its builder.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A builder parameter is out of range. No thread was started.
    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// The scheduler is closing or closed and accepts no new actors.
    #[error("scheduler is closed")]
    Closed,

    /// An explicit placement named a runner that does not exist.
    #[error("no runner with index {0}")]
    NoSuchRunner(usize),

    /// The operating system refused to start a runner or balancer thread.
    #[error("failed to spawn scheduler thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

impl SchedulerError {
    /// Create a configuration error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig { field, reason: reason.into() }
    }
}

/// A failure raised by one actor step. The actor stays scheduled.
#[derive(Error, Debug)]
pub enum ActorError {
    /// The step returned an error.
    #[error("actor {actor_id} failed: {source}")]
    Failed {
        actor_id: u64,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The step panicked; the panic was caught on the runner thread.
    #[error("actor {actor_id} panicked: {message}")]
    Panicked { actor_id: u64, message: String },
}

impl ActorError {
    /// Id of the actor handle that raised this error.
    pub fn actor_id(&self) -> u64 {
        match self {
            ActorError::Failed { actor_id, .. } => *actor_id,
            ActorError::Panicked { actor_id, .. } => *actor_id,
        }
    }

    pub(crate) fn from_panic(actor_id: u64, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non string panic payload".to_string()
        };
        ActorError::Panicked { actor_id, message }
    }
}

/// Receives every actor failure observed by a runner. Called on the runner thread, so it
/// must return promptly.
pub type ErrorHandler = Arc<dyn Fn(&ActorError) + Send + Sync>;

/// Default handler: log the failure and keep going.
pub fn log_error_handler() -> ErrorHandler {
    Arc::new(|e: &ActorError| error!("{}", e))
}
