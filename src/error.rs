use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by user-supplied query and mutation functions.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Terminal or transient failure observed by the engine.
///
/// Cloneable so the same failure can be fanned out to every subscriber of a
/// shared execution and kept in state snapshots.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The user function returned an error.
    #[error("{0}")]
    Failed(Arc<dyn StdError + Send + Sync + 'static>),
    /// The user function panicked while producing a value.
    #[error("function panicked: {0}")]
    Panicked(String),
    /// The execution was cancelled before it settled.
    #[error("execution cancelled")]
    Cancelled,
}

impl QueryError {
    pub fn failed(error: impl Into<BoxError>) -> Self {
        Self::Failed(Arc::from(error.into()))
    }

    pub fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
