use std::time;

use thiserror::Error;

/// Enumeration of failures a message handler can surface to the worker pool.
///
/// Any variant drives the same retry/dead-letter state machine; the variant
/// only affects the error description recorded alongside the message.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("handler timed out after {0:?}")]
    TimedOut(time::Duration),
}

impl HandlerError {
    /// Convenience constructor for the common string-message case.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;
