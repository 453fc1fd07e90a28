//! Error types for the lottie2img binding.

use thiserror::Error;

use crate::broker::TaskHandle;

/// Errors that can occur while driving the conversion runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The runtime module could not be resolved, compiled or initialized.
    #[error("failed to initialize runtime: {0}")]
    Initialization(String),

    /// The session was destroyed before or during the operation.
    #[error("the session has been destroyed")]
    Destroyed,

    /// The runtime refused to schedule an asynchronous task.
    #[error("unable to create conversion task, check the runtime log for details")]
    TaskCreation,

    /// The runtime signaled that the conversion failed.
    ///
    /// `message` is empty when the runtime gave no detail.
    #[error("conversion failed: {message}")]
    Conversion { message: String },

    /// A completion referenced a handle that is unknown or already resolved.
    ///
    /// This means the runtime and the binding disagree about the task
    /// protocol. It is never expected in correct operation.
    #[error("protocol violation: completion for unknown task {handle}")]
    ProtocolViolation { handle: TaskHandle },

    /// The runtime trapped, or a memory access fell outside its heap.
    #[error("runtime trap: {0}")]
    Trap(String),

    /// The task driving an asynchronous conversion was cancelled.
    #[error("conversion task aborted: {0}")]
    Aborted(String),
}

impl Error {
    /// Build a conversion error from a (possibly empty) runtime message.
    pub fn conversion(message: impl Into<String>) -> Self {
        Error::Conversion {
            message: message.into(),
        }
    }

    /// Whether this error signals a broken runtime/binding contract.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProtocolViolation { .. })
    }
}

/// Result type alias for binding operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_display_includes_message() {
        let e = Error::conversion("Bad argument: quality");
        assert_eq!(e.to_string(), "conversion failed: Bad argument: quality");
    }

    #[test]
    fn conversion_display_without_detail() {
        let e = Error::conversion("");
        assert_eq!(e.to_string(), "conversion failed: ");
    }

    #[test]
    fn only_protocol_violation_is_fatal() {
        let handle = TaskHandle::from_token(0x0002_0005);
        assert!(Error::ProtocolViolation { handle }.is_fatal());
        assert!(!Error::Destroyed.is_fatal());
        assert!(!Error::TaskCreation.is_fatal());
        assert!(!Error::Trap("unreachable".to_string()).is_fatal());
    }

    #[test]
    fn protocol_violation_names_the_handle() {
        let handle = TaskHandle::from_token(0x0002_0005);
        let display = Error::ProtocolViolation { handle }.to_string();
        assert!(display.contains("task#5.2"));
    }
}
