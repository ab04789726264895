//! Narrow contracts to the services the engine depends on but does not own.
//!
//! - [`UserDirectory`]: read-only member profiles, used for existence and
//!   eligibility checks.
//! - [`NotificationSink`]: fire-and-forget outbound events.
//! - [`ArbitrationAuthority`]: decides who may resolve a dispute.
//!
//! Each port comes with an in-process adapter that the CLI and the tests use.

mod arbitration;
mod directory;
mod notifier;

pub use arbitration::*;
pub use directory::*;
pub use notifier::*;

use thiserror::Error;

/// A collaborator could not be reached or answered with garbage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{service}: {message}")]
pub struct CollaboratorError {
    pub service: &'static str,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
        }
    }
}

impl From<CollaboratorError> for crate::application::EngineError {
    fn from(err: CollaboratorError) -> Self {
        crate::application::EngineError::CollaboratorUnavailable(err.to_string())
    }
}
