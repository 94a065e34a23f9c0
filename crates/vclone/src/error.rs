//! Error types for the provisioning workflow.

use thiserror::Error;

use crate::customization::CustomizationError;
use crate::platform::{PlatformError, ResourceKind};

/// Errors that end a provisioning run.
#[derive(Error, Debug)]
pub enum CloneError {
    /// A required inventory object is absent.
    #[error("Couldn't find the {kind} with the provided name '{name}'")]
    NotFound { kind: ResourceKind, name: String },

    /// A clone or snapshot task ended in error.
    #[error("Task '{task}' failed: {detail}")]
    TaskFailure { task: String, detail: String },

    /// The guest never published networking within the readiness budget.
    #[error("VM '{vm}' reported no guest networking after {attempts} attempts ({elapsed_secs}s)")]
    ReadinessTimeout {
        vm: String,
        attempts: u32,
        elapsed_secs: u64,
    },

    /// A task stayed running past its wait budget.
    #[error("Task '{task}' still running after {timeout_secs}s")]
    TaskTimeout { task: String, timeout_secs: u64 },

    /// The wait was aborted by a cancellation signal.
    #[error("Cancelled while {0}")]
    Cancelled(String),

    /// The request cannot be turned into a valid clone.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Control-plane failure, propagated unchanged.
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl CloneError {
    pub(crate) fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}

impl From<CustomizationError> for CloneError {
    fn from(e: CustomizationError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}
