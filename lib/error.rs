//! Error taxonomy shared by every registry operation.

use thiserror::Error;

use crate::object::ObjectId;

/// Which resource ran out while creating an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exhaustion {
    /// Every id below the configured limit is in use.
    #[error("no free identifier below {limit}")]
    IdSpace {
        /// The configured exclusive upper bound on ids.
        limit: u32,
    },
    /// The configured object budget is spent.
    #[error("{max_objects} objects are already live")]
    Capacity {
        /// The configured maximum number of live objects.
        max_objects: usize,
    },
}

/// Errors returned by the registry.
///
/// None of these are retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No live object has this id.
    #[error("object {0} not found")]
    NotFound(ObjectId),

    /// An object could not be created.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[from] Exhaustion),

    /// The object was marked as inconsistent and must not be used.
    #[error("object {0} is corrupted")]
    Corrupted(ObjectId),

    /// An internal contract was breached. The index may no longer be trustworthy.
    #[error("invariant violated on object {id}: {reason}")]
    InvariantViolated {
        /// The object the breach was detected on.
        id: ObjectId,
        /// What was violated.
        reason: &'static str,
    },

    /// A registry was already installed in the process-wide slot.
    #[error("registry is already initialized")]
    AlreadyInitialized,
}

impl RegistryError {
    /// Whether this error indicates a programming defect rather than a recoverable condition.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolated { .. })
    }
}
