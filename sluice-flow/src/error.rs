//! Scheduler error types.

use crate::queue::ClassId;

/// Fair scheduling error type.
///
/// Every variant reports a misuse of the API rather than a runtime failure;
/// capacity shortages are not errors, they pause dispatch.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// The class id is already in use.
    #[error("priority class {class_id} is already registered")]
    ClassAlreadyRegistered {
        /// The offending class id.
        class_id: ClassId,
    },

    /// The class id does not name a registered class.
    #[error("priority class {class_id} is not registered")]
    ClassNotRegistered {
        /// The offending class id.
        class_id: ClassId,
    },

    /// The class cannot be unregistered while entries are queued under it.
    #[error("priority class {class_id} still has {waiting} queued entries")]
    ClassNotEmpty {
        /// The offending class id.
        class_id: ClassId,
        /// Entries still waiting in the class queue.
        waiting: u64,
    },

    /// The class id lies beyond the configured class-id bound.
    #[error("priority class {class_id} exceeds the configured maximum of {max_classes}")]
    TooManyClasses {
        /// The offending class id.
        class_id: ClassId,
        /// Configured bound on class ids.
        max_classes: u32,
    },
}

/// Result type for fair scheduling operations.
pub type FlowResult<T> = Result<T, FlowError>;
