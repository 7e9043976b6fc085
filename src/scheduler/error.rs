//! Error types for the scheduler module

use std::fmt;

use crate::error::{CastlineErrorTrait, ErrorCategory};
use crate::models::ItemStatus;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// Lock backing store could not be reached
    LockStoreUnavailable {
        operation: String,
        reason: String,
    },

    /// Idempotency backing store could not be reached
    IdempotencyStoreUnavailable {
        operation: String,
        reason: String,
    },

    /// Item, run or media storage failed
    StorageError {
        operation: String,
        reason: String,
    },

    /// Item does not exist
    ItemNotFound {
        id: String,
    },

    /// Item is in a status that does not allow the requested change
    InvalidTransition {
        id: String,
        from: ItemStatus,
        action: String,
    },

    /// Trigger configuration error
    TriggerConfigError {
        field: String,
        reason: String,
    },

    /// Run body panicked; the run was finalized as failed
    RunPanicked {
        reason: String,
    },

    /// Serialization/deserialization error
    SerializationError {
        reason: String,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockStoreUnavailable { operation, reason } => {
                write!(f, "Lock store unavailable during '{}': {}", operation, reason)
            }
            Self::IdempotencyStoreUnavailable { operation, reason } => {
                write!(
                    f,
                    "Idempotency store unavailable during '{}': {}",
                    operation, reason
                )
            }
            Self::StorageError { operation, reason } => {
                write!(f, "Storage error during '{}': {}", operation, reason)
            }
            Self::ItemNotFound { id } => {
                write!(f, "Scheduled item not found: {}", id)
            }
            Self::InvalidTransition { id, from, action } => {
                write!(f, "Cannot {} item {} while it is {}", action, id, from)
            }
            Self::TriggerConfigError { field, reason } => {
                write!(f, "Trigger config error in '{}': {}", field, reason)
            }
            Self::RunPanicked { reason } => {
                write!(f, "Run aborted by panic: {}", reason)
            }
            Self::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    /// Create a lock store error
    pub fn lock_store(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::LockStoreUnavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an idempotency store error
    pub fn idempotency_store(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::IdempotencyStoreUnavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a storage error; `reason` is rendered with its context chain
    pub fn storage(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::StorageError {
            operation: operation.into(),
            reason: format!("{reason:#}"),
        }
    }

    /// Create an item not found error
    pub fn item_not_found(id: impl Into<String>) -> Self {
        Self::ItemNotFound { id: id.into() }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(
        id: impl Into<String>,
        from: ItemStatus,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            id: id.into(),
            from,
            action: action.into(),
        }
    }

    /// Create a trigger config error
    pub fn trigger_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TriggerConfigError {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error comes from a backing store rather than the request
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::LockStoreUnavailable { .. }
                | Self::IdempotencyStoreUnavailable { .. }
                | Self::StorageError { .. }
        )
    }
}

impl CastlineErrorTrait for SchedulerError {
    fn is_recoverable(&self) -> bool {
        self.is_store_failure()
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ItemNotFound { .. } | Self::InvalidTransition { .. } => ErrorCategory::Validation,
            Self::TriggerConfigError { .. } => ErrorCategory::Config,
            Self::SerializationError { .. } => ErrorCategory::Validation,
            _ => ErrorCategory::Scheduler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_store_error() {
        let err = SchedulerError::lock_store("acquire", "connection refused");
        assert!(err.to_string().contains("acquire"));
        assert!(err.to_string().contains("connection refused"));
        assert!(err.is_store_failure());
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = SchedulerError::invalid_transition("item-1", ItemStatus::Published, "reschedule");
        assert_eq!(
            err.to_string(),
            "Cannot reschedule item item-1 while it is published"
        );
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_is_recoverable() {
        let store_err = SchedulerError::storage("select_due", "database is locked");
        assert!(store_err.is_recoverable());

        let missing = SchedulerError::item_not_found("item-9");
        assert!(!missing.is_recoverable());
    }

    #[test]
    fn test_storage_error_keeps_context_chain() {
        let source = anyhow::anyhow!("disk I/O error").context("Failed to update item");
        let err = SchedulerError::storage("mark_published", source);
        assert!(err.to_string().contains("Failed to update item"));
        assert!(err.to_string().contains("disk I/O error"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let scheduler_err: SchedulerError = json_err.into();
        assert!(matches!(
            scheduler_err,
            SchedulerError::SerializationError { .. }
        ));
    }
}
