//! Error classification shared by the castline domains
//!
//! Each domain keeps its own error type ([`SchedulerError`], [`PublishError`],
//! [`MediaError`]); all of them implement [`CastlineErrorTrait`] so callers
//! can decide on retries and HTTP statuses without matching every variant.
//!
//! ```rust,ignore
//! use castline::error::CastlineErrorTrait;
//!
//! fn handle_error(err: &impl CastlineErrorTrait) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = %err.category(), "retrying: {err}");
//!     } else {
//!         tracing::error!("fatal: {err}");
//!     }
//! }
//! ```

use std::fmt;

// Re-export domain-specific errors for convenience
pub use crate::media::MediaError;
pub use crate::publish::PublishError;
pub use crate::scheduler::error::SchedulerError;

/// Common trait for all castline error types
pub trait CastlineErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Upstream publishing API and provider calls
    Network,
    /// Storage backends (SQLite, Redis, I/O)
    Storage,
    /// Request and payload validation
    Validation,
    /// Configuration errors
    Config,
    /// Scheduler orchestration errors
    Scheduler,
    /// Media transcoding errors
    Media,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Validation => "validation",
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::Media => "media",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        assert_eq!(PublishError::Timeout.category(), ErrorCategory::Network);
        assert_eq!(MediaError::InvalidSignature.category(), ErrorCategory::Validation);
        assert_eq!(
            SchedulerError::lock_store("acquire", "connection refused").category(),
            ErrorCategory::Scheduler
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(PublishError::Timeout.is_recoverable());

        let rejected = PublishError::Rejected {
            status: 422,
            message: "text too long".to_string(),
        };
        assert!(!rejected.is_recoverable());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Other.to_string(), "other");
        assert_eq!(ErrorCategory::Storage.as_str(), "storage");
    }
}
