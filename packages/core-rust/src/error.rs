//! Taxonomy-tagged errors produced by concurrency guards.

use std::error::Error as StdError;
use std::fmt;

/// Why a concurrency guard refused to let an attempt run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Another operation owns the entity; do not proceed now.
    Conflict,
    /// The guard itself could not reach a decision.
    GuardFailure,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => f.write_str("conflict"),
            Self::GuardFailure => f.write_str("guard failure"),
        }
    }
}

/// A guard rejection with its category, a reason, and an optional cause.
#[derive(Debug)]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub message: String,
    pub cause: Option<anyhow::Error>,
}

impl CategorizedError {
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Conflict,
            message: message.into(),
            cause: None,
        }
    }

    #[must_use]
    pub fn guard_failure(message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            category: ErrorCategory::GuardFailure,
            message: message.into(),
            cause: Some(cause),
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.category == ErrorCategory::Conflict
    }
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

impl StdError for CategorizedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|cause| {
            let source: &(dyn StdError + Send + Sync + 'static) = cause.as_ref();
            source as &(dyn StdError + 'static)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_display_names_category_and_reason() {
        let err = CategorizedError::conflict("entity owned by op-2");
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "conflict: entity owned by op-2");
        assert!(err.source().is_none());
    }

    #[test]
    fn guard_failure_exposes_cause_as_source() {
        let err = CategorizedError::guard_failure("lookup failed", anyhow::anyhow!("timeout"));
        assert!(!err.is_conflict());
        assert_eq!(err.to_string(), "guard failure: lookup failed (timeout)");
        assert_eq!(err.source().unwrap().to_string(), "timeout");
    }
}
