//! Outcome of a single `run` call.

/// Result of executing an operation's business logic.
///
/// A present `error` marks the attempt as failed; the pipeline treats every
/// such failure as retryable.
#[derive(Debug)]
pub struct OperationResult {
    /// HTTP-style status code describing the outcome.
    pub status_code: u16,
    /// Human-readable summary.
    pub message: String,
    /// Failure cause, if the run did not succeed.
    pub error: Option<anyhow::Error>,
}

impl OperationResult {
    /// Successful run with status 200.
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            message: message.into(),
            error: None,
        }
    }

    /// Failed run with the given status code.
    #[must_use]
    pub fn failed(status_code: u16, error: anyhow::Error) -> Self {
        Self {
            status_code,
            message: error.to_string(),
            error: Some(error),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_has_no_error() {
        let result = OperationResult::ok("deployed");
        assert!(result.is_success());
        assert_eq!(result.status_code, 200);
        assert_eq!(result.message, "deployed");
    }

    #[test]
    fn failed_result_carries_error_message() {
        let result = OperationResult::failed(503, anyhow::anyhow!("upstream unavailable"));
        assert!(!result.is_success());
        assert_eq!(result.status_code, 503);
        assert_eq!(result.message, "upstream unavailable");
    }
}
