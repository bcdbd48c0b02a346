/// Provider-specific error with retry classification.
///
/// **Retryable**: I/O hiccups, lock contention, anything that may succeed
/// when tried again. **Permanent**: missing or duplicate instances, corrupt
/// records, stale lock tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g. "append", "ack_orchestration_batch")
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Create a retryable (transient) error.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// I/O failures are treated as transient.
    pub(crate) fn io(operation: &str, err: std::io::Error) -> Self {
        Self::retryable(operation, err.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
