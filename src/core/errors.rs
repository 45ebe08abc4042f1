use thiserror::Error;

/// Unified error type for the joinflow library
#[derive(Debug, Error)]
pub enum FlowError {
    /// One of the remote data lookups failed
    #[error("Fetch failed in {operation}: {source}")]
    Fetch {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// One of the scoring steps failed
    #[error("Scoring failed in {operation}: {source}")]
    Scoring {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// The final decision step failed
    #[error("Decision failed: {source}")]
    Decision {
        #[source]
        source: anyhow::Error,
    },

    /// A contributor arrived at a barrier more often than configured
    #[error("Barrier misuse: arrival {arrivals} on a barrier expecting {expected}")]
    BarrierMisuse { expected: usize, arrivals: usize },

    /// A result slot was written twice or read out of order
    #[error("Slot misuse on '{slot}': {message}")]
    SlotMisuse { slot: String, message: String },

    /// A slot was read whose producer failed
    #[error("Upstream of '{slot}' failed: {message}")]
    UpstreamFailed { slot: String, message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Cancellation errors
    #[error("Operation was cancelled: {operation}")]
    Cancelled {
        operation: String,
        reason: Option<String>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl FlowError {
    /// Create a fetch error
    pub fn fetch<S: Into<String>>(operation: S, source: anyhow::Error) -> Self {
        Self::Fetch {
            operation: operation.into(),
            source,
        }
    }

    /// Create a scoring error
    pub fn scoring<S: Into<String>>(operation: S, source: anyhow::Error) -> Self {
        Self::Scoring {
            operation: operation.into(),
            source,
        }
    }

    /// Create a decision error
    pub fn decision(source: anyhow::Error) -> Self {
        Self::Decision { source }
    }

    pub fn barrier_misuse(expected: usize, arrivals: usize) -> Self {
        Self::BarrierMisuse { expected, arrivals }
    }

    pub fn slot_misuse<S: Into<String>, M: Into<String>>(slot: S, message: M) -> Self {
        Self::SlotMisuse {
            slot: slot.into(),
            message: message.into(),
        }
    }

    pub fn upstream_failed<S: Into<String>, M: Into<String>>(slot: S, message: M) -> Self {
        Self::UpstreamFailed {
            slot: slot.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: None,
        }
    }

    /// Attach a reason to a cancellation error
    pub fn with_reason<R: Into<String>>(mut self, reason: R) -> Self {
        if let Self::Cancelled { reason: ref mut slot, .. } = self {
            *slot = Some(reason.into());
        }
        self
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Misuse errors indicate a bug in the caller, not a runtime condition
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::BarrierMisuse { .. } | Self::SlotMisuse { .. })
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::Scoring { .. } => "scoring",
            Self::Decision { .. } => "decision",
            Self::BarrierMisuse { .. } => "barrier_misuse",
            Self::SlotMisuse { .. } => "slot_misuse",
            Self::UpstreamFailed { .. } => "upstream",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Configuration { .. } => "configuration",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FlowError>;

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("invalid JSON config: {}", err))
    }
}

impl From<serde_yaml::Error> for FlowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("invalid YAML config: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_error_categories() {
        let err = FlowError::fetch("fetch_assets", anyhow!("connection refused"));
        assert_eq!(err.category(), "fetch");
        assert_eq!(
            err.to_string(),
            "Fetch failed in fetch_assets: connection refused"
        );

        assert_eq!(FlowError::timeout("score_health", 50).category(), "timeout");
        assert_eq!(FlowError::decision(anyhow!("no")).category(), "decision");
    }

    #[test]
    fn test_programming_errors() {
        assert!(FlowError::barrier_misuse(2, 3).is_programming_error());
        assert!(FlowError::slot_misuse("credit", "written twice").is_programming_error());
        assert!(!FlowError::scoring("score_credit", anyhow!("bad")).is_programming_error());
    }

    #[test]
    fn test_cancel_reason() {
        let err = FlowError::cancelled("submit").with_reason("pool shut down");
        match err {
            FlowError::Cancelled { operation, reason } => {
                assert_eq!(operation, "submit");
                assert_eq!(reason.as_deref(), Some("pool shut down"));
            }
            other => panic!("Expected cancellation, got {other:?}"),
        }
    }
}
