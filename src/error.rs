//! Error Types
//!
//! Two layers of errors flow through the engine:
//!
//! - [`StepError`]: what a step handler (or the machinery wrapped around it)
//!   reports. Carries a stable `kind()` used by retry allow-lists.
//! - [`EngineError`]: the execution-level taxonomy. Request-level variants are
//!   returned as `Err` before any step runs; the remaining variants only ever
//!   appear inside a failed [`ExecutionResult`](crate::execution::ExecutionResult).

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure reported by a single step attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    /// Transport-level failure reaching an external dependency.
    #[error("network failure: {0}")]
    Network(String),

    /// The step did not finish within its time budget.
    #[error("step timed out after {0} ms")]
    Timeout(u64),

    /// The dependency's breaker is open and no fallback was available.
    #[error("circuit for dependency '{0}' is open")]
    CircuitOpen(String),

    /// The resource guard rejected the call.
    #[error("resource limit exceeded for '{0}'")]
    RateLimited(String),

    /// The step configuration could not be applied.
    #[error("invalid step configuration: {0}")]
    InvalidConfig(String),

    /// The execution was cancelled while this step was suspended.
    #[error("execution cancelled")]
    Cancelled,

    /// Handler-defined failure with its own kind tag.
    #[error("{kind}: {message}")]
    Handler { kind: String, message: String },
}

impl StepError {
    /// Shorthand for a handler-defined failure.
    pub fn handler(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Stable kind tag matched against `RetryPolicy::retryable_errors`.
    pub fn kind(&self) -> &str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::CircuitOpen(_) => "circuit-open",
            Self::RateLimited(_) => "rate-limited",
            Self::InvalidConfig(_) => "invalid-config",
            Self::Cancelled => "cancelled",
            Self::Handler { kind, .. } => kind,
        }
    }

    /// Network failures and timeouts are always worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

/// Execution-level error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown or disabled definition identifier.
    #[error("definition '{0}' not found")]
    NotFound(String),

    /// Structurally inconsistent definition.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// The execution request failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Admission was rejected by the resource guard.
    #[error("resource limit exceeded for '{resource}' (window resets in {reset_in_ms} ms)")]
    RateLimited { resource: String, reset_in_ms: u64 },

    /// A step handler failed.
    #[error("step '{step_id}' failed: {source}")]
    StepFailure {
        step_id: String,
        #[source]
        source: StepError,
    },

    /// A step or the whole execution ran out of time.
    #[error("{scope} exceeded its {after_ms} ms budget")]
    Timeout { scope: String, after_ms: u64 },

    /// A dependency call was rejected by an open breaker.
    #[error("step '{step_id}': circuit for dependency '{dependency}' is open")]
    CircuitOpen { step_id: String, dependency: String },

    /// The caller cancelled the execution.
    #[error("execution cancelled")]
    Cancelled,

    /// The execution visited more steps than allowed, usually a `next` cycle.
    #[error("execution exceeded the limit of {limit} step visits")]
    StepLimit { limit: u32 },

    /// The background task running an execution panicked or was aborted.
    #[error("execution task failed: {0}")]
    TaskFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Converts a step failure into the execution-level error it terminates with.
    pub fn from_step(step_id: &str, error: StepError) -> Self {
        match error {
            StepError::Timeout(after_ms) => Self::Timeout {
                scope: format!("step '{}'", step_id),
                after_ms,
            },
            StepError::CircuitOpen(dependency) => Self::CircuitOpen {
                step_id: step_id.to_string(),
                dependency,
            },
            StepError::Cancelled => Self::Cancelled,
            source => Self::StepFailure {
                step_id: step_id.to_string(),
                source,
            },
        }
    }

    /// Machine-readable code recorded on failed results.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidDefinition(_) => "INVALID_DEFINITION",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::StepFailure { .. } => "STEP_FAILURE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Cancelled => "CANCELLED",
            Self::StepLimit { .. } => "STEP_LIMIT_EXCEEDED",
            Self::TaskFailed(_) => "TASK_FAILED",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// True for errors surfaced to the caller before any step runs.
    pub fn is_request_level(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InvalidDefinition(_)
                | Self::InvalidInput(_)
                | Self::RateLimited { .. }
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_kinds() {
        assert_eq!(StepError::Network("reset".into()).kind(), "network");
        assert_eq!(StepError::Timeout(10).kind(), "timeout");
        assert_eq!(StepError::handler("quota", "exhausted").kind(), "quota");
        assert_eq!(StepError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_transient_classification() {
        assert!(StepError::Network("dns".into()).is_transient());
        assert!(StepError::Timeout(5).is_transient());
        assert!(!StepError::CircuitOpen("openai".into()).is_transient());
        assert!(!StepError::handler("bad-request", "nope").is_transient());
    }

    #[test]
    fn test_from_step_mapping() {
        let err = EngineError::from_step("call", StepError::CircuitOpen("stripe".into()));
        assert_eq!(err.code(), "CIRCUIT_OPEN");
        assert!(err.to_string().contains("stripe"));

        let err = EngineError::from_step("wait", StepError::Timeout(250));
        assert_eq!(err.code(), "TIMEOUT");
        assert!(err.to_string().contains("250"));

        let err = EngineError::from_step("fetch", StepError::Network("refused".into()));
        assert_eq!(err.code(), "STEP_FAILURE");
        assert!(err.to_string().contains("fetch"));
    }

    #[test]
    fn test_request_level_errors() {
        assert!(EngineError::NotFound("missing".into()).is_request_level());
        assert!(EngineError::InvalidInput("empty".into()).is_request_level());
        assert!(!EngineError::Cancelled.is_request_level());
    }
}
