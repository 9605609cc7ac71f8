//! Error taxonomy for the execution core
//!
//! Only infrastructure-level failures live here. Anything caused by the
//! submitted program (compile errors, non-zero exits, timeouts, memory or
//! output violations) is reported through `ExecutionResult` instead.

/// Errors surfaced to callers of the pipeline and the admission gate
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Language identifier did not match any registered toolchain
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    /// Job could not be turned into a request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Workspace or process creation failed at the infrastructure level
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Admission gate refused the request
    #[error("runner overloaded: {limit} executions already in flight")]
    Overloaded { limit: usize },

    /// Caller cancelled the request before it completed
    #[error("execution cancelled")]
    Cancelled,
}

impl RunnerError {
    /// Stable machine-readable kind, used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerError::UnknownLanguage(_) => "unknown_language",
            RunnerError::InvalidRequest(_) => "invalid_request",
            RunnerError::ResourceExhausted(_) => "resource_exhausted",
            RunnerError::Overloaded { .. } => "overloaded",
            RunnerError::Cancelled => "cancelled",
        }
    }

    pub(crate) fn exhausted(context: &str, err: impl std::fmt::Display) -> Self {
        RunnerError::ResourceExhausted(format!("{}: {}", context, err))
    }
}

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;
