//! Typed error hierarchy for the HITL control plane.
//!
//! Three top-level enums cover the three subsystems that can fail:
//! - `SessionError`: session state machine and store failures
//! - `ProviderError`: model backend and fallback chain failures
//! - `OrchestratorError`: driver failures, wrapping the other two
//!
//! Exhausting the feedback loop's retry budget is not an error; it is
//! reported through `FeedbackOutcome::passed`.

use std::fmt;

use thiserror::Error;

/// Errors from the session state machine.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session '{task_id}' not found")]
    NotFound { task_id: String },

    #[error("Session '{task_id}' already exists with status {status}")]
    DuplicateTask { task_id: String, status: String },

    #[error("Cannot {operation} session '{task_id}' while it is {status}")]
    InvalidState {
        task_id: String,
        status: String,
        operation: String,
    },

    #[error("Invalid task id '{task_id}': {reason}")]
    InvalidTaskId { task_id: String, reason: String },

    #[error("Rejecting session '{task_id}' requires a non-empty reason")]
    EmptyReason { task_id: String },

    #[error("Session store lock poisoned")]
    LockPoisoned,

    #[error("Storage error for session '{task_id}': {source}")]
    Storage {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SessionError {
    pub(crate) fn storage(task_id: &str, source: impl Into<anyhow::Error>) -> Self {
        SessionError::Storage {
            task_id: task_id.to_string(),
            source: source.into(),
        }
    }

    /// True for contract violations that callers must not retry.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SessionError::NotFound { .. }
                | SessionError::DuplicateTask { .. }
                | SessionError::InvalidState { .. }
                | SessionError::InvalidTaskId { .. }
                | SessionError::EmptyReason { .. }
        )
    }
}

/// One provider's reason for not serving a fallback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.reason)
    }
}

fn join_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no providers configured".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from model backends and the fallback chain.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider '{provider}' is unavailable: no valid API key configured")]
    Unavailable { provider: String },

    #[error("Provider '{provider}' call failed: {message}")]
    CallFailed { provider: String, message: String },

    #[error("All providers failed: {}", join_failures(.failures))]
    AllProvidersFailed { failures: Vec<ProviderFailure> },

    #[error("Unsupported provider '{name}'")]
    UnsupportedProvider { name: String },
}

impl ProviderError {
    pub fn call_failed(provider: &str, message: impl fmt::Display) -> Self {
        ProviderError::CallFailed {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }
}

/// Errors from the orchestrator driver.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Refusing to write '{path}': {}", .violations.join(", "))]
    ForbiddenOutputPath {
        path: String,
        violations: Vec<String>,
    },

    #[error("No executor registered for phase type '{phase_type}'")]
    MissingExecutor { phase_type: String },

    #[error("Phase '{phase}' executor failed: {source}")]
    Executor {
        phase: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_invalid_state_names_operation() {
        let err = SessionError::InvalidState {
            task_id: "T1".to_string(),
            status: "RUNNING".to_string(),
            operation: "approve".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("approve"));
        assert!(msg.contains("RUNNING"));
        assert!(msg.contains("T1"));
        assert!(err.is_caller_error());
    }

    #[test]
    fn storage_error_is_not_caller_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = SessionError::storage("T1", io_err);
        assert!(!err.is_caller_error());
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn all_providers_failed_lists_each_provider() {
        let err = ProviderError::AllProvidersFailed {
            failures: vec![
                ProviderFailure {
                    provider: "anthropic".to_string(),
                    reason: "unavailable".to_string(),
                },
                ProviderFailure {
                    provider: "openai".to_string(),
                    reason: "HTTP 500".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("anthropic: unavailable"));
        assert!(msg.contains("openai: HTTP 500"));
    }

    #[test]
    fn all_providers_failed_with_no_candidates() {
        let err = ProviderError::AllProvidersFailed { failures: vec![] };
        assert!(err.to_string().contains("no providers configured"));
    }

    #[test]
    fn orchestrator_error_converts_from_session_error() {
        let inner = SessionError::NotFound {
            task_id: "T9".to_string(),
        };
        let err: OrchestratorError = inner.into();
        match &err {
            OrchestratorError::Session(SessionError::NotFound { task_id }) => {
                assert_eq!(task_id, "T9");
            }
            _ => panic!("Expected OrchestratorError::Session(NotFound)"),
        }
    }

    #[test]
    fn forbidden_output_path_joins_violations() {
        let err = OrchestratorError::ForbiddenOutputPath {
            path: ".git/config".to_string(),
            violations: vec!["forbidden pattern".to_string(), "not allowed".to_string()],
        };
        assert!(err.to_string().contains("forbidden pattern, not allowed"));
    }

    #[test]
    fn orchestrator_error_wraps_anyhow() {
        let err: OrchestratorError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, OrchestratorError::Other(_)));
        assert_eq!(err.to_string(), "disk full");
    }

    fn assert_std_error<E: std::error::Error + Send + Sync + 'static>() {}

    #[test]
    fn errors_are_std_errors() {
        assert_std_error::<SessionError>();
        assert_std_error::<ProviderError>();
        assert_std_error::<OrchestratorError>();
    }
}
