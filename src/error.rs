use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::orchestrator::RunState;
use crate::report::RunReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    RateLimited,
    AuthError,
    Timeout,
    InvalidRequest,
    Unknown,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::AuthError => "auth_error",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::InvalidRequest => "invalid_request",
            ProviderErrorKind::Unknown => "unknown",
        }
    }

    /// Transient failures are retried through the credential rotation path.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited | ProviderErrorKind::Timeout | ProviderErrorKind::Unknown
        )
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(
        "placeholder `{placeholder}` missing or out of order (expected {expected:?}, found {found:?})"
    )]
    PlaceholderMismatch {
        placeholder: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("string of {chars} characters exceeds the {limit} character batch limit")]
    Oversized { chars: usize, limit: usize },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
    #[error("run blocked: {untranslated} strings left untranslated")]
    RunBlocked {
        untranslated: usize,
        report: Box<RunReport>,
    },
    #[error("cannot {action} while the run is {state}")]
    InvalidState {
        action: &'static str,
        state: RunState,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
