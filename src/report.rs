use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ProviderErrorKind, ValidationError};
use crate::orchestrator::RunState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    Validation { message: String },
    Provider { kind: String, message: String },
    RetriesExhausted { attempts: u32 },
    Skipped { message: String },
}

impl FailureReason {
    pub fn validation(err: &ValidationError) -> Self {
        FailureReason::Validation {
            message: err.to_string(),
        }
    }

    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        FailureReason::Provider {
            kind: kind.as_str().to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Validation { message } => write!(f, "validation failed: {}", message),
            FailureReason::Provider { kind, message } => write!(f, "{}: {}", kind, message),
            FailureReason::RetriesExhausted { attempts } => {
                write!(f, "retries exhausted after {} attempts", attempts)
            }
            FailureReason::Skipped { message } => {
                write!(f, "skipped (rejected earlier: {})", message)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub id: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub total: usize,
    pub translated: usize,
    pub cached: usize,
    pub failed: usize,
    pub pending: Vec<String>,
    pub failures: Vec<FailureRecord>,
    pub oversized: Vec<String>,
    pub cache_warnings: Vec<String>,
    pub provider_calls: usize,
    /// Final `id -> text` mapping; filled only for a completed run.
    pub output: BTreeMap<String, String>,
}

impl RunReport {
    pub fn empty(state: RunState) -> Self {
        Self {
            state,
            total: 0,
            translated: 0,
            cached: 0,
            failed: 0,
            pending: Vec::new(),
            failures: Vec::new(),
            oversized: Vec::new(),
            cache_warnings: Vec::new(),
            provider_calls: 0,
            output: BTreeMap::new(),
        }
    }

    pub fn format_summary(&self) -> String {
        let mut lines = vec![format!(
            "run {}: {} strings, {} translated, {} cached, {} failed, {} pending ({} provider calls)",
            self.state,
            self.total,
            self.translated,
            self.cached,
            self.failed,
            self.pending.len(),
            self.provider_calls
        )];
        for failure in &self.failures {
            lines.push(format!("  failed {}: {}", failure.id, failure.reason));
        }
        if !self.oversized.is_empty() {
            lines.push(format!(
                "  oversized (sent alone): {}",
                self.oversized.join(", ")
            ));
        }
        for warning in &self.cache_warnings {
            lines.push(format!("  cache: {}", warning));
        }
        lines.join("\n")
    }
}
