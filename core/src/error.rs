use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::job::{JobId, JobState};

/// Errors surfaced synchronously to engine callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("unknown capability: {0}")]
    CapabilityNotFound(String),
    #[error("scan job not found: {0}")]
    JobNotFound(JobId),
    #[error("scan job {job} is not owned by {owner}")]
    NotOwner { job: JobId, owner: String },
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("illegal transition for job {job}: {from} -> {to}")]
    InvalidTransition { job: JobId, from: JobState, to: JobState },
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Classification of execution-time problems recorded on a job or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ToolExecutionFailed,
    Timeout,
    ParseError,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ToolExecutionFailed => "tool_execution_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Whatever stdout was captured before the failure, bounded.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_excerpt: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        JobError { kind, message: message.into(), output_excerpt: String::new() }
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.output_excerpt = excerpt.into();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let e = JobError::new(ErrorKind::ToolExecutionFailed, "boom");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["kind"], "tool_execution_failed");
        assert!(v.get("output_excerpt").is_none());
        assert_eq!(e.to_string(), "tool_execution_failed: boom");
    }
}
