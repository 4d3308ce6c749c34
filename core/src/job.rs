use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind, JobError};
use crate::result::{ScanResult, ScanStatus};

pub type OwnerId = String;

/// Time-ordered identifier of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(JobId(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cancelled => "cancelled",
        }
    }

    fn for_error(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Timeout => JobState::TimedOut,
            ErrorKind::Cancelled => JobState::Cancelled,
            ErrorKind::ToolExecutionFailed | ErrorKind::ParseError => JobState::Failed,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "succeeded" => JobState::Succeeded,
            "failed" => JobState::Failed,
            "timed_out" => JobState::TimedOut,
            "cancelled" => JobState::Cancelled,
            other => return Err(format!("unknown job state: {other}")),
        })
    }
}

/// Request to register a job in the session store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub capability: String,
    pub target: String,
    pub owner: OwnerId,
    pub timeout: Duration,
}

/// One requested execution of a capability against a target.
///
/// State only moves forward through the transition methods. Once terminal,
/// exactly one of `result` / `error` is set and the job never changes again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub job_id: JobId,
    /// Submission sequence number, orders jobs of the same owner.
    pub seq: u64,
    pub capability: String,
    pub target: String,
    pub owner: OwnerId,
    pub state: JobState,
    pub submitted_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl ScanJob {
    pub fn new(job_id: JobId, seq: u64, req: NewJob, now_ms: i64) -> Self {
        ScanJob {
            job_id,
            seq,
            capability: req.capability,
            target: req.target,
            owner: req.owner,
            state: JobState::Queued,
            submitted_at_ms: now_ms,
            started_at_ms: None,
            finished_at_ms: None,
            timeout_ms: req.timeout.as_millis() as u64,
            result: None,
            error: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Normalized status of a finished job; `None` while queued or running.
    pub fn status(&self) -> Option<ScanStatus> {
        match (&self.result, &self.error) {
            (Some(r), _) => Some(r.status),
            (None, Some(_)) => Some(ScanStatus::Failed),
            (None, None) => None,
        }
    }

    /// Queued -> Running.
    pub fn mark_running(&mut self, now_ms: i64) -> Result<(), EngineError> {
        self.expect_state(JobState::Queued, JobState::Running)?;
        self.state = JobState::Running;
        self.started_at_ms = Some(now_ms);
        Ok(())
    }

    /// Running -> Succeeded with a usable (success or partial) result.
    pub fn complete(&mut self, result: ScanResult, now_ms: i64) -> Result<(), EngineError> {
        debug_assert!(result.status != ScanStatus::Failed, "failed results are recorded as errors");
        self.expect_state(JobState::Running, JobState::Succeeded)?;
        self.state = JobState::Succeeded;
        self.finished_at_ms = Some(now_ms);
        self.result = Some(result);
        Ok(())
    }

    /// Running -> Failed / TimedOut / Cancelled depending on the error kind.
    /// A queued job may only leave through cancellation.
    pub fn fail(&mut self, error: JobError, now_ms: i64) -> Result<(), EngineError> {
        let to = JobState::for_error(error.kind);
        let allowed = match self.state {
            JobState::Running => true,
            JobState::Queued => to == JobState::Cancelled,
            _ => false,
        };
        if !allowed {
            return Err(EngineError::InvalidTransition { job: self.job_id, from: self.state, to });
        }
        self.state = to;
        self.finished_at_ms = Some(now_ms);
        self.error = Some(error);
        Ok(())
    }

    fn expect_state(&self, from: JobState, to: JobState) -> Result<(), EngineError> {
        if self.state != from {
            return Err(EngineError::InvalidTransition { job: self.job_id, from: self.state, to });
        }
        Ok(())
    }
}
