use serde::{Deserialize, Serialize};

/// One archived job as listed by `history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedScan {
    pub job_id: String,
    pub owner: String,
    pub capability: String,
    pub target: String,
    pub state: String,
    pub status: String,
    pub finished_at_ms: i64,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<i64>,
    pub finding_count: i64,
    pub top_severity: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFinding {
    pub ordinal: i64,
    pub title: String,
    pub severity: String,
    pub description: String,
    pub evidence: String,
}
