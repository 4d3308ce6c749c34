use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::JobError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown severity: {0}")]
pub struct UnknownSeverity(pub String);

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Accepts the vocabulary tools actually print (npm's "moderate",
    /// linters' "warning", CVSS-ish "severe", ...).
    pub fn parse_loose(s: &str) -> Option<Severity> {
        let s = s.trim().to_ascii_lowercase();
        Some(match s.as_str() {
            "info" | "informational" | "information" | "note" | "none" => Severity::Info,
            "low" | "minor" | "warn" | "warning" => Severity::Low,
            "medium" | "moderate" | "med" => Severity::Medium,
            "high" | "error" | "important" | "major" => Severity::High,
            "critical" | "crit" | "severe" => Severity::Critical,
            _ => return None,
        })
    }
}

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::parse_loose(s).ok_or_else(|| UnknownSeverity(s.to_string()))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Success,
    Partial,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Success => "success",
            ScanStatus::Partial => "partial",
            ScanStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub title: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub evidence: String,
}

impl Finding {
    pub fn new(title: impl Into<String>, severity: Severity) -> Self {
        Finding { title: title.into(), severity, description: String::new(), evidence: String::new() }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }
}

/// Normalized tool output. `findings` is always empty when `status` is failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub status: ScanStatus,
    pub findings: Vec<Finding>,
    pub raw_output_excerpt: String,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
    /// SHA-256 of the captured stdout, hex encoded.
    #[serde(default)]
    pub output_sha256: String,
    /// Why a result is partial (parse error, unexpected exit code).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<JobError>,
}

impl ScanResult {
    pub fn new(status: ScanStatus) -> Self {
        ScanResult {
            status,
            findings: Vec::new(),
            raw_output_excerpt: String::new(),
            truncated: false,
            exit_code: None,
            duration_ms: 0,
            output_sha256: String::new(),
            diagnostic: None,
        }
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    /// Finding counts per severity, most severe first, zero counts omitted.
    pub fn severity_counts(&self) -> Vec<(Severity, usize)> {
        let mut counts = [0usize; 5];
        for f in &self.findings {
            counts[f.severity as usize] += 1;
        }
        [Severity::Critical, Severity::High, Severity::Medium, Severity::Low, Severity::Info]
            .into_iter()
            .filter(|s| counts[*s as usize] > 0)
            .map(|s| (s, counts[s as usize]))
            .collect()
    }
}
