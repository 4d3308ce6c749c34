use engine_core::Severity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Placeholder substituted with the validated target inside `args`.
pub const TARGET_PLACEHOLDER: &str = "{target}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Lines,
    Json,
    Xml,
}

/// Grammar a target must satisfy before any process is spawned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    Hostname,
    #[default]
    Host,
    HostOrCidr,
    Url,
    Package,
    /// Custom regex from `target_pattern`, matched against the whole target.
    Pattern,
}

/// How raw output is cut into flat records before templating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractRule {
    /// Lines: regex with named captures; lines that do not match are skipped.
    /// Without a pattern every non-empty line becomes a record (`line` field).
    #[serde(default)]
    pub line_pattern: Option<String>,
    /// Json: JSON pointer to the record collection, empty for the document root.
    #[serde(default)]
    pub pointer: String,
    /// Json: treat an object at `pointer` as a map of records keyed by `key`.
    #[serde(default)]
    pub entries: bool,
    /// Xml: element name that yields one record per occurrence.
    #[serde(default)]
    pub element: Option<String>,
    /// Records whose fields do not carry these exact values are dropped.
    #[serde(default)]
    pub require: BTreeMap<String, String>,
}

/// `{field}` templates rendered against each record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FindingTemplate {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_evidence")]
    pub evidence: String,
}

impl Default for FindingTemplate {
    fn default() -> Self {
        FindingTemplate { title: default_title(), description: String::new(), evidence: default_evidence() }
    }
}

fn default_title() -> String {
    "Tool output".to_string()
}

fn default_evidence() -> String {
    "{line}".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeverityRule {
    pub keyword: String,
    pub severity: Severity,
}

/// Table-driven severity: tool-reported field, then keywords, then default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeverityTable {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub keywords: Vec<SeverityRule>,
    #[serde(default)]
    pub default: Severity,
}

/// Immutable description of one capability's tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    pub capability: String,
    #[serde(default)]
    pub description: String,
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub target: TargetKind,
    #[serde(default)]
    pub target_pattern: Option<String>,
    pub output_format: OutputFormat,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_success_exit_codes")]
    pub success_exit_codes: Vec<i32>,
    #[serde(default)]
    pub extract: ExtractRule,
    #[serde(default)]
    pub finding: FindingTemplate,
    #[serde(default)]
    pub severity: SeverityTable,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_success_exit_codes() -> Vec<i32> {
    vec![0]
}

impl ToolSpec {
    /// Spec with every optional field at its default.
    pub fn new(capability: &str, executable: &str, args: &[&str], output_format: OutputFormat) -> Self {
        ToolSpec {
            capability: capability.to_string(),
            description: String::new(),
            executable: executable.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            target: TargetKind::default(),
            target_pattern: None,
            output_format,
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            success_exit_codes: default_success_exit_codes(),
            extract: ExtractRule::default(),
            finding: FindingTemplate::default(),
            severity: SeverityTable::default(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Argument vector with the placeholder replaced; the target stays one argv element.
    pub fn build_args(&self, target: &str) -> Vec<String> {
        self.args.iter().map(|a| a.replace(TARGET_PLACEHOLDER, target)).collect()
    }

    pub fn accepts_exit_code(&self, code: Option<i32>) -> bool {
        code.map(|c| self.success_exit_codes.contains(&c)).unwrap_or(false)
    }
}
