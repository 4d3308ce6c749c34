//! Turns a finished tool run into the common result schema.
//!
//! Execution failures (timeout, cancellation, a tool that produced nothing
//! and exited badly) become a [`JobError`]; output that exists but cannot be
//! parsed becomes a `partial` result with no findings.

mod records;
mod template;
mod xml;

pub use records::Record;
pub use template::render;

use engine_core::{clip_utf8, ErrorKind, JobError, ScanResult, ScanStatus};
use process_runner::RunOutcome;
use regex::Regex;
use sha2::{Digest, Sha256};
use tool_registry::{OutputFormat, ToolSpec};
use tracing::debug;

/// Bound on `raw_output_excerpt` and `JobError::output_excerpt`.
pub const EXCERPT_BYTES: usize = 4096;
/// Bound on stderr carried into an error message.
pub const STDERR_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Result(ScanResult),
    Error(JobError),
}

impl Normalized {
    pub fn status(&self) -> ScanStatus {
        match self {
            Normalized::Result(r) => r.status,
            Normalized::Error(_) => ScanStatus::Failed,
        }
    }
}

pub fn normalize(spec: &ToolSpec, outcome: &RunOutcome) -> Normalized {
    normalize_inner(spec, None, outcome)
}

/// Like [`normalize`], with the scanned target available to finding
/// templates as `{target}`.
pub fn normalize_for(spec: &ToolSpec, target: &str, outcome: &RunOutcome) -> Normalized {
    normalize_inner(spec, Some(target), outcome)
}

fn normalize_inner(spec: &ToolSpec, target: Option<&str>, outcome: &RunOutcome) -> Normalized {
    let stdout = outcome.stdout_lossy();
    let excerpt = clip_utf8(&stdout, EXCERPT_BYTES).to_string();

    if outcome.cancelled {
        return Normalized::Error(JobError::new(ErrorKind::Cancelled, "scan cancelled").with_excerpt(excerpt));
    }
    if outcome.timed_out {
        let msg = format!("{} did not finish within its timeout ({} ms elapsed)", spec.executable, outcome.duration_ms);
        return Normalized::Error(JobError::new(ErrorKind::Timeout, msg).with_excerpt(excerpt));
    }
    let exit_ok = spec.accepts_exit_code(outcome.exit_code);
    if !exit_ok && stdout.trim().is_empty() {
        return Normalized::Error(JobError::new(ErrorKind::ToolExecutionFailed, failure_message(spec, outcome)));
    }

    let mut result = ScanResult::new(ScanStatus::Success);
    result.raw_output_excerpt = excerpt;
    result.truncated = outcome.truncated;
    result.exit_code = outcome.exit_code;
    result.duration_ms = outcome.duration_ms;
    result.output_sha256 = hex::encode(Sha256::digest(&outcome.stdout));

    let records = match parse(spec, outcome, &stdout) {
        Ok(records) => records,
        Err(reason) => {
            debug!(capability = %spec.capability, %reason, truncated = outcome.truncated, "tool output not parseable");
            result.status = ScanStatus::Partial;
            result.diagnostic = Some(JobError::new(ErrorKind::ParseError, reason));
            return Normalized::Result(result);
        }
    };
    result.findings = records
        .into_iter()
        .filter(|rec| spec.extract.require.iter().all(|(k, v)| rec.get(k) == Some(v)))
        .map(|mut rec| {
            if let Some(t) = target {
                rec.entry("target".to_string()).or_insert_with(|| t.to_string());
            }
            template::finding(&spec.finding, &spec.severity, &rec, &spec.capability)
        })
        .collect();

    if !exit_ok {
        result.status = ScanStatus::Partial;
        result.diagnostic = Some(JobError::new(ErrorKind::ToolExecutionFailed, failure_message(spec, outcome)));
    } else if outcome.truncated {
        result.status = ScanStatus::Partial;
    }
    Normalized::Result(result)
}

fn parse(spec: &ToolSpec, outcome: &RunOutcome, stdout: &str) -> Result<Vec<Record>, String> {
    match spec.output_format {
        OutputFormat::Lines => {
            let re = match &spec.extract.line_pattern {
                Some(p) => Some(Regex::new(p).map_err(|e| format!("line pattern: {e}"))?),
                None => None,
            };
            Ok(records::from_lines(stdout, re.as_ref()))
        }
        OutputFormat::Json => records::from_json(&outcome.stdout, &spec.extract),
        OutputFormat::Xml => {
            let element = spec.extract.element.as_deref().ok_or("no extract.element configured for xml output")?;
            xml::from_xml(stdout, element)
        }
    }
}

fn failure_message(spec: &ToolSpec, outcome: &RunOutcome) -> String {
    let stderr = outcome.stderr_lossy();
    let stderr = clip_utf8(stderr.trim(), STDERR_BYTES);
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match outcome.exit_code {
        Some(code) => format!("{} exited with status {code}", spec.executable),
        None => format!("{} was terminated by a signal", spec.executable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::Severity;
    use tool_registry::Registry;

    fn outcome(stdout: &str, exit_code: Option<i32>) -> RunOutcome {
        RunOutcome { exit_code, stdout: stdout.as_bytes().to_vec(), duration_ms: 12, pid: Some(1), ..RunOutcome::default() }
    }

    fn builtin(capability: &str) -> ToolSpec {
        Registry::builtin().unwrap().lookup(capability).unwrap().as_ref().clone()
    }

    fn result(n: Normalized) -> ScanResult {
        match n {
            Normalized::Result(r) => r,
            Normalized::Error(e) => panic!("expected a result, got {e}"),
        }
    }

    fn error(n: Normalized) -> JobError {
        match n {
            Normalized::Error(e) => e,
            Normalized::Result(r) => panic!("expected an error, got {:?}", r.status),
        }
    }

    #[test]
    fn dns_lookup_single_address() {
        let spec = builtin("dns-lookup");
        let r = result(normalize_for(&spec, "example.com", &outcome("93.184.216.34\n", Some(0))));
        assert_eq!(r.status, ScanStatus::Success);
        assert_eq!(r.findings.len(), 1);
        assert_eq!(r.findings[0].evidence, "93.184.216.34");
        assert_eq!(r.findings[0].description, "example.com resolves to 93.184.216.34");
        assert_eq!(r.findings[0].severity, Severity::Info);
        assert_eq!(r.exit_code, Some(0));
        assert_eq!(r.output_sha256.len(), 64);
        assert!(r.diagnostic.is_none());
    }

    #[test]
    fn timeout_is_failed_even_with_partial_output() {
        let spec = builtin("dns-lookup");
        let mut o = outcome("93.184.216.34\n", None);
        o.timed_out = true;
        let n = normalize(&spec, &o);
        assert_eq!(n.status(), ScanStatus::Failed);
        let e = error(n);
        assert_eq!(e.kind, ErrorKind::Timeout);
        assert_eq!(e.output_excerpt, "93.184.216.34\n");
    }

    #[test]
    fn cancelled_outcome() {
        let mut o = outcome("", None);
        o.cancelled = true;
        assert_eq!(error(normalize(&builtin("whois"), &o)).kind, ErrorKind::Cancelled);
    }

    #[test]
    fn empty_output_and_bad_exit_is_execution_failure() {
        let mut o = outcome("", Some(1));
        o.stderr = format!("nmap: command failed\n{}", "x".repeat(5000)).into_bytes();
        let e = error(normalize(&builtin("port-scan"), &o));
        assert_eq!(e.kind, ErrorKind::ToolExecutionFailed);
        assert!(e.message.starts_with("nmap: command failed"));
        assert!(e.message.len() <= STDERR_BYTES);

        let e = error(normalize(&builtin("port-scan"), &outcome("", None)));
        assert!(e.message.contains("signal"));
    }

    #[test]
    fn empty_output_with_success_is_a_clean_result() {
        let r = result(normalize(&builtin("subdomain-enum"), &outcome("", Some(0))));
        assert_eq!(r.status, ScanStatus::Success);
        assert!(r.findings.is_empty());
    }

    #[test]
    fn unparseable_output_is_partial() {
        let r = result(normalize(&builtin("npm-package"), &outcome("npm ERR! something odd\n", Some(0))));
        assert_eq!(r.status, ScanStatus::Partial);
        assert!(r.findings.is_empty());
        assert_eq!(r.raw_output_excerpt, "npm ERR! something odd\n");
        assert_eq!(r.diagnostic.unwrap().kind, ErrorKind::ParseError);
    }

    #[test]
    fn truncated_or_unexpected_exit_downgrades_to_partial() {
        let spec = builtin("subdomain-enum");
        let mut o = outcome("a.example.com\nb.example.com\n", Some(0));
        o.truncated = true;
        let r = result(normalize(&spec, &o));
        assert_eq!(r.status, ScanStatus::Partial);
        assert_eq!(r.findings.len(), 2);
        assert!(r.truncated);

        let r = result(normalize(&spec, &outcome("a.example.com\n", Some(2))));
        assert_eq!(r.status, ScanStatus::Partial);
        assert_eq!(r.diagnostic.unwrap().kind, ErrorKind::ToolExecutionFailed);
    }

    #[test]
    fn nmap_open_ports_with_keyword_severity() {
        let xml = r#"<?xml version="1.0"?><nmaprun><host><ports>
<port protocol="tcp" portid="23"><state state="open" reason="syn-ack"/><service name="telnet"/></port>
<port protocol="tcp" portid="80"><state state="open" reason="syn-ack"/><service name="http" product="nginx"/></port>
<port protocol="tcp" portid="25"><state state="filtered" reason="no-response"/><service name="smtp"/></port>
</ports></host></nmaprun>"#;
        let r = result(normalize(&builtin("port-scan"), &outcome(xml, Some(0))));
        assert_eq!(r.status, ScanStatus::Success);
        assert_eq!(r.findings.len(), 2);
        assert_eq!(r.findings[0].title, "Open port 23/tcp");
        assert_eq!(r.findings[0].severity, Severity::High);
        assert_eq!(r.findings[1].description, "http nginx");
        assert_eq!(r.findings[1].evidence, "tcp/80 open syn-ack");
        assert_eq!(r.findings[1].severity, Severity::Info);
        assert_eq!(r.highest_severity(), Some(Severity::High));
    }

    #[test]
    fn truncated_xml_is_partial() {
        let mut o = outcome("<?xml version=\"1.0\"?><nmaprun><host><ports><port protocol=\"tcp\" portid=\"22\">", Some(0));
        o.truncated = true;
        let r = result(normalize(&builtin("port-scan"), &o));
        assert_eq!(r.status, ScanStatus::Partial);
        assert!(r.findings.is_empty());
    }

    #[test]
    fn npm_license_risk() {
        let json = r#"{"name":"ghostscript-js","version":"1.0.0","license":"AGPL-3.0","dist":{"tarball":"https://registry.npmjs.org/g/-/g-1.0.0.tgz"}}"#;
        let r = result(normalize(&builtin("npm-package"), &outcome(json, Some(0))));
        assert_eq!(r.findings.len(), 1);
        assert_eq!(r.findings[0].title, "ghostscript-js@1.0.0");
        assert_eq!(r.findings[0].severity, Severity::High);

        let json = r#"{"name":"left-pad","version":"1.3.0","license":"WTFPL"}"#;
        let r = result(normalize(&builtin("npm-package"), &outcome(json, Some(0))));
        assert_eq!(r.findings[0].severity, Severity::Info);
        assert_eq!(r.findings[0].evidence, "");
    }

    #[test]
    fn excerpt_is_bounded() {
        let big = "a.example.com\n".repeat(1000);
        let r = result(normalize(&builtin("subdomain-enum"), &outcome(&big, Some(0))));
        assert_eq!(r.raw_output_excerpt.len(), EXCERPT_BYTES);
        assert_eq!(r.findings.len(), 1000);
    }

    fn titled<'a>(r: &'a ScanResult, title: &str) -> &'a engine_core::Finding {
        r.findings.iter().find(|f| f.title == title).unwrap_or_else(|| panic!("no finding {title:?}"))
    }

    #[test]
    fn npm_audit_severity_comes_from_the_record() {
        let json = r#"{
          "auditReportVersion": 2,
          "vulnerabilities": {
            "lodash": {"name": "lodash", "severity": "high", "isDirect": true, "range": "<=4.17.18",
              "via": [{"source": 1065, "title": "Prototype Pollution in lodash",
                       "url": "https://github.com/advisories/GHSA-p6mc-m468-83gw", "severity": "high"}]},
            "minimist": {"name": "minimist", "severity": "moderate", "range": "<0.2.1",
              "via": [{"title": "Prototype Pollution in minimist", "url": "https://github.com/advisories/GHSA-vh95-rmgr-6w4m"}]},
            "mkdirp": {"name": "mkdirp", "severity": "moderate", "range": "0.4.1 - 0.5.1", "via": ["minimist"]},
            "shell-quote": {"name": "shell-quote", "severity": "critical", "range": "<=1.7.2",
              "via": [{"title": "Improper Neutralization of Special Elements", "url": "https://github.com/advisories/GHSA-g4rg-993r-mgx7"}]},
            "trivial": {"name": "trivial", "severity": "info", "range": "*", "via": []}
          },
          "metadata": {"vulnerabilities": {"total": 5}}
        }"#;
        // npm audit exits 1 when vulnerabilities were found
        let r = result(normalize_for(&builtin("npm-audit"), "/srv/app", &outcome(json, Some(1))));
        assert_eq!(r.status, ScanStatus::Success);
        assert!(r.diagnostic.is_none());
        assert_eq!(r.findings.len(), 5);

        let lodash = titled(&r, "lodash high vulnerability");
        assert_eq!(lodash.severity, Severity::High);
        assert_eq!(lodash.description, "Prototype Pollution in lodash (affected <=4.17.18)");
        assert_eq!(lodash.evidence, "https://github.com/advisories/GHSA-p6mc-m468-83gw");
        assert_eq!(titled(&r, "minimist moderate vulnerability").severity, Severity::Medium);
        assert_eq!(titled(&r, "mkdirp moderate vulnerability").severity, Severity::Medium);
        assert_eq!(titled(&r, "shell-quote critical vulnerability").severity, Severity::Critical);
        // the field wins over the table default
        assert_eq!(titled(&r, "trivial info vulnerability").severity, Severity::Info);
        assert_eq!(r.highest_severity(), Some(Severity::Critical));
    }

    #[test]
    fn npm_audit_without_a_severity_field_uses_the_default() {
        let json = r#"{"vulnerabilities": {"left-pad": {"name": "left-pad", "range": "*", "via": []}}}"#;
        let r = result(normalize(&builtin("npm-audit"), &outcome(json, Some(1))));
        assert_eq!(r.findings[0].severity, Severity::Medium);

        let clean = r#"{"auditReportVersion": 2, "vulnerabilities": {}, "metadata": {}}"#;
        let r = result(normalize(&builtin("npm-audit"), &outcome(clean, Some(0))));
        assert_eq!(r.status, ScanStatus::Success);
        assert!(r.findings.is_empty());
    }

    #[test]
    fn npm_outdated_entries() {
        let json = r#"{"lodash": {"current": "4.17.15", "wanted": "4.17.21", "latest": "4.17.21",
                       "dependent": "app", "location": "/srv/app/node_modules/lodash"}}"#;
        let r = result(normalize(&builtin("npm-outdated"), &outcome(json, Some(1))));
        assert_eq!(r.status, ScanStatus::Success);
        assert_eq!(r.findings.len(), 1);
        assert_eq!(r.findings[0].title, "lodash 4.17.15 -> 4.17.21");
        assert_eq!(r.findings[0].evidence, "/srv/app/node_modules/lodash");
        assert_eq!(r.findings[0].severity, Severity::Low);
    }

    #[test]
    fn email_security_records() {
        let out = "example.com.\t\t300\tIN\tMX\t10 mail.example.com.\n\
                   example.com.\t\t300\tIN\tTXT\t\"v=spf1 include:_spf.example.com ~all\"\n\
                   example.com.\t\t300\tIN\tTXT\t\"google-site-verification=abc123\"\n\
                   _dmarc.example.com.\t300\tIN\tTXT\t\"v=DMARC1; p=none; rua=mailto:d@example.com\"\n";
        let r = result(normalize(&builtin("email-security"), &outcome(out, Some(0))));
        assert_eq!(r.findings.len(), 3);
        assert_eq!(r.findings[0].title, "MX record");
        assert_eq!(r.findings[0].evidence, "10 mail.example.com.");
        assert_eq!(r.findings[0].severity, Severity::Info);
        assert_eq!(r.findings[1].severity, Severity::Low);
        assert!(r.findings[2].evidence.starts_with("\"v=DMARC1"));
        assert_eq!(r.findings[2].severity, Severity::Medium);
    }
}
