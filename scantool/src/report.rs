use crate::OutputFormat;
use anyhow::Result;
use engine_core::ScanJob;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CSV_HEADER: [&str; 10] =
    ["job_id", "capability", "target", "state", "status", "severity", "title", "evidence", "duration_ms", "finished_at"];

pub fn rfc3339_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default()
}

/// Renders terminal jobs to stdout, a file, or CSV.
pub struct Report {
    format: OutputFormat,
    out: Option<BufWriter<File>>,
    csv: Option<csv::Writer<File>>,
}

impl Report {
    pub fn new(format: OutputFormat, out: Option<&Path>, csv: bool) -> Result<Self> {
        let mut report = Report { format, out: None, csv: None };
        match (out, csv) {
            (Some(path), true) => {
                let mut wtr = csv::Writer::from_writer(File::create(path)?);
                wtr.write_record(CSV_HEADER)?;
                report.csv = Some(wtr);
            }
            (Some(path), false) => {
                let file = OpenOptions::new().create(true).truncate(true).write(true).open(path)?;
                report.out = Some(BufWriter::new(file));
            }
            (None, true) => eprintln!("--csv requires --out <file>"),
            (None, false) => {}
        }
        Ok(report)
    }

    pub fn job(&mut self, job: &ScanJob) -> Result<()> {
        if let Some(wtr) = self.csv.as_mut() {
            for row in csv_rows(job) {
                wtr.write_record(&row)?;
            }
            return Ok(wtr.flush()?);
        }
        let text = match self.format {
            OutputFormat::Text => text_lines(job),
            OutputFormat::Json => serde_json::to_string_pretty(job)?,
            OutputFormat::Jsonl => serde_json::to_string(job)?,
        };
        self.line(&text)
    }

    /// A target the engine refused before creating a job.
    pub fn rejected(&mut self, capability: &str, target: &str, error: &str) -> Result<()> {
        if let Some(wtr) = self.csv.as_mut() {
            wtr.write_record([
                "",
                capability,
                target,
                "rejected",
                "failed",
                "",
                error,
                "",
                "",
                "",
            ])?;
            return Ok(wtr.flush()?);
        }
        let text = match self.format {
            OutputFormat::Text => format!("{target}: rejected ({error})"),
            OutputFormat::Json | OutputFormat::Jsonl => serde_json::json!({
                "capability": capability,
                "target": target,
                "state": "rejected",
                "error": error,
            })
            .to_string(),
        };
        self.line(&text)
    }

    fn line(&mut self, text: &str) -> Result<()> {
        match self.out.as_mut() {
            Some(w) => {
                writeln!(w, "{}", text)?;
                w.flush()?;
            }
            None => println!("{}", text),
        }
        Ok(())
    }
}

fn text_lines(job: &ScanJob) -> String {
    let mut s = format!("{} {} [{}] {}", job.target, job.capability, job.job_id, job.state);
    if let Some(r) = &job.result {
        s.push_str(&format!(
            ": {} ({} findings, exit {}, {} ms{})",
            r.status.as_str(),
            r.findings.len(),
            r.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            r.duration_ms,
            if r.truncated { ", output truncated" } else { "" },
        ));
        if let Some(d) = &r.diagnostic {
            s.push_str(&format!("\n  note: {} {}", d.kind, d.message));
        }
        for f in &r.findings {
            s.push_str(&format!("\n  [{}] {}", f.severity.as_str(), f.title));
            if !f.evidence.is_empty() {
                s.push_str(&format!(" :: {}", f.evidence));
            }
        }
    }
    if let Some(e) = &job.error {
        s.push_str(&format!(": {} {}", e.kind, e.message));
    }
    s
}

fn csv_rows(job: &ScanJob) -> Vec<Vec<String>> {
    let status = job.status().map(|s| s.as_str()).unwrap_or("");
    let finished = job.finished_at_ms.map(rfc3339_ms).unwrap_or_default();
    let duration = job.result.as_ref().map(|r| r.duration_ms.to_string()).unwrap_or_default();
    let base = |severity: &str, title: &str, evidence: &str| {
        vec![
            job.job_id.to_string(),
            job.capability.clone(),
            job.target.clone(),
            job.state.to_string(),
            status.to_string(),
            severity.to_string(),
            title.to_string(),
            evidence.to_string(),
            duration.clone(),
            finished.clone(),
        ]
    };
    match (&job.result, &job.error) {
        (Some(r), _) if !r.findings.is_empty() => {
            r.findings.iter().map(|f| base(f.severity.as_str(), &f.title, &f.evidence)).collect()
        }
        (_, Some(e)) => vec![base("", &e.message, "")],
        _ => vec![base("", "", "")],
    }
}
