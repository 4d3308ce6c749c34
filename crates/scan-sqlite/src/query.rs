use crate::{ArchivedFinding, ArchivedScan, Db};
use anyhow::Result;
use engine_core::{JobId, ScanJob};
use rusqlite::{params, OptionalExtension, Row};

const SCAN_COLUMNS: &str = "job_id,owner,capability,target,state,status,finished_at_ms,exit_code,duration_ms,finding_count,top_severity,error_kind,error_message";

impl Db {
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let cnt: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |r| r.get(0),
        )?;
        Ok(cnt > 0)
    }

    /// Most recently finished scans first, optionally for one owner.
    pub fn recent_scans(&self, owner: Option<&str>, limit: usize) -> Result<Vec<ArchivedScan>> {
        let limit = limit as i64;
        let rows = match owner {
            Some(owner) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {SCAN_COLUMNS} FROM scans WHERE owner=? ORDER BY finished_at_ms DESC, seq DESC LIMIT ?"
                ))?;
                let rows = stmt.query_map(params![owner, limit], scan_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("SELECT {SCAN_COLUMNS} FROM scans ORDER BY finished_at_ms DESC, seq DESC LIMIT ?"))?;
                let rows = stmt.query_map([limit], scan_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }

    pub fn findings_for(&self, job_id: &JobId) -> Result<Vec<ArchivedFinding>> {
        let mut stmt = self.conn.prepare(
            "SELECT ordinal,title,severity,description,evidence FROM findings WHERE job_id=? ORDER BY ordinal",
        )?;
        let rows = stmt
            .query_map([job_id.to_string()], |r| {
                Ok(ArchivedFinding {
                    ordinal: r.get(0)?,
                    title: r.get(1)?,
                    severity: r.get(2)?,
                    description: r.get(3)?,
                    evidence: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The full job snapshot as it was archived.
    pub fn load_job(&self, job_id: &JobId) -> Result<Option<ScanJob>> {
        let json: Option<String> = self
            .conn
            .query_row("SELECT job_json FROM scans WHERE job_id=?", [job_id.to_string()], |r| r.get(0))
            .optional()?;
        Ok(match json {
            Some(j) => Some(serde_json::from_str(&j)?),
            None => None,
        })
    }
}

fn scan_row(r: &Row<'_>) -> rusqlite::Result<ArchivedScan> {
    Ok(ArchivedScan {
        job_id: r.get(0)?,
        owner: r.get(1)?,
        capability: r.get(2)?,
        target: r.get(3)?,
        state: r.get(4)?,
        status: r.get(5)?,
        finished_at_ms: r.get(6)?,
        exit_code: r.get(7)?,
        duration_ms: r.get(8)?,
        finding_count: r.get(9)?,
        top_severity: r.get(10)?,
        error_kind: r.get(11)?,
        error_message: r.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::Db;
    use engine_core::{ErrorKind, Finding, JobError, JobId, NewJob, ScanJob, ScanResult, ScanStatus, Severity};
    use std::time::Duration;

    fn job(owner: &str, seq: u64) -> ScanJob {
        let req = NewJob {
            capability: "port-scan".into(),
            target: "192.168.1.10".into(),
            owner: owner.into(),
            timeout: Duration::from_secs(60),
        };
        let mut job = ScanJob::new(JobId::new(), seq, req, 1_000 + seq as i64);
        job.mark_running(2_000 + seq as i64).unwrap();
        job
    }

    fn succeeded(owner: &str, seq: u64) -> ScanJob {
        let mut j = job(owner, seq);
        let mut r = ScanResult::new(ScanStatus::Success);
        r.exit_code = Some(0);
        r.findings = vec![
            Finding::new("Open port 23/tcp", Severity::High).with_evidence("tcp/23 open syn-ack"),
            Finding::new("Open port 80/tcp", Severity::Info).with_description("http nginx"),
        ];
        j.complete(r, 3_000 + seq as i64).unwrap();
        j
    }

    #[test]
    fn schema_is_created_once() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.table_exists("scans").unwrap());
        assert!(db.table_exists("findings").unwrap());
        assert!(!db.table_exists("runs").unwrap());
    }

    #[test]
    fn archive_and_query() {
        let mut db = Db::open_in_memory().unwrap();
        let ok = succeeded("alice", 1);
        let mut failed = job("alice", 2);
        failed.fail(JobError::new(ErrorKind::Timeout, "nmap did not finish").with_excerpt("Starting Nmap"), 9_000).unwrap();
        db.archive_job(&ok).unwrap();
        db.archive_job(&failed).unwrap();
        db.archive_job(&succeeded("bob", 3)).unwrap();

        let scans = db.recent_scans(Some("alice"), 10).unwrap();
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].job_id, failed.job_id.to_string());
        assert_eq!(scans[0].state, "timed_out");
        assert_eq!(scans[0].status, "failed");
        assert_eq!(scans[0].error_kind.as_deref(), Some("timeout"));
        assert_eq!(scans[1].finding_count, 2);
        assert_eq!(scans[1].top_severity.as_deref(), Some("high"));
        assert_eq!(db.recent_scans(None, 10).unwrap().len(), 3);
        assert_eq!(db.recent_scans(None, 1).unwrap().len(), 1);

        let findings = db.findings_for(&ok.job_id).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, "high");
        assert_eq!(findings[1].description, "http nginx");
        assert_eq!(db.load_job(&ok.job_id).unwrap(), Some(ok));
        assert_eq!(db.load_job(&JobId::new()).unwrap(), None);
    }

    #[test]
    fn re_archiving_replaces() {
        let mut db = Db::open_in_memory().unwrap();
        let j = succeeded("alice", 1);
        db.archive_job(&j).unwrap();
        db.archive_job(&j).unwrap();
        assert_eq!(db.recent_scans(None, 10).unwrap().len(), 1);
        assert_eq!(db.findings_for(&j.job_id).unwrap().len(), 2);
    }

    #[test]
    fn active_jobs_are_refused() {
        let mut db = Db::open_in_memory().unwrap();
        assert!(db.archive_job(&job("alice", 1)).is_err());
    }
}
