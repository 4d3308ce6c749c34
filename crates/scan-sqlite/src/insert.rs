use crate::Db;
use anyhow::{bail, Result};
use engine_core::ScanJob;
use rusqlite::params;

impl Db {
    /// Writes a terminal job and its findings, replacing an earlier copy.
    pub fn archive_job(&mut self, job: &ScanJob) -> Result<()> {
        let Some(status) = job.status() else {
            bail!("job {} is still {}", job.job_id, job.state);
        };
        let finished_at = job.finished_at_ms.unwrap_or(job.submitted_at_ms);
        let job_id = job.job_id.to_string();
        let job_json = serde_json::to_string(job)?;
        let result = job.result.as_ref();
        let findings = result.map(|r| r.findings.as_slice()).unwrap_or(&[]);
        let top = result.and_then(|r| r.highest_severity()).map(|s| s.as_str());

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO scans(job_id,seq,owner,capability,target,state,status,submitted_at_ms,started_at_ms,finished_at_ms,timeout_ms,exit_code,duration_ms,truncated,output_sha256,finding_count,top_severity,error_kind,error_message,raw_output_excerpt,job_json)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
            params![
                job_id,
                job.seq as i64,
                job.owner,
                job.capability,
                job.target,
                job.state.as_str(),
                status.as_str(),
                job.submitted_at_ms,
                job.started_at_ms,
                finished_at,
                job.timeout_ms as i64,
                result.and_then(|r| r.exit_code),
                result.map(|r| r.duration_ms as i64),
                result.map(|r| r.truncated as i64).unwrap_or(0),
                result.map(|r| r.output_sha256.as_str()),
                findings.len() as i64,
                top,
                job.error.as_ref().map(|e| e.kind.as_str()),
                job.error.as_ref().map(|e| e.message.as_str()),
                result
                    .map(|r| r.raw_output_excerpt.as_str())
                    .or_else(|| job.error.as_ref().map(|e| e.output_excerpt.as_str())),
                job_json,
            ],
        )?;
        tx.execute("DELETE FROM findings WHERE job_id=?", [&job_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO findings(job_id,ordinal,title,severity,description,evidence) VALUES (?,?,?,?,?,?)",
            )?;
            for (i, f) in findings.iter().enumerate() {
                stmt.execute(params![job_id, i as i64, f.title, f.severity.as_str(), f.description, f.evidence])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
