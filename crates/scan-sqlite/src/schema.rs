pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE scans (
  job_id            TEXT PRIMARY KEY,
  seq               INTEGER NOT NULL,
  owner             TEXT NOT NULL,
  capability        TEXT NOT NULL,
  target            TEXT NOT NULL,
  state             TEXT NOT NULL CHECK (state IN ('succeeded','failed','timed_out','cancelled')),
  status            TEXT NOT NULL CHECK (status IN ('success','partial','failed')),
  submitted_at_ms   INTEGER NOT NULL,
  started_at_ms     INTEGER,
  finished_at_ms    INTEGER NOT NULL,
  timeout_ms        INTEGER NOT NULL,
  exit_code         INTEGER,
  duration_ms       INTEGER,
  truncated         INTEGER NOT NULL CHECK (truncated IN (0,1)) DEFAULT 0,
  output_sha256     TEXT,
  finding_count     INTEGER NOT NULL DEFAULT 0,
  top_severity      TEXT,
  error_kind        TEXT,
  error_message     TEXT,
  raw_output_excerpt TEXT,
  job_json          TEXT NOT NULL
);

CREATE TABLE findings (
  finding_id        INTEGER PRIMARY KEY AUTOINCREMENT,
  job_id            TEXT NOT NULL REFERENCES scans(job_id) ON DELETE CASCADE,
  ordinal           INTEGER NOT NULL,
  title             TEXT NOT NULL,
  severity          TEXT NOT NULL CHECK (severity IN ('info','low','medium','high','critical')),
  description       TEXT NOT NULL,
  evidence          TEXT NOT NULL,
  UNIQUE (job_id, ordinal)
);

CREATE INDEX idx_scans_owner ON scans(owner, finished_at_ms);
CREATE INDEX idx_scans_capability ON scans(capability);
CREATE INDEX idx_findings_job ON findings(job_id);
CREATE INDEX idx_findings_severity ON findings(severity);

COMMIT;
"#
;
