use engine_core::{JobId, ScanJob};
use scan_scheduler::JobEvent;
use scan_sqlite::Db;
use std::collections::HashSet;
use std::thread::JoinHandle;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Archives every terminal job seen on the event stream until the engine
/// goes away. When the stream lags, `backfill` lists the jobs it may have
/// skipped. Returns how many jobs were written.
pub fn spawn_writer<F>(mut db: Db, mut rx: broadcast::Receiver<JobEvent>, backfill: F) -> JoinHandle<usize>
where
    F: Fn() -> Vec<ScanJob> + Send + 'static,
{
    std::thread::spawn(move || {
        let mut done: HashSet<JobId> = HashSet::new();
        loop {
            match rx.blocking_recv() {
                Ok(ev) => {
                    archive(&mut db, &mut done, &ev.job);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "archive writer fell behind, recovering from the job list");
                    let recovered = backfill().iter().filter(|job| archive(&mut db, &mut done, job)).count();
                    info!(recovered, "archive backfill done");
                }
                Err(RecvError::Closed) => break,
            }
        }
        done.len()
    })
}

/// Writes a terminal job once; true when it was written now.
fn archive(db: &mut Db, done: &mut HashSet<JobId>, job: &ScanJob) -> bool {
    if !job.is_terminal() || done.contains(&job.job_id) {
        return false;
    }
    match db.archive_job(job) {
        Ok(()) => {
            done.insert(job.job_id);
            debug!(job_id = %job.job_id, state = %job.state, "archived");
            true
        }
        Err(e) => {
            warn!(job_id = %job.job_id, error = %e, "could not archive scan");
            false
        }
    }
}
