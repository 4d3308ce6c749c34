//! In-memory record of scan jobs.
//!
//! The map sits behind an `RwLock`; every job has its own `Mutex`, so
//! updating one job never blocks readers of another. Callers that also hold
//! the scheduler's admission lock take it first.

use engine_core::{now_ms, EngineError, JobId, NewJob, ScanJob};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Soft bound on stored jobs; only terminal jobs are evicted to meet it.
    pub capacity: usize,
    /// Terminal jobs older than this are dropped by [`SessionStore::sweep_expired`].
    pub retention: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig { capacity: 1024, retention: Duration::from_secs(3600) }
    }
}

type Slot = Arc<Mutex<ScanJob>>;

pub struct SessionStore {
    jobs: RwLock<HashMap<JobId, Slot>>,
    next_seq: AtomicU64,
    cfg: StoreConfig,
}

impl SessionStore {
    pub fn new(cfg: StoreConfig) -> Self {
        SessionStore { jobs: RwLock::new(HashMap::new()), next_seq: AtomicU64::new(1), cfg }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    /// Registers a queued job and returns its id.
    pub fn create(&self, req: NewJob) -> JobId {
        let now = now_ms();
        let job_id = JobId::new();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let job = ScanJob::new(job_id, seq, req, now);
        debug!(%job_id, seq, capability = %job.capability, owner = %job.owner, "job created");
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.insert(job_id, Arc::new(Mutex::new(job)));
        let expired = remove_expired(&mut jobs, now, self.cfg.retention);
        let evicted = evict(&mut jobs, self.cfg.capacity);
        if expired + evicted > 0 {
            debug!(expired, evicted, remaining = jobs.len(), "store trimmed");
        }
        job_id
    }

    /// Snapshot of one job.
    pub fn get(&self, job_id: JobId) -> Result<ScanJob, EngineError> {
        let slot = self.slot(job_id)?;
        let job = lock(&slot);
        Ok(job.clone())
    }

    /// Snapshots of `owner`'s jobs in submission order.
    pub fn list_by_owner(&self, owner: &str) -> Vec<ScanJob> {
        let slots: Vec<Slot> = self.jobs.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        let mut out: Vec<ScanJob> = slots
            .iter()
            .filter_map(|s| {
                let job = lock(s);
                (job.owner == owner).then(|| job.clone())
            })
            .collect();
        out.sort_by_key(|j| j.seq);
        out
    }

    /// Applies `f` under the job's lock and returns the resulting snapshot.
    /// When `f` fails the job is left as it was.
    pub fn update<F>(&self, job_id: JobId, f: F) -> Result<ScanJob, EngineError>
    where
        F: FnOnce(&mut ScanJob) -> Result<(), EngineError>,
    {
        let slot = self.slot(job_id)?;
        let mut job = lock(&slot);
        let mut next = job.clone();
        f(&mut next)?;
        *job = next;
        Ok(job.clone())
    }

    /// Drops terminal jobs that finished more than `retention` before `now_ms`.
    pub fn sweep_expired(&self, now_ms: i64) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        remove_expired(&mut jobs, now_ms, self.cfg.retention)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of jobs that are not terminal yet.
    pub fn active(&self) -> Vec<JobId> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.iter().filter(|(_, s)| !lock(s).is_terminal()).map(|(id, _)| *id).collect()
    }

    fn slot(&self, job_id: JobId) -> Result<Slot, EngineError> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
            .ok_or(EngineError::JobNotFound(job_id))
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

fn lock(slot: &Slot) -> MutexGuard<'_, ScanJob> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_expired(jobs: &mut HashMap<JobId, Slot>, now_ms: i64, retention: Duration) -> usize {
    let cutoff = now_ms - retention.as_millis() as i64;
    let before = jobs.len();
    jobs.retain(|_, s| {
        let job = lock(s);
        !(job.is_terminal() && job.finished_at_ms.map(|t| t < cutoff).unwrap_or(false))
    });
    before - jobs.len()
}

fn evict(jobs: &mut HashMap<JobId, Slot>, capacity: usize) -> usize {
    if jobs.len() <= capacity {
        return 0;
    }
    let mut finished: Vec<(i64, u64, JobId)> = jobs
        .iter()
        .filter_map(|(id, s)| {
            let job = lock(s);
            job.is_terminal().then(|| (job.finished_at_ms.unwrap_or(job.submitted_at_ms), job.seq, *id))
        })
        .collect();
    finished.sort_unstable();
    let excess = jobs.len() - capacity;
    let mut removed = 0;
    for (_, _, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
        removed += 1;
    }
    if jobs.len() > capacity {
        warn!(len = jobs.len(), capacity, "store over capacity with only active jobs left");
    }
    removed
}
