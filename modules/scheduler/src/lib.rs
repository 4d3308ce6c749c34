//! The scan engine: validates requests, bounds how many tools run at once,
//! executes them on a fixed worker pool and records every job's lifecycle.
//!
//! ```text
//! submit -> Registry::prepare -> admission (run now | queue)
//!        -> worker -> ToolExecutor -> normalize -> SessionStore
//! ```
//!
//! Job state changes happen under the admission lock, so a job seen as
//! queued there is queued in the store too.

mod admission;
mod config;

pub use config::EngineConfig;

use admission::{Admission, Ticket};
use engine_core::ratelimiter::RateLimiter;
use engine_core::{now_ms, EngineError, ErrorKind, JobError, JobId, NewJob, ScanJob};
use process_runner::{ProcessRunner, ToolExecutor};
use result_normalizer::{normalize_for, Normalized};
use session_store::SessionStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tool_registry::{Registry, ToolSpec};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Overrides the capability's default timeout, capped by `max_timeout_secs`.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// The job was queued and is now cancelled.
    Cancelled,
    /// The job is running; it ends `Cancelled` once its process is reaped.
    Requested,
    AlreadyFinished,
}

/// Snapshot published on every state change.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: ScanJob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub running: usize,
    pub queued: usize,
    pub stored: usize,
}

struct Inner {
    registry: Registry,
    store: SessionStore,
    executor: Arc<dyn ToolExecutor>,
    admission: Mutex<Admission>,
    limiter: RateLimiter,
    events: broadcast::Sender<JobEvent>,
    work_tx: mpsc::UnboundedSender<Ticket>,
    idle: Notify,
    shutting_down: AtomicBool,
    stop: CancellationToken,
    max_timeout: Duration,
}

pub struct Engine {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Read-only handle that does not keep the engine alive. Reads come back
/// empty once the engine is gone.
#[derive(Clone)]
pub struct EngineView(Weak<Inner>);

impl EngineView {
    pub fn list(&self, owner: &str) -> Vec<ScanJob> {
        self.0.upgrade().map(|inner| inner.store.list_by_owner(owner)).unwrap_or_default()
    }
}

impl Engine {
    /// Engine executing real processes. Must be called inside a Tokio runtime.
    pub fn with_process_runner(registry: Registry, cfg: EngineConfig) -> Result<Self, EngineError> {
        let runner = ProcessRunner::new(cfg.runner_options());
        Self::new(registry, Arc::new(runner), cfg)
    }

    /// Must be called inside a Tokio runtime; spawns the worker pool and the sweeper.
    pub fn new(registry: Registry, executor: Arc<dyn ToolExecutor>, cfg: EngineConfig) -> Result<Self, EngineError> {
        cfg.validate().map_err(EngineError::Validation)?;
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            registry,
            store: SessionStore::new(cfg.store_config()),
            executor,
            admission: Mutex::new(Admission::new(cfg.global_max_concurrent, cfg.per_owner_max_concurrent, cfg.max_queued)),
            limiter: RateLimiter::per_minute(cfg.submissions_per_minute),
            events,
            work_tx,
            idle: Notify::new(),
            shutting_down: AtomicBool::new(false),
            stop: CancellationToken::new(),
            max_timeout: cfg.max_timeout(),
        });

        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let mut tasks = Vec::with_capacity(cfg.global_max_concurrent + 1);
        for worker_id in 0..cfg.global_max_concurrent {
            tasks.push(tokio::spawn(worker(inner.clone(), work_rx.clone(), worker_id)));
        }
        tasks.push(tokio::spawn(sweeper(inner.clone(), cfg.sweep_interval())));
        info!(
            workers = cfg.global_max_concurrent,
            per_owner = cfg.per_owner_max_concurrent,
            max_queued = cfg.max_queued,
            capabilities = inner.registry.len(),
            "scan engine started"
        );
        Ok(Engine { inner, tasks: Mutex::new(tasks) })
    }

    pub fn submit(&self, capability: &str, target: &str, owner: &str) -> Result<JobId, EngineError> {
        self.submit_with(capability, target, owner, SubmitOptions::default())
    }

    /// Validates and registers a job; it starts at once when a slot is free.
    /// Never waits for the tool.
    pub fn submit_with(&self, capability: &str, target: &str, owner: &str, opts: SubmitOptions) -> Result<JobId, EngineError> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        if owner.trim().is_empty() {
            return Err(EngineError::Validation("owner must not be empty".into()));
        }
        let inv = inner.registry.prepare(capability, target)?;
        let timeout = match opts.timeout {
            Some(t) if t.is_zero() => return Err(EngineError::Validation("timeout must be positive".into())),
            Some(t) => t,
            None => inv.spec.default_timeout(),
        }
        .min(inner.max_timeout);

        let mut adm = inner.admission();
        // shutdown sets the flag before it drains under this lock
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        adm.check_capacity(owner)?;
        if !inner.limiter.try_acquire(owner) {
            warn!(owner, "submission rate limit hit");
            return Err(EngineError::ResourceExhausted(format!("too many submissions from {owner}, retry later")));
        }
        let job_id = inner.store.create(NewJob {
            capability: capability.to_string(),
            target: target.to_string(),
            owner: owner.to_string(),
            timeout,
        });
        info!(%job_id, capability, target, owner, timeout_ms = timeout.as_millis() as u64, "scan submitted");
        if let Ok(job) = inner.store.get(job_id) {
            inner.publish(job);
        }
        let ticket = Ticket { job_id, owner: owner.to_string(), inv, timeout, cancel: CancellationToken::new() };
        match adm.submit(ticket) {
            Some(ready) => inner.dispatch(&mut adm, vec![ready]),
            None => debug!(%job_id, queued = adm.queued_count(), "scan queued"),
        }
        Ok(job_id)
    }

    pub fn status(&self, job_id: JobId) -> Result<ScanJob, EngineError> {
        self.inner.store.get(job_id)
    }

    pub fn list(&self, owner: &str) -> Vec<ScanJob> {
        self.inner.store.list_by_owner(owner)
    }

    pub fn cancel(&self, job_id: JobId, owner: &str) -> Result<CancelAck, EngineError> {
        let inner = &self.inner;
        let mut adm = inner.admission();
        let job = inner.store.get(job_id)?;
        if job.owner != owner {
            return Err(EngineError::NotOwner { job: job_id, owner: owner.to_string() });
        }
        if job.is_terminal() {
            return Ok(CancelAck::AlreadyFinished);
        }
        if let Some(ticket) = adm.remove_queued(job_id, owner) {
            ticket.cancel.cancel();
            let job = inner
                .store
                .update(job_id, |j| j.fail(JobError::new(ErrorKind::Cancelled, "cancelled before start"), now_ms()))?;
            info!(%job_id, owner, "queued scan cancelled");
            inner.publish(job);
            return Ok(CancelAck::Cancelled);
        }
        if let Some(token) = adm.running_token(job_id) {
            token.cancel();
            info!(%job_id, owner, "cancellation requested for running scan");
            return Ok(CancelAck::Requested);
        }
        Ok(CancelAck::AlreadyFinished)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribers that fall behind use this to recover the jobs they missed
    /// without holding the event sender open.
    pub fn view(&self) -> EngineView {
        EngineView(Arc::downgrade(&self.inner))
    }

    /// Resolves with the job's terminal snapshot.
    pub async fn wait(&self, job_id: JobId) -> Result<ScanJob, EngineError> {
        let mut rx = self.subscribe();
        loop {
            let job = self.status(job_id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            loop {
                match rx.recv().await {
                    Ok(ev) if ev.job.job_id == job_id && ev.job.is_terminal() => return Ok(ev.job),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%job_id, skipped, "event subscriber lagged, re-reading store");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(EngineError::ShuttingDown),
                }
            }
        }
    }

    pub fn capabilities(&self) -> Vec<&ToolSpec> {
        self.inner.registry.capabilities().collect()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn stats(&self) -> EngineStats {
        let (running, queued) = {
            let adm = self.inner.admission();
            (adm.running_count(), adm.queued_count())
        };
        EngineStats { running, queued, stored: self.inner.store.len() }
    }

    /// Rejects new submissions, cancels queued and running jobs and waits
    /// until every tool process has been reaped.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut adm = inner.admission();
            for ticket in adm.drain_queued() {
                match inner
                    .store
                    .update(ticket.job_id, |j| j.fail(JobError::new(ErrorKind::Cancelled, "engine shutting down"), now_ms()))
                {
                    Ok(job) => inner.publish(job),
                    Err(e) => warn!(job_id = %ticket.job_id, error = %e, "could not cancel queued job"),
                }
            }
            for token in adm.running_tokens() {
                token.cancel();
            }
        }
        loop {
            let idle = inner.idle.notified();
            let running = inner.admission().running_count();
            if running == 0 {
                break;
            }
            debug!(running, "waiting for running scans to stop");
            idle.await;
        }
        inner.stop.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!("scan engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for token in self.inner.admission().running_tokens() {
            token.cancel();
        }
        self.inner.stop.cancel();
    }
}

impl Inner {
    fn admission(&self) -> MutexGuard<'_, Admission> {
        self.admission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, job: ScanJob) {
        // no subscribers is fine
        let _ = self.events.send(JobEvent { job });
    }

    /// Marks admitted jobs running and hands them to the pool. Called with
    /// the admission lock held.
    fn dispatch(&self, adm: &mut Admission, ready: Vec<Ticket>) {
        let mut ready: VecDeque<Ticket> = ready.into();
        while let Some(ticket) = ready.pop_front() {
            let job_id = ticket.job_id;
            let job = match self.store.update(job_id, |j| j.mark_running(now_ms())) {
                Ok(job) => job,
                Err(e) => {
                    warn!(%job_id, error = %e, "admitted job could not start");
                    ready.extend(adm.release(job_id, &ticket.owner));
                    continue;
                }
            };
            debug!(%job_id, owner = %ticket.owner, running = adm.running_count(), "scan admitted");
            self.publish(job);
            if let Err(mpsc::error::SendError(ticket)) = self.work_tx.send(ticket) {
                warn!(%job_id, "worker pool gone, cancelling job");
                if let Ok(job) = self.store.update(job_id, |j| j.fail(JobError::new(ErrorKind::Cancelled, "engine stopped"), now_ms())) {
                    self.publish(job);
                }
                ready.extend(adm.release(job_id, &ticket.owner));
            }
        }
        if adm.running_count() == 0 {
            self.idle.notify_waiters();
        }
    }

    async fn run(&self, ticket: Ticket) {
        let Ticket { job_id, owner, inv, timeout, cancel } = ticket;
        let executor = self.executor.clone();
        let exec = tokio::spawn(async move {
            match executor.execute(&inv, timeout, &cancel).await {
                Ok(outcome) => normalize_for(&inv.spec, &inv.target, &outcome),
                Err(e) => Normalized::Error(JobError::new(ErrorKind::ToolExecutionFailed, e.to_string())),
            }
        });
        let normalized = match exec.await {
            Ok(n) => n,
            Err(e) => {
                error!(%job_id, error = %e, "scan execution panicked");
                Normalized::Error(JobError::new(ErrorKind::ToolExecutionFailed, format!("execution aborted: {e}")))
            }
        };
        self.finish(job_id, &owner, normalized);
    }

    fn finish(&self, job_id: JobId, owner: &str, normalized: Normalized) {
        let now = now_ms();
        let mut adm = self.admission();
        let updated = self.store.update(job_id, move |j| match normalized {
            Normalized::Result(r) => j.complete(r, now),
            Normalized::Error(e) => j.fail(e, now),
        });
        match updated {
            Ok(job) => {
                info!(
                    %job_id,
                    capability = %job.capability,
                    owner,
                    state = %job.state,
                    exit_code = ?job.result.as_ref().and_then(|r| r.exit_code),
                    duration_ms = job.result.as_ref().map(|r| r.duration_ms),
                    findings = job.result.as_ref().map(|r| r.findings.len()).unwrap_or(0),
                    "scan finished"
                );
                self.publish(job);
            }
            Err(e) => warn!(%job_id, error = %e, "could not record scan outcome"),
        }
        let next = adm.release(job_id, owner);
        self.dispatch(&mut adm, next);
    }
}

async fn worker(inner: Arc<Inner>, rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Ticket>>>, worker_id: usize) {
    loop {
        let ticket = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = inner.stop.cancelled() => break,
                t = rx.recv() => match t {
                    Some(t) => t,
                    None => break,
                },
            }
        };
        debug!(worker_id, job_id = %ticket.job_id, "worker picked up scan");
        inner.run(ticket).await;
    }
    debug!(worker_id, "worker stopped");
}

async fn sweeper(inner: Arc<Inner>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            _ = tick.tick() => {
                let removed = inner.store.sweep_expired(now_ms());
                inner.limiter.prune();
                if removed > 0 {
                    debug!(removed, "expired scan jobs swept");
                }
            }
        }
    }
}
