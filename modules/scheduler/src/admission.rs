//! Who runs next. Pure bookkeeping under the engine's admission lock:
//! FIFO within an owner, least recently served owner first across owners.

use engine_core::{EngineError, JobId, OwnerId};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tool_registry::Invocation;

/// A job that passed validation, waiting for or holding a slot.
#[derive(Debug, Clone)]
pub(crate) struct Ticket {
    pub job_id: JobId,
    pub owner: OwnerId,
    pub inv: Invocation,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct OwnerState {
    queue: VecDeque<(u64, Ticket)>,
    running: usize,
    /// Admission tick of the owner's last admitted job, 0 when never served.
    last_served: u64,
}

pub(crate) struct Admission {
    global_max: usize,
    per_owner_max: usize,
    max_queued: usize,
    owners: HashMap<OwnerId, OwnerState>,
    running: HashMap<JobId, CancellationToken>,
    queued: usize,
    tick: u64,
    enqueue_seq: u64,
}

impl Admission {
    pub fn new(global_max: usize, per_owner_max: usize, max_queued: usize) -> Self {
        Admission {
            global_max: global_max.max(1),
            per_owner_max: per_owner_max.max(1),
            max_queued,
            owners: HashMap::new(),
            running: HashMap::new(),
            queued: 0,
            tick: 0,
            enqueue_seq: 0,
        }
    }

    /// Whether a new job for `owner` would start right away.
    pub fn has_room(&self, owner: &str) -> bool {
        self.running.len() < self.global_max && self.owners.get(owner).map(|o| o.running).unwrap_or(0) < self.per_owner_max
    }

    /// Rejects a submission that could neither start nor wait.
    pub fn check_capacity(&self, owner: &str) -> Result<(), EngineError> {
        if self.has_room(owner) || self.queued < self.max_queued {
            return Ok(());
        }
        Err(EngineError::ResourceExhausted(format!("scan queue is full ({} waiting)", self.queued)))
    }

    /// Returns the ticket back when it may start now; otherwise queues it.
    pub fn submit(&mut self, ticket: Ticket) -> Option<Ticket> {
        if self.has_room(&ticket.owner) {
            self.start(&ticket);
            return Some(ticket);
        }
        self.enqueue_seq += 1;
        let seq = self.enqueue_seq;
        self.owners.entry(ticket.owner.clone()).or_default().queue.push_back((seq, ticket));
        self.queued += 1;
        None
    }

    /// Frees `job_id`'s slot and returns the jobs that may start now.
    pub fn release(&mut self, job_id: JobId, owner: &str) -> Vec<Ticket> {
        if self.running.remove(&job_id).is_some() {
            if let Some(o) = self.owners.get_mut(owner) {
                o.running = o.running.saturating_sub(1);
            }
        }
        self.forget_idle(owner);
        self.admit()
    }

    /// Removes a queued job; `None` when it is not queued.
    pub fn remove_queued(&mut self, job_id: JobId, owner: &str) -> Option<Ticket> {
        let o = self.owners.get_mut(owner)?;
        let pos = o.queue.iter().position(|(_, t)| t.job_id == job_id)?;
        let (_, ticket) = o.queue.remove(pos)?;
        self.queued -= 1;
        self.forget_idle(owner);
        Some(ticket)
    }

    pub fn running_token(&self, job_id: JobId) -> Option<&CancellationToken> {
        self.running.get(&job_id)
    }

    /// Empties every queue, for shutdown.
    pub fn drain_queued(&mut self) -> Vec<Ticket> {
        let mut out = Vec::with_capacity(self.queued);
        for o in self.owners.values_mut() {
            out.extend(o.queue.drain(..).map(|(_, t)| t));
        }
        self.queued = 0;
        self.owners.retain(|_, o| o.running > 0);
        out
    }

    pub fn running_tokens(&self) -> impl Iterator<Item = &CancellationToken> {
        self.running.values()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn running_for(&self, owner: &str) -> usize {
        self.owners.get(owner).map(|o| o.running).unwrap_or(0)
    }

    pub fn queued_count(&self) -> usize {
        self.queued
    }

    fn admit(&mut self) -> Vec<Ticket> {
        let mut out = Vec::new();
        while self.running.len() < self.global_max {
            let next = self
                .owners
                .iter()
                .filter(|(_, o)| o.running < self.per_owner_max)
                .filter_map(|(name, o)| o.queue.front().map(|(seq, _)| (o.last_served, *seq, name)))
                .min()
                .map(|(_, _, name)| name.clone());
            let Some(owner) = next else { break };
            let Some((_, ticket)) = self.owners.get_mut(&owner).and_then(|o| o.queue.pop_front()) else { break };
            self.queued -= 1;
            self.start(&ticket);
            out.push(ticket);
        }
        out
    }

    fn start(&mut self, ticket: &Ticket) {
        self.tick += 1;
        let o = self.owners.entry(ticket.owner.clone()).or_default();
        o.running += 1;
        o.last_served = self.tick;
        self.running.insert(ticket.job_id, ticket.cancel.clone());
    }

    fn forget_idle(&mut self, owner: &str) {
        if self.owners.get(owner).map(|o| o.running == 0 && o.queue.is_empty()).unwrap_or(false) {
            self.owners.remove(owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tool_registry::{OutputFormat, ToolSpec};

    fn ticket(owner: &str) -> Ticket {
        let spec = Arc::new(ToolSpec::new("noop", "true", &["{target}"], OutputFormat::Lines));
        Ticket {
            job_id: JobId::new(),
            owner: owner.to_string(),
            inv: Invocation { spec, target: "x".into(), args: vec!["x".into()] },
            timeout: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn starts_immediately_when_free() {
        let mut adm = Admission::new(2, 1, 10);
        assert!(adm.submit(ticket("a")).is_some());
        assert!(adm.submit(ticket("a")).is_none(), "per-owner bound");
        assert!(adm.submit(ticket("b")).is_some());
        assert!(adm.submit(ticket("c")).is_none(), "global bound");
        assert_eq!(adm.running_count(), 2);
        assert_eq!(adm.queued_count(), 2);
    }

    #[test]
    fn owners_alternate_under_one_slot() {
        let mut adm = Admission::new(1, 1, 10);
        let a: Vec<Ticket> = (0..3).map(|_| ticket("a")).collect();
        let b: Vec<Ticket> = (0..3).map(|_| ticket("b")).collect();
        let mut order = Vec::new();
        let mut current = None;
        for t in a.iter().chain(b.iter()) {
            if let Some(t) = adm.submit(t.clone()) {
                current = Some(t);
            }
        }
        while let Some(t) = current.take() {
            order.push(t.job_id);
            let next = adm.release(t.job_id, &t.owner);
            assert!(next.len() <= 1);
            current = next.into_iter().next();
        }
        let expected = vec![a[0].job_id, b[0].job_id, a[1].job_id, b[1].job_id, a[2].job_id, b[2].job_id];
        assert_eq!(order, expected);
        assert_eq!(adm.running_count(), 0);
        assert_eq!(adm.queued_count(), 0);
    }

    #[test]
    fn fifo_within_an_owner() {
        let mut adm = Admission::new(1, 1, 10);
        let first = adm.submit(ticket("a")).unwrap();
        let t1 = ticket("a");
        let t2 = ticket("a");
        adm.submit(t1.clone());
        adm.submit(t2.clone());
        assert_eq!(adm.release(first.job_id, "a")[0].job_id, t1.job_id);
        assert_eq!(adm.release(t1.job_id, "a")[0].job_id, t2.job_id);
    }

    #[test]
    fn queue_bound() {
        let mut adm = Admission::new(1, 1, 1);
        adm.submit(ticket("a"));
        assert!(adm.check_capacity("b").is_ok());
        adm.submit(ticket("b"));
        assert!(matches!(adm.check_capacity("c"), Err(EngineError::ResourceExhausted(_))));
    }

    #[test]
    fn removing_a_queued_job() {
        let mut adm = Admission::new(1, 1, 10);
        let running = adm.submit(ticket("a")).unwrap();
        let queued = ticket("a");
        adm.submit(queued.clone());
        assert!(adm.remove_queued(running.job_id, "a").is_none());
        assert_eq!(adm.remove_queued(queued.job_id, "a").unwrap().job_id, queued.job_id);
        assert_eq!(adm.queued_count(), 0);
        assert!(adm.release(running.job_id, "a").is_empty());
        assert!(adm.running_token(running.job_id).is_none());
    }

    #[test]
    fn release_fills_every_free_slot() {
        let mut adm = Admission::new(3, 3, 10);
        let held: Vec<Ticket> = (0..3).filter_map(|_| adm.submit(ticket("a"))).collect();
        assert_eq!(held.len(), 3);
        for _ in 0..2 {
            adm.submit(ticket("b"));
        }
        let next = adm.release(held[0].job_id, "a");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].owner, "b");
        assert_eq!(adm.running_for("b"), 1);
        assert!(adm.running_count() <= 3);
    }
}
