//! Per-agent priority queues, the outstanding-job index, the dead-letter
//! queue, and a count of retired jobs. The retired jobs themselves live in
//! storage.
//!
//! At most one job per `(agent_type, entity_id)` is outstanding (queued or
//! running) at any time; that is what keeps two runs of the same agent on
//! the same entity from overlapping.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use cartograph_shared::{AgentType, EntityId, Job, JobId, JobStatus};

/// Queue ordering: priority (high first), then scheduled time, then id.
type QueueKey = (Reverse<u8>, DateTime<Utc>, JobId);

fn key_of(job: &Job) -> QueueKey {
    (Reverse(job.priority), job.scheduled_at, job.job_id)
}

#[derive(Debug, Default)]
pub struct JobQueues {
    queues: HashMap<AgentType, BTreeSet<QueueKey>>,
    /// Queued and running jobs.
    active: HashMap<JobId, Job>,
    outstanding: HashMap<(AgentType, EntityId), JobId>,
    dead: BTreeMap<JobId, Job>,
    retired: usize,
}

impl JobQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a queued job. Returns `false` (and drops the job) when one is
    /// already outstanding for the same agent and entity.
    pub fn enqueue(&mut self, mut job: Job) -> bool {
        let pair = (job.agent_type, job.entity_id.clone());
        if self.outstanding.contains_key(&pair) {
            return false;
        }
        job.status = JobStatus::Queued;
        self.outstanding.insert(pair, job.job_id);
        self.queues
            .entry(job.agent_type)
            .or_default()
            .insert(key_of(&job));
        self.active.insert(job.job_id, job);
        true
    }

    pub fn is_outstanding(&self, agent: AgentType, entity_id: &EntityId) -> bool {
        self.outstanding
            .contains_key(&(agent, entity_id.clone()))
    }

    /// Pop the highest-priority job that is ready at `now` and that `admit`
    /// accepts, and mark it running. Jobs `admit` rejects stay queued in
    /// place, so a job behind them can still go.
    pub fn next_ready(
        &mut self,
        agent: AgentType,
        now: DateTime<Utc>,
        mut admit: impl FnMut(&Job) -> bool,
    ) -> Option<Job> {
        let queue = self.queues.get_mut(&agent)?;
        let key = queue
            .iter()
            .find(|(_, _, id)| {
                self.active
                    .get(id)
                    .is_some_and(|job| job.not_before <= now && admit(job))
            })
            .cloned()?;
        queue.remove(&key);

        let job = self.active.get_mut(&key.2)?;
        job.status = JobStatus::Running;
        Some(job.clone())
    }

    /// Put a running job back in its queue with updated fields.
    pub fn requeue(&mut self, mut job: Job) {
        job.status = JobStatus::Queued;
        self.queues
            .entry(job.agent_type)
            .or_default()
            .insert(key_of(&job));
        self.active.insert(job.job_id, job);
    }

    /// Retire a succeeded or cancelled job.
    pub fn retire(&mut self, job: &Job) {
        self.forget(job);
        self.retired += 1;
    }

    pub fn dead_letter(&mut self, mut job: Job) {
        self.forget(&job);
        job.status = JobStatus::DeadLettered;
        self.dead.insert(job.job_id, job);
    }

    /// Take a job out of the dead-letter queue.
    pub fn take_dead(&mut self, job_id: &JobId) -> Option<Job> {
        self.dead.remove(job_id)
    }

    fn forget(&mut self, job: &Job) {
        if let Some(queue) = self.queues.get_mut(&job.agent_type) {
            queue.remove(&key_of(job));
            // The stored copy may carry an older schedule
            if let Some(stored) = self.active.get(&job.job_id) {
                queue.remove(&key_of(stored));
            }
        }
        self.active.remove(&job.job_id);
        let pair = (job.agent_type, job.entity_id.clone());
        if self.outstanding.get(&pair) == Some(&job.job_id) {
            self.outstanding.remove(&pair);
        }
    }

    /// Withdraw every queued job for an entity. Running jobs are left for
    /// their workers, which observe the entity's cancellation token.
    pub fn withdraw_entity(&mut self, entity_id: &EntityId) -> Vec<Job> {
        let queued: Vec<Job> = self
            .active
            .values()
            .filter(|j| &j.entity_id == entity_id && j.status == JobStatus::Queued)
            .cloned()
            .collect();
        for job in &queued {
            self.forget(job);
        }
        queued
    }

    pub fn get(&self, job_id: &JobId) -> Option<&Job> {
        self.active.get(job_id).or_else(|| self.dead.get(job_id))
    }

    /// Queued and running jobs for one agent.
    pub fn jobs_for(&self, agent: AgentType) -> Vec<Job> {
        self.active
            .values()
            .filter(|j| j.agent_type == agent)
            .cloned()
            .collect()
    }

    /// Queued jobs for one agent.
    pub fn depth(&self, agent: AgentType) -> usize {
        self.queues.get(&agent).map_or(0, BTreeSet::len)
    }

    pub fn running(&self) -> usize {
        self.active
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    pub fn running_for(&self, agent: AgentType) -> usize {
        self.active
            .values()
            .filter(|j| j.agent_type == agent && j.status == JobStatus::Running)
            .count()
    }

    /// Whether any job is queued (ready or not) or running.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Earliest `not_before` among queued jobs.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.active
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .map(|j| j.not_before)
            .min()
    }

    pub fn dead_letters(&self) -> Vec<Job> {
        self.dead.values().cloned().collect()
    }

    /// Whether a dead-lettered job for this pair is awaiting an operator.
    pub fn is_dead_lettered(&self, agent: AgentType, entity_id: &EntityId) -> bool {
        self.dead
            .values()
            .any(|j| j.agent_type == agent && &j.entity_id == entity_id)
    }

    pub fn dead_count(&self) -> usize {
        self.dead.len()
    }

    pub fn retired_count(&self) -> usize {
        self.retired
    }

    /// Count jobs retired by an earlier process.
    pub fn add_retired(&mut self, count: usize) {
        self.retired += count;
    }

    /// Load a persisted job into the right place. Running jobs come back
    /// queued, to be delivered again.
    pub fn restore(&mut self, job: Job) {
        match job.status {
            JobStatus::Queued | JobStatus::Running => {
                self.enqueue(job);
            }
            JobStatus::DeadLettered => {
                self.dead.insert(job.job_id, job);
            }
            JobStatus::Succeeded | JobStatus::Cancelled => self.retired += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(agent: AgentType, entity: &str, priority: u8, at: DateTime<Utc>) -> Job {
        Job::new(agent, EntityId::new(entity), priority, None, at)
    }

    #[test]
    fn dedups_outstanding_pairs() {
        let now = Utc::now();
        let mut q = JobQueues::new();
        assert!(q.enqueue(job(AgentType::SeoMetrics, "a.co.uk", 5, now)));
        assert!(!q.enqueue(job(AgentType::SeoMetrics, "a.co.uk", 9, now)));
        assert!(q.enqueue(job(AgentType::TechStack, "a.co.uk", 5, now)));
        assert_eq!(q.depth(AgentType::SeoMetrics), 1);

        // Still outstanding while running
        let running = q.next_ready(AgentType::SeoMetrics, now, |_| true).unwrap();
        assert!(!q.enqueue(job(AgentType::SeoMetrics, "a.co.uk", 5, now)));
        q.retire(&running);
        assert!(q.enqueue(job(AgentType::SeoMetrics, "a.co.uk", 5, now)));
    }

    #[test]
    fn priority_then_fifo() {
        let now = Utc::now();
        let mut q = JobQueues::new();
        q.enqueue(job(AgentType::SeoMetrics, "low.co.uk", 2, now));
        q.enqueue(job(AgentType::SeoMetrics, "first.co.uk", 7, now));
        q.enqueue(job(AgentType::SeoMetrics, "second.co.uk", 7, now + Duration::seconds(1)));

        let order: Vec<String> = std::iter::from_fn(|| {
            q.next_ready(AgentType::SeoMetrics, now + Duration::seconds(5), |_| true)
        })
        .map(|j| j.entity_id.to_string())
        .collect();
        assert_eq!(order, vec!["first.co.uk", "second.co.uk", "low.co.uk"]);
    }

    #[test]
    fn rejected_jobs_do_not_block_others() {
        let now = Utc::now();
        let mut q = JobQueues::new();
        let mut blocked = job(AgentType::SeoMetrics, "a.co.uk", 9, now);
        blocked.provider_id = Some("broken".into());
        q.enqueue(blocked);
        q.enqueue(job(AgentType::SeoMetrics, "b.co.uk", 1, now));

        let next = q
            .next_ready(AgentType::SeoMetrics, now, |j| {
                j.provider_id.as_deref() != Some("broken")
            })
            .unwrap();
        assert_eq!(next.entity_id.as_str(), "b.co.uk");
        assert_eq!(q.depth(AgentType::SeoMetrics), 1);
    }

    #[test]
    fn backoff_delays_readiness() {
        let now = Utc::now();
        let mut q = JobQueues::new();
        let mut j = job(AgentType::TechStack, "a.co.uk", 5, now);
        j.not_before = now + Duration::seconds(60);
        q.enqueue(j);
        assert!(q.next_ready(AgentType::TechStack, now, |_| true).is_none());
        assert_eq!(q.next_wakeup(), Some(now + Duration::seconds(60)));
        assert!(
            q.next_ready(AgentType::TechStack, now + Duration::seconds(60), |_| true)
                .is_some()
        );
    }

    #[test]
    fn dead_letter_leaves_active_set() {
        let now = Utc::now();
        let mut q = JobQueues::new();
        q.enqueue(job(AgentType::TechStack, "a.co.uk", 5, now));
        let j = q.next_ready(AgentType::TechStack, now, |_| true).unwrap();
        let id = j.job_id;
        q.dead_letter(j);

        assert!(q.is_idle());
        assert_eq!(q.dead_count(), 1);
        assert_eq!(q.get(&id).unwrap().status, JobStatus::DeadLettered);
        assert!(!q.is_outstanding(AgentType::TechStack, &EntityId::new("a.co.uk")));
        assert!(q.take_dead(&id).is_some());
        assert_eq!(q.dead_count(), 0);
    }

    #[test]
    fn withdraw_entity_only_takes_queued() {
        let now = Utc::now();
        let mut q = JobQueues::new();
        q.enqueue(job(AgentType::TechStack, "a.co.uk", 5, now));
        q.enqueue(job(AgentType::SeoMetrics, "a.co.uk", 5, now));
        q.enqueue(job(AgentType::SeoMetrics, "b.co.uk", 5, now));
        let running = q.next_ready(AgentType::TechStack, now, |_| true).unwrap();

        let withdrawn = q.withdraw_entity(&EntityId::new("a.co.uk"));
        assert_eq!(withdrawn.len(), 1);
        assert_eq!(withdrawn[0].agent_type, AgentType::SeoMetrics);
        assert_eq!(q.running(), 1);
        assert_eq!(q.get(&running.job_id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn retired_jobs_are_only_counted() {
        let now = Utc::now();
        let mut q = JobQueues::new();
        for i in 0..50 {
            q.enqueue(job(AgentType::TechStack, &format!("shop{i}.co.uk"), 5, now));
            let running = q.next_ready(AgentType::TechStack, now, |_| true).unwrap();
            q.retire(&running);
        }
        assert_eq!(q.retired_count(), 50);
        assert!(q.is_idle());

        q.add_retired(7);
        let mut done = job(AgentType::TechStack, "old.co.uk", 5, now);
        done.status = JobStatus::Cancelled;
        q.restore(done);
        assert_eq!(q.retired_count(), 58);
        assert_eq!(q.depth(AgentType::TechStack), 0);
    }

    #[test]
    fn restore_requeues_running_jobs() {
        let now = Utc::now();
        let mut q = JobQueues::new();
        let mut j = job(AgentType::TechStack, "a.co.uk", 5, now);
        j.status = JobStatus::Running;
        q.restore(j);
        assert_eq!(q.depth(AgentType::TechStack), 1);
        assert_eq!(q.running(), 0);
    }
}
