//! Job dispatch: pick a ready job, run its agent, merge the result, and
//! settle the job (retire, retry, requeue or dead-letter).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use cartograph_agents::{RunContext, RunnerSet, serp_intelligence_deltas};
use cartograph_providers::ProviderRegistry;
use cartograph_shared::{
    AgentError, AgentType, AppConfig, CartographError, ChangeRecord, Clock, Entity, EntityId,
    FactDelta, FactRecord, FailureNote, IdempotencyKey, Job, JobStatus, Result, groups,
};
use cartograph_storage::Storage;

use crate::change_detector::ChangeDetector;
use crate::entities::EntityRegistry;
use crate::health::PipelineHealth;
use crate::merger::FactMerger;
use crate::pipeline::ProgressReporter;
use crate::queue::JobQueues;
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, SchedulerConfig, TickReport};

/// How one dispatched job was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    Succeeded { applied: bool },
    Retrying { attempt: u32, not_before: DateTime<Utc> },
    /// Circuit open: back in the queue, no attempt consumed.
    Requeued,
    DeadLettered { reason: String },
    Cancelled,
}

impl Settled {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Retrying { .. } => "retrying",
            Self::Requeued => "requeued",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Cancelled => "cancelled",
        }
    }
}

pub struct Dispatcher {
    queues: Mutex<JobQueues>,
    scheduler: Scheduler,
    runners: RunnerSet,
    providers: ProviderRegistry,
    merger: FactMerger,
    detector: ChangeDetector,
    entities: EntityRegistry,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    storage: Option<Arc<Storage>>,
    progress: Arc<dyn ProgressReporter>,
}

impl Dispatcher {
    pub fn new(
        config: &AppConfig,
        providers: ProviderRegistry,
        runners: RunnerSet,
        clock: Arc<dyn Clock>,
        storage: Option<Arc<Storage>>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            queues: Mutex::new(JobQueues::new()),
            scheduler: Scheduler::new(SchedulerConfig::from(config)),
            runners,
            providers,
            merger: FactMerger::new(config.pipeline.applied_key_retention, storage.clone()),
            detector: ChangeDetector::new(
                config.change_detection.snapshot_retention,
                storage.clone(),
            ),
            entities: EntityRegistry::new(),
            retry: RetryPolicy::from(config),
            clock,
            storage,
            progress,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn with_queues<R>(&self, f: impl FnOnce(&mut JobQueues) -> R) -> R {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut queues)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn merger(&self) -> &FactMerger {
        &self.merger
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn storage(&self) -> Option<&Arc<Storage>> {
        self.storage.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn health(&self) -> PipelineHealth {
        let providers = self.providers.states();
        let entities = self.entities.len();
        self.with_queues(|q| PipelineHealth::collect(q, providers, entities))
    }

    // -----------------------------------------------------------------------
    // Persistence helpers
    // -----------------------------------------------------------------------

    pub(crate) async fn persist_job(&self, job: &Job) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.upsert_job(job).await?;
        }
        Ok(())
    }

    pub(crate) async fn persist_jobs(&self, jobs: &[Job]) -> Result<()> {
        for job in jobs {
            self.persist_job(job).await?;
        }
        Ok(())
    }

    async fn persist_provider(&self, provider_id: Option<&str>) -> Result<()> {
        let (Some(storage), Some(id)) = (&self.storage, provider_id) else {
            return Ok(());
        };
        if let Some(gateway) = self.providers.get(id) {
            storage
                .upsert_provider_state(&gateway.breaker().snapshot())
                .await?;
        }
        Ok(())
    }

    /// Register an entity. Returns `true` if it was new.
    pub async fn enroll(&self, entity: Entity) -> Result<bool> {
        if !self.entities.enroll(entity.clone()) {
            return Ok(false);
        }
        if let Some(storage) = &self.storage {
            storage.insert_entity(&entity).await?;
        }
        debug!(entity_id = %entity.entity_id, "entity enrolled");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// One scheduler tick over every live entity.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let entities = self.entities.active();
        let records: HashMap<EntityId, FactRecord> = self.merger.snapshot_all().await;
        let (report, jobs) =
            self.with_queues(|q| self.scheduler.tick(now, &entities, &records, q));
        self.persist_jobs(&jobs).await?;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Take the next ready job for `agent` and run it to a settlement.
    /// Returns `None` when nothing for this agent can go right now.
    ///
    /// Jobs whose provider circuit is open are skipped in place, so jobs for
    /// healthy providers behind them still dispatch.
    pub async fn dispatch_next(&self, agent: AgentType) -> Result<Option<(Job, Settled)>> {
        let now = self.clock.now();
        let job = self.with_queues(|q| {
            q.next_ready(agent, now, |job| {
                job.provider_id
                    .as_deref()
                    .is_none_or(|p| self.providers.allows_dispatch(p, now))
            })
        });
        let Some(job) = job else {
            return Ok(None);
        };
        self.persist_job(&job).await?;
        self.progress.job_started(&job);

        let (job, settled) = self.execute(job).await?;
        self.progress.job_settled(&job, &settled);
        Ok(Some((job, settled)))
    }

    #[instrument(skip_all, fields(job_id = %job.job_id, agent = %job.agent_type, entity_id = %job.entity_id, attempt = job.attempt_count))]
    async fn execute(&self, job: Job) -> Result<(Job, Settled)> {
        let Some(runner) = self.runners.get(job.agent_type) else {
            let err = AgentError::fatal(format!("no runner for {}", job.agent_type));
            return self.settle_failure(job, err).await;
        };

        let record = self
            .merger
            .get(&job.entity_id)
            .await
            .unwrap_or_else(|| FactRecord::new(job.entity_id.clone()));
        let pass = self.scheduler.pass_kind(Some(&record), self.clock.now());
        let prior = match job.agent_type {
            AgentType::ChangeTracking => self.detector.prior_snapshot(&job.entity_id),
            _ => None,
        };
        let ctx = RunContext {
            job_id: job.job_id,
            entity_id: job.entity_id.clone(),
            idempotency_key: job.idempotency_key.clone(),
            record,
            prior,
            pass,
            cancel: self.entities.token(&job.entity_id),
            clock: self.clock.clone(),
        };

        // Cancelled between dispatch and start
        if let Err(e) = ctx.check_cancelled() {
            return self.settle_failure(job, e).await;
        }

        match runner.run(&ctx).await {
            Ok(delta) => match self.merge(&job, &ctx, delta).await {
                Ok(applied) => self.settle_success(job, applied).await,
                Err(CartographError::Validation { message }) => {
                    self.settle_failure(job, AgentError::Fatal(message)).await
                }
                Err(e) => {
                    self.settle_failure(job, AgentError::Recoverable(e.to_string()))
                        .await
                }
            },
            Err(e) => self.settle_failure(job, e).await,
        }
    }

    /// Apply a successful run's delta, plus whatever the agent fans out.
    async fn merge(&self, job: &Job, ctx: &RunContext, delta: FactDelta) -> Result<bool> {
        if job.agent_type == AgentType::SerpDiscovery {
            let fanned = serp_intelligence_deltas(&delta, &job.job_id)
                .map_err(|e| CartographError::validation(e.to_string()))?;
            let now = self.clock.now();
            for sub in fanned {
                self.enroll(Entity::new(sub.entity_id.clone(), now)).await?;
                if !self.entities.is_active(&sub.entity_id) {
                    continue;
                }
                self.merger.apply(&sub).await?;
            }
        }

        let outcome = self.merger.apply(&delta).await?;
        if job.agent_type == AgentType::ChangeTracking {
            // Also on redelivery: the merge may have landed before the
            // history was written.
            self.track_change(&ctx.record, &outcome.record, &delta.idempotency_key)
                .await?;
        }
        Ok(outcome.applied)
    }

    /// Append the change record merged under `key` and snapshot `before`.
    /// The merged group, not the rerun's delta, is authoritative.
    async fn track_change(
        &self,
        before: &FactRecord,
        merged: &FactRecord,
        key: &IdempotencyKey,
    ) -> Result<()> {
        let Some(group) = merged
            .group(groups::CHANGE_TRACKING)
            .filter(|g| &g.idempotency_key == key)
        else {
            debug!(key = %key, "change-tracking group superseded");
            return Ok(());
        };

        let baseline = group.value.get("baseline").and_then(|v| v.as_bool()) == Some(true);
        if !baseline {
            let change: ChangeRecord =
                serde_json::from_value(group.value.clone()).map_err(|e| {
                    CartographError::validation(format!(
                        "change-tracking value is neither a baseline nor a change record: {e}"
                    ))
                })?;
            self.detector.append(key, change).await?;
        }
        self.detector.capture(before, group.updated_at).await
    }

    async fn settle_success(&self, mut job: Job, applied: bool) -> Result<(Job, Settled)> {
        let now = self.clock.now();
        job.record(now, "succeeded", None);
        job.status = JobStatus::Succeeded;
        self.with_queues(|q| q.retire(&job));
        self.persist_job(&job).await?;
        self.persist_provider(job.provider_id.as_deref()).await?;
        debug!(applied, "job succeeded");
        Ok((job, Settled::Succeeded { applied }))
    }

    async fn settle_failure(&self, mut job: Job, err: AgentError) -> Result<(Job, Settled)> {
        let now = self.clock.now();
        job.record(now, err.kind(), Some(err.to_string()));

        let settled = match &err {
            AgentError::Cancelled => {
                job.status = JobStatus::Cancelled;
                self.with_queues(|q| q.retire(&job));
                info!("job cancelled");
                Settled::Cancelled
            }
            AgentError::ProviderUnavailable { provider_id } => {
                debug!(provider = %provider_id, "circuit open, job requeued");
                job.status = JobStatus::Queued;
                self.with_queues(|q| q.requeue(job.clone()));
                Settled::Requeued
            }
            AgentError::Recoverable(_) => {
                let delay = self.retry.delay(job.attempt_count);
                job.attempt_count += 1;
                if self.retry.exhausted(job.attempt_count) {
                    self.dead_letter(&mut job, &err).await?
                } else {
                    job.not_before = now + delay;
                    job.status = JobStatus::Queued;
                    self.with_queues(|q| q.requeue(job.clone()));
                    debug!(
                        attempt = job.attempt_count,
                        delay_ms = delay.num_milliseconds(),
                        "job will retry"
                    );
                    Settled::Retrying {
                        attempt: job.attempt_count,
                        not_before: job.not_before,
                    }
                }
            }
            AgentError::Fatal(_) => {
                job.attempt_count += 1;
                self.dead_letter(&mut job, &err).await?
            }
        };

        self.persist_job(&job).await?;
        self.persist_provider(job.provider_id.as_deref()).await?;
        Ok((job, settled))
    }

    async fn dead_letter(&self, job: &mut Job, err: &AgentError) -> Result<Settled> {
        let reason = err.to_string();
        warn!(
            job_id = %job.job_id,
            agent = %job.agent_type,
            entity_id = %job.entity_id,
            attempts = job.attempt_count,
            reason = %reason,
            "job dead-lettered"
        );
        job.status = JobStatus::DeadLettered;
        self.with_queues(|q| q.dead_letter(job.clone()));
        self.merger
            .record_failure(
                &job.entity_id,
                FailureNote {
                    agent_type: job.agent_type,
                    job_id: job.job_id,
                    reason: reason.clone(),
                    at: self.clock.now(),
                },
            )
            .await?;
        Ok(Settled::DeadLettered { reason })
    }

    /// Dispatch ready jobs for every agent until none can go.
    pub async fn drain(&self) -> Result<usize> {
        let mut settled = 0;
        loop {
            let mut progressed = false;
            for agent in AgentType::ALL {
                while self.dispatch_next(agent).await?.is_some() {
                    settled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(settled);
            }
        }
    }
}
