//! The pipeline orchestrator.
//!
//! [`Orchestrator`] owns the scheduler, queues, merger and change detector
//! for one process lifetime and is the surface the CLI (or any other
//! collaborator) talks to: enrol entities, submit work, read facts and
//! history, inspect health and the dead-letter queue, and run the worker
//! pools.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use cartograph_agents::RunnerSet;
use cartograph_providers::ProviderRegistry;
use cartograph_shared::{
    AgentType, AppConfig, Cadence, CartographError, ChangeRecord, Clock, Entity, EntityId,
    EntityKind, FactRecord, Job, JobId, JobStatus, Result, SystemClock, TimeRange,
};
use cartograph_storage::Storage;

use crate::dispatcher::{Dispatcher, Settled};
use crate::health::PipelineHealth;
use crate::scheduler::TickReport;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Trait for reporting pipeline progress (CLI spinners, logs, etc.).
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a worker picks up a job.
    fn job_started(&self, job: &Job);
    /// Called when a job has been settled.
    fn job_settled(&self, job: &Job, settled: &Settled);
    /// Called after each scheduler tick.
    fn ticked(&self, report: &TickReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn job_started(&self, _job: &Job) {}
    fn job_settled(&self, _job: &Job, _settled: &Settled) {}
    fn ticked(&self, _report: &TickReport) {}
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of `submit_for_enrichment`, per agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub accepted: Vec<AgentType>,
    /// Already queued or running; nothing new was enqueued.
    pub already_queued: Vec<AgentType>,
    /// Held until classification says the entity qualifies.
    pub gated: Vec<AgentType>,
}

/// What `restore` loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub entities: usize,
    pub fact_records: usize,
    pub jobs: usize,
    pub providers: usize,
    pub change_records: usize,
    pub snapshots: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: AppConfig,
    dispatcher: Arc<Dispatcher>,
    progress: Arc<dyn ProgressReporter>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        providers: ProviderRegistry,
        runners: RunnerSet,
        clock: Arc<dyn Clock>,
        storage: Option<Arc<Storage>>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            &config,
            providers,
            runners,
            clock,
            storage,
            progress.clone(),
        );
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            progress,
        }
    }

    /// Wire providers and runners from configuration, on wall-clock time.
    pub fn from_config(
        config: AppConfig,
        storage: Option<Arc<Storage>>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let providers = ProviderRegistry::build_from_config(&config, clock.clone())?;
        let runners = RunnerSet::from_config(&config, &providers)?;
        Ok(Self::new(config, providers, runners, clock, storage, progress))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // -----------------------------------------------------------------------
    // Entities and submissions
    // -----------------------------------------------------------------------

    /// Register entities from a feed. Repeats are no-ops. Returns how many
    /// were new.
    #[instrument(skip_all)]
    pub async fn enroll(&self, feed: impl IntoIterator<Item = Entity>) -> Result<usize> {
        let mut added = 0;
        for entity in feed {
            if entity.entity_id.as_str().is_empty() {
                return Err(CartographError::validation("empty entity id in feed"));
            }
            if self.dispatcher.enroll(entity).await? {
                added += 1;
            }
        }
        if added > 0 {
            info!(added, "entities enrolled");
        }
        Ok(added)
    }

    /// Enrol the keyword batch entities the keyword miner rotates through.
    pub async fn enroll_keyword_batches(&self) -> Result<usize> {
        let now = self.dispatcher.now();
        let batches = self.dispatcher.scheduler().keyword_batch_entities(now);
        self.enroll(batches).await
    }

    /// Agents that start work on an entity by themselves, as opposed to
    /// following an upstream agent or the change-detection passes.
    fn is_entry_agent(&self, agent: AgentType) -> bool {
        !matches!(
            self.config.agents.get(agent).cadence,
            Cadence::AfterAgent { .. } | Cadence::MonthlyWithSampling
        )
    }

    /// Queue work for an entity now, outside its cadence.
    ///
    /// `agents` defaults to the entry agents for the entity's kind; the
    /// rest follow on later ticks.
    /// Agents with a job already outstanding are reported, not re-queued.
    /// Metrics agents stay gated until the entity qualifies.
    #[instrument(skip_all, fields(entity_id = %entity_id))]
    pub async fn submit_for_enrichment(
        &self,
        entity_id: &EntityId,
        agents: Option<&[AgentType]>,
    ) -> Result<Submission> {
        if entity_id.kind() == EntityKind::Domain && !entity_id.is_valid_domain() {
            return Err(CartographError::validation(format!(
                "'{entity_id}' is not a domain name"
            )));
        }
        let now = self.dispatcher.now();
        self.dispatcher
            .enroll(Entity::new(entity_id.clone(), now))
            .await?;
        if !self.dispatcher.entities().is_active(entity_id) {
            return Err(CartographError::not_found(entity_id.as_str()));
        }

        let kind = entity_id.kind();
        let wanted: Vec<AgentType> = match agents {
            Some(list) => {
                if let Some(bad) = list.iter().find(|a| a.entity_kind() != kind) {
                    return Err(CartographError::validation(format!(
                        "{bad} does not run on {entity_id}"
                    )));
                }
                list.to_vec()
            }
            None => AgentType::ALL
                .into_iter()
                .filter(|a| a.entity_kind() == kind && self.is_entry_agent(*a))
                .collect(),
        };

        let qualifies = self
            .dispatcher
            .merger()
            .get(entity_id)
            .await
            .and_then(|r| r.qualifies());

        let mut submission = Submission::default();
        let mut jobs = Vec::new();
        for agent in wanted {
            if agent.requires_qualification() && qualifies != Some(true) {
                submission.gated.push(agent);
                continue;
            }
            let job = self.dispatcher.scheduler().submission(agent, entity_id, now);
            if self.dispatcher.with_queues(|q| q.enqueue(job.clone())) {
                submission.accepted.push(agent);
                jobs.push(job);
            } else {
                submission.already_queued.push(agent);
            }
        }
        self.dispatcher.persist_jobs(&jobs).await?;
        debug!(?submission, "submission handled");
        Ok(submission)
    }

    /// Delete an entity: queued jobs are retired as cancelled, and running
    /// jobs see the cancellation through their token. Returns how many
    /// queued jobs were withdrawn.
    #[instrument(skip_all, fields(entity_id = %entity_id))]
    pub async fn cancel_entity(&self, entity_id: &EntityId) -> Result<usize> {
        if !self.dispatcher.entities().delete(entity_id) {
            return Err(CartographError::not_found(entity_id.as_str()));
        }
        let now = self.dispatcher.now();
        let withdrawn = self.dispatcher.with_queues(|q| {
            q.withdraw_entity(entity_id)
                .into_iter()
                .map(|mut job| {
                    job.record(now, "cancelled", Some("entity deleted".into()));
                    job.status = JobStatus::Cancelled;
                    q.retire(&job);
                    job
                })
                .collect::<Vec<_>>()
        });
        self.dispatcher.persist_jobs(&withdrawn).await?;
        if let Some(storage) = self.dispatcher.storage() {
            storage.mark_entity_deleted(entity_id).await?;
        }
        info!(withdrawn = withdrawn.len(), "entity cancelled");
        Ok(withdrawn.len())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_current_fact_record(&self, entity_id: &EntityId) -> Result<FactRecord> {
        self.dispatcher
            .merger()
            .get(entity_id)
            .await
            .ok_or_else(|| CartographError::not_found(entity_id.as_str()))
    }

    pub fn get_change_history(&self, entity_id: &EntityId, range: TimeRange) -> Vec<ChangeRecord> {
        self.dispatcher.detector().history(entity_id, range)
    }

    pub fn get_pipeline_health(&self) -> PipelineHealth {
        self.dispatcher.health()
    }

    /// Dead-lettered jobs, with their full attempt history.
    pub fn dead_letters(&self) -> Vec<Job> {
        self.dispatcher.with_queues(|q| q.dead_letters())
    }

    /// Put a dead-lettered job back in its queue with a fresh attempt count.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn replay_dead_letter(&self, job_id: &JobId) -> Result<Job> {
        let now = self.dispatcher.now();
        let replayed = self.dispatcher.with_queues(|q| {
            let mut job = q
                .take_dead(job_id)
                .ok_or_else(|| CartographError::not_found(job_id.to_string()))?;
            if q.is_outstanding(job.agent_type, &job.entity_id) {
                q.dead_letter(job);
                return Err(CartographError::validation(format!(
                    "a job for this agent and entity is already outstanding; {job_id} stays dead-lettered"
                )));
            }
            job.attempt_count = 0;
            job.not_before = now;
            job.record(now, "replayed", None);
            q.enqueue(job.clone());
            job.status = JobStatus::Queued;
            Ok(job)
        })?;
        self.dispatcher.persist_job(&replayed).await?;
        info!(agent = %replayed.agent_type, entity_id = %replayed.entity_id, "dead letter replayed");
        Ok(replayed)
    }

    // -----------------------------------------------------------------------
    // Driving the pipeline
    // -----------------------------------------------------------------------

    /// One scheduler tick.
    pub async fn tick(&self) -> Result<TickReport> {
        let report = self.dispatcher.tick().await?;
        self.progress.ticked(&report);
        Ok(report)
    }

    /// Settle every ready job, one at a time, until nothing is ready.
    pub async fn drain(&self) -> Result<usize> {
        self.progress.phase("draining");
        self.dispatcher.drain().await
    }

    /// Run worker pools and the tick loop until `shutdown` fires.
    ///
    /// Each agent gets `workers` tasks pulling from its queue. A job
    /// interrupted by shutdown stays `running` in storage and is delivered
    /// again after `restore`.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let idle = Duration::from_millis(self.config.pipeline.idle_poll_ms.max(1));
        let mut workers = JoinSet::new();
        for agent in AgentType::ALL {
            let count = self.config.agents.get(agent).workers.max(1);
            for worker in 0..count {
                workers.spawn(work(
                    self.dispatcher.clone(),
                    agent,
                    worker,
                    idle,
                    shutdown.clone(),
                ));
            }
        }
        info!(workers = workers.len(), "pipeline running");
        self.progress.phase("running");

        let period = Duration::from_secs(self.config.pipeline.tick_interval_secs.max(1));
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
            }
        }
        info!("pipeline stopped");
        Ok(())
    }

    /// Rebuild in-memory state from the attached storage. Jobs that were
    /// running when the last process stopped are queued again; deleted
    /// entities come back deleted.
    #[instrument(skip_all)]
    pub async fn restore(&self) -> Result<RestoreReport> {
        let Some(storage) = self.dispatcher.storage().cloned() else {
            return Ok(RestoreReport::default());
        };
        let mut report = RestoreReport::default();

        let entities = storage.list_entities().await?;
        for entity in &entities {
            if self.dispatcher.entities().enroll(entity.clone()) {
                report.entities += 1;
            }
        }
        for entity in storage.list_deleted_entities().await? {
            let id = entity.entity_id.clone();
            self.dispatcher.entities().enroll(entity);
            self.dispatcher.entities().delete(&id);
        }

        let records = storage.list_fact_records().await?;
        report.fact_records = records.len();
        self.dispatcher.merger().restore(records)?;

        let jobs = storage.list_pending_jobs().await?;
        let retired = storage.count_retired_jobs().await?;
        report.jobs = jobs.len();
        self.dispatcher.with_queues(|q| {
            for job in jobs {
                q.restore(job);
            }
            q.add_retired(retired);
        });

        let states = storage.list_provider_states().await?;
        report.providers = states.len();
        self.dispatcher.providers().restore(&states);

        for entity in &entities {
            let history = storage
                .list_change_records(&entity.entity_id, TimeRange::all())
                .await?;
            report.change_records += history.len();
            self.dispatcher.detector().restore(history);

            let snapshots = storage.list_snapshots(&entity.entity_id).await?;
            report.snapshots += snapshots.len();
            self.dispatcher
                .detector()
                .restore_snapshots(&entity.entity_id, snapshots);
        }

        info!(?report, "state restored");
        Ok(report)
    }
}

/// One worker: dispatch jobs for `agent` until shutdown, idling briefly
/// when its queue has nothing ready.
async fn work(
    dispatcher: Arc<Dispatcher>,
    agent: AgentType,
    worker: u32,
    idle: Duration,
    shutdown: CancellationToken,
) {
    debug!(agent = %agent, worker, "worker started");
    loop {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = dispatcher.dispatch_next(agent) => outcome,
        };
        match outcome {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!(agent = %agent, error = %e, "dispatch failed"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(idle) => {}
        }
    }
    debug!(agent = %agent, worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cartograph_agents::{AgentRunner, RunContext};
    use cartograph_providers::{FixtureProvider, ProviderError, ProviderGateway};
    use cartograph_shared::{
        AgentError, CircuitState, FactDelta, IdempotencyKey, ManualClock, ProviderEntry, groups,
    };
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    struct Harness {
        orch: Orchestrator,
        clock: Arc<ManualClock>,
        fixtures: HashMap<&'static str, Arc<FixtureProvider>>,
    }

    impl Harness {
        fn fixture(&self, id: &str) -> &FixtureProvider {
            &self.fixtures[id]
        }
    }

    /// Default configuration over demo fixtures, on a manual clock, with
    /// `extra` runners replacing the configured ones.
    fn harness(extra: Vec<Arc<dyn AgentRunner>>, storage: Option<Arc<Storage>>) -> Harness {
        let config = AppConfig::default();
        let clock = Arc::new(ManualClock::new(t0()));
        let mut registry = ProviderRegistry::new();
        let mut fixtures = HashMap::new();
        for id in ["serp", "page_fetch", "backlinks", "authority", "tech"] {
            let fixture = Arc::new(FixtureProvider::demo(id));
            let mut entry = ProviderEntry::fixture(id);
            entry.timeout_secs = 2;
            entry.poll_interval_ms = 1;
            registry.insert(ProviderGateway::new(
                fixture.clone(),
                &entry,
                &config.breaker,
                clock.clone(),
            ));
            fixtures.insert(id, fixture);
        }
        let mut runners = RunnerSet::from_config(&config, &registry).unwrap();
        for runner in extra {
            runners.insert(runner);
        }
        let orch = Orchestrator::new(
            config,
            registry,
            runners,
            clock.clone(),
            storage,
            Arc::new(SilentProgress),
        );
        Harness {
            orch,
            clock,
            fixtures,
        }
    }

    /// Classifier stand-in with a fixed verdict.
    struct Verdict {
        qualifies: bool,
        confidence: f64,
        evidence: Vec<&'static str>,
        fail_first: Mutex<Option<AgentError>>,
    }

    impl Verdict {
        fn qualifying() -> Arc<Self> {
            Arc::new(Self {
                qualifies: true,
                confidence: 1.0,
                evidence: Vec::new(),
                fail_first: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl AgentRunner for Verdict {
        fn agent_type(&self) -> AgentType {
            AgentType::DomainClassifier
        }

        async fn run(&self, ctx: &RunContext) -> std::result::Result<FactDelta, AgentError> {
            if let Some(err) = self.fail_first.lock().unwrap().take() {
                return Err(err);
            }
            Ok(ctx.delta(
                AgentType::DomainClassifier,
                json!({"qualifies": self.qualifies}),
                self.confidence,
                self.evidence.iter().map(|e| e.to_string()).collect(),
            ))
        }
    }

    fn domain(name: &str) -> EntityId {
        EntityId::new(name)
    }

    #[tokio::test]
    async fn discovery_to_intent_end_to_end() {
        let h = harness(Vec::new(), None);
        assert_eq!(h.orch.enroll_keyword_batches().await.unwrap(), 7);

        // mine -> discover -> classify -> metrics/tech/baseline -> intent
        for _ in 0..5 {
            h.orch.tick().await.unwrap();
            h.orch.drain().await.unwrap();
        }

        let batch = h
            .orch
            .get_current_fact_record(&EntityId::keyword_batch(3))
            .await
            .unwrap();
        assert!(batch.group(groups::KEYWORD_SET).is_some());
        assert!(batch.group(groups::DISCOVERY).is_some());

        let record = h
            .orch
            .get_current_fact_record(&domain("example.co.uk"))
            .await
            .unwrap();
        for group in [
            groups::SERP_INTELLIGENCE,
            groups::CLASSIFICATION,
            groups::SEO_METRICS,
            groups::TECHNICAL_LAYER,
            groups::INTENT_LAYER,
            groups::CHANGE_TRACKING,
        ] {
            assert!(record.group(group).is_some(), "missing {group}");
        }
        assert_eq!(record.qualifies(), Some(true));
        assert!(
            h.orch
                .get_current_fact_record(&domain("amazon.co.uk"))
                .await
                .is_err()
        );
        assert!(h.orch.get_pipeline_health().dead_letters == 0);
    }

    #[tokio::test]
    async fn non_qualifying_entity_never_reaches_paid_agents() {
        let classifier = Arc::new(Verdict {
            qualifies: false,
            confidence: 0.9,
            evidence: vec!["no checkout path found", "no product schema"],
            fail_first: Mutex::new(None),
        });
        let h = harness(vec![classifier], None);
        let id = domain("example.co.uk");

        let submission = h
            .orch
            .submit_for_enrichment(&id, Some(&[AgentType::DomainClassifier]))
            .await
            .unwrap();
        assert_eq!(submission.accepted, vec![AgentType::DomainClassifier]);
        h.orch.drain().await.unwrap();

        let record = h.orch.get_current_fact_record(&id).await.unwrap();
        let group = record.group(groups::CLASSIFICATION).unwrap();
        assert_eq!(group.confidence, 0.9);
        assert_eq!(group.evidence, vec!["no checkout path found", "no product schema"]);

        for days in [0, 8, 15, 31] {
            h.clock.set(t0() + chrono::Duration::days(days));
            let report = h.orch.tick().await.unwrap();
            assert_eq!(report.gated, 2);
            h.orch.drain().await.unwrap();
        }
        let explicit = h
            .orch
            .submit_for_enrichment(&id, Some(&[AgentType::SeoMetrics, AgentType::TechStack]))
            .await
            .unwrap();
        assert!(explicit.accepted.is_empty());
        assert_eq!(explicit.gated.len(), 2);

        assert_eq!(h.fixture("backlinks").submit_count(), 0);
        assert_eq!(h.fixture("authority").submit_count(), 0);
        assert_eq!(h.fixture("tech").submit_count(), 0);
        let record = h.orch.get_current_fact_record(&id).await.unwrap();
        assert!(record.group(groups::SEO_METRICS).is_none());
        assert!(record.group(groups::TECHNICAL_LAYER).is_none());
    }

    #[tokio::test]
    async fn breaker_opens_then_probe_closes() {
        let h = harness(vec![Verdict::qualifying()], None);
        let ids: Vec<EntityId> = (0..6).map(|i| domain(&format!("shop{i}.co.uk"))).collect();
        for id in &ids {
            h.orch
                .submit_for_enrichment(id, Some(&[AgentType::DomainClassifier]))
                .await
                .unwrap();
        }
        h.orch.drain().await.unwrap();

        let tech = h.fixture("tech");
        tech.fail_times(5, ProviderError::Timeout("deadline".into()));
        for id in &ids {
            let s = h
                .orch
                .submit_for_enrichment(id, Some(&[AgentType::TechStack]))
                .await
                .unwrap();
            assert_eq!(s.accepted, vec![AgentType::TechStack]);
        }

        let d = h.orch.dispatcher();
        for _ in 0..5 {
            let (_, settled) = d.dispatch_next(AgentType::TechStack).await.unwrap().unwrap();
            assert!(matches!(settled, Settled::Retrying { attempt: 1, .. }));
        }
        let gateway = d.providers().get("tech").unwrap();
        assert_eq!(gateway.breaker().state(), CircuitState::Open);

        // The sixth job is not dispatched and makes no call
        assert!(d.dispatch_next(AgentType::TechStack).await.unwrap().is_none());
        assert_eq!(tech.submit_count(), 5);
        let waiting = d.with_queues(|q| q.jobs_for(AgentType::TechStack));
        let untouched: Vec<&Job> = waiting.iter().filter(|j| j.history.is_empty()).collect();
        assert_eq!(untouched.len(), 1);
        assert_eq!(untouched[0].attempt_count, 0);
        let health = h.orch.get_pipeline_health();
        assert_eq!(health.queue_depth(AgentType::TechStack), 6);
        assert_eq!(health.open_events(), 1);

        // A direct call is short-circuited too
        let err = gateway
            .call(
                &cartograph_providers::ProviderRequest::TechFingerprint {
                    domain: "shop0.co.uk".into(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ProviderUnavailable { .. }));
        assert_eq!(tech.submit_count(), 5);

        // After the cooldown one probe goes through and closes the circuit
        h.clock.advance(chrono::Duration::seconds(60));
        let (_, settled) = d.dispatch_next(AgentType::TechStack).await.unwrap().unwrap();
        assert_eq!(settled, Settled::Succeeded { applied: true });
        assert_eq!(gateway.breaker().state(), CircuitState::Closed);

        h.clock.advance(chrono::Duration::minutes(5));
        h.orch.drain().await.unwrap();
        for id in &ids {
            let record = h.orch.get_current_fact_record(id).await.unwrap();
            assert!(record.group(groups::TECHNICAL_LAYER).is_some());
        }
        assert_eq!(h.orch.get_pipeline_health().dead_letters, 0);
    }

    #[tokio::test]
    async fn dead_letter_replay_resets_attempts() {
        let classifier = Verdict::qualifying();
        *classifier.fail_first.lock().unwrap() = Some(AgentError::fatal("unparseable homepage"));
        let h = harness(vec![classifier], None);
        let id = domain("example.co.uk");

        h.orch
            .submit_for_enrichment(&id, Some(&[AgentType::DomainClassifier]))
            .await
            .unwrap();
        h.orch.drain().await.unwrap();

        let dead = h.orch.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt_count, 1);
        assert_eq!(dead[0].history[0].outcome, "fatal");
        let record = h.orch.get_current_fact_record(&id).await.unwrap();
        assert!(record.last_failure.unwrap().reason.contains("unparseable"));

        // Held: the scheduler does not pile up more jobs behind it
        let report = h.orch.tick().await.unwrap();
        assert_eq!(report.held, 1);

        let replayed = h.orch.replay_dead_letter(&dead[0].job_id).await.unwrap();
        assert_eq!(replayed.attempt_count, 0);
        assert_eq!(replayed.history.last().unwrap().outcome, "replayed");
        assert!(h.orch.dead_letters().is_empty());

        h.orch.drain().await.unwrap();
        let record = h.orch.get_current_fact_record(&id).await.unwrap();
        assert_eq!(record.qualifies(), Some(true));
        assert!(h.orch.replay_dead_letter(&dead[0].job_id).await.is_err());
    }

    #[tokio::test]
    async fn change_history_tracks_traffic_growth() {
        let h = harness(vec![Verdict::qualifying()], None);
        let id = domain("example.co.uk");
        let backlinks = |traffic: u64| {
            json!({
                "domain": "example.co.uk",
                "domain_rating": 54,
                "organic_traffic_estimate": traffic,
                "source": "fixture"
            })
        };
        h.fixture("backlinks")
            .set_payload("backlink_metrics", Some("example.co.uk"), backlinks(1000));

        h.orch
            .submit_for_enrichment(&id, Some(&[AgentType::DomainClassifier]))
            .await
            .unwrap();
        h.orch.drain().await.unwrap();
        h.orch.tick().await.unwrap();
        h.orch.drain().await.unwrap();
        let record = h.orch.get_current_fact_record(&id).await.unwrap();
        assert_eq!(record.value(groups::CHANGE_TRACKING).unwrap()["baseline"], json!(true));
        assert!(h.orch.get_change_history(&id, TimeRange::all()).is_empty());

        // A month later: more traffic and a newly gained SERP feature
        h.clock.advance(chrono::Duration::days(30));
        h.fixture("backlinks")
            .set_payload("backlink_metrics", Some("example.co.uk"), backlinks(1250));
        let serp = FactDelta {
            agent_type: AgentType::SerpDiscovery,
            entity_id: id.clone(),
            group_name: groups::SERP_INTELLIGENCE.into(),
            value: json!({"serp_features": {"X": true}, "keywords": []}),
            confidence: 1.0,
            evidence: Vec::new(),
            produced_at: h.clock.now(),
            idempotency_key: IdempotencyKey::derive(&JobId::new(), &id),
            error: None,
        };
        h.orch.dispatcher().merger().apply(&serp).await.unwrap();
        h.orch.tick().await.unwrap();
        h.orch.drain().await.unwrap();

        let history = h.orch.get_change_history(&id, TimeRange::all());
        assert_eq!(history.len(), 1);
        let change = &history[0];
        let pct = change.traffic_delta_percent().unwrap();
        assert!((pct - 25.0).abs() < 1e-9);
        assert_eq!(change.feature_gains, vec!["X"]);
        assert_eq!(change.period_end - change.period_start, chrono::Duration::days(30));

        let since_later = TimeRange {
            since: Some(t0() + chrono::Duration::days(31)),
            until: None,
        };
        assert!(h.orch.get_change_history(&id, since_later).is_empty());
    }

    #[tokio::test]
    async fn cancel_entity_withdraws_queued_jobs() {
        let h = harness(Vec::new(), None);
        let id = domain("example.co.uk");
        h.orch.submit_for_enrichment(&id, None).await.unwrap();
        assert_eq!(h.orch.cancel_entity(&id).await.unwrap(), 1);

        let health = h.orch.get_pipeline_health();
        assert_eq!(health.queue_depth(AgentType::DomainClassifier), 0);
        assert_eq!(health.retired, 1);
        assert_eq!(h.orch.drain().await.unwrap(), 0);
        assert_eq!(h.fixture("page_fetch").submit_count(), 0);
        assert!(h.orch.submit_for_enrichment(&id, None).await.is_err());
        assert!(h.orch.cancel_entity(&id).await.is_err());
    }

    #[tokio::test]
    async fn resubmission_is_a_no_op_while_queued() {
        let h = harness(Vec::new(), None);
        let id = domain("example.co.uk");
        let first = h.orch.submit_for_enrichment(&id, None).await.unwrap();
        assert_eq!(first.accepted, vec![AgentType::DomainClassifier]);
        assert_eq!(first.gated, vec![AgentType::SeoMetrics, AgentType::TechStack]);
        let again = h.orch.submit_for_enrichment(&id, None).await.unwrap();
        assert!(again.accepted.is_empty());
        assert_eq!(again.already_queued, vec![AgentType::DomainClassifier]);
        assert_eq!(h.orch.get_pipeline_health().queue_depth(AgentType::DomainClassifier), 1);

        let wrong_kind = h
            .orch
            .submit_for_enrichment(&id, Some(&[AgentType::KeywordMiner]))
            .await;
        assert!(wrong_kind.is_err());
    }

    /// Records the peak number of concurrent runs per (agent, entity).
    struct Slow {
        agent: AgentType,
        active: Mutex<HashMap<EntityId, usize>>,
        peak: Mutex<usize>,
        runs: Mutex<usize>,
    }

    #[async_trait]
    impl AgentRunner for Slow {
        fn agent_type(&self) -> AgentType {
            self.agent
        }

        async fn run(&self, ctx: &RunContext) -> std::result::Result<FactDelta, AgentError> {
            {
                let mut active = self.active.lock().unwrap();
                let n = active.entry(ctx.entity_id.clone()).or_default();
                *n += 1;
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(*n);
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
            {
                let mut active = self.active.lock().unwrap();
                if let Some(n) = active.get_mut(&ctx.entity_id) {
                    *n -= 1;
                }
                *self.runs.lock().unwrap() += 1;
            }
            Ok(ctx.delta(self.agent, json!({"qualifies": false}), 1.0, Vec::new()))
        }
    }

    #[tokio::test]
    async fn running_jobs_never_overlap_per_entity() {
        let slow = Arc::new(Slow {
            agent: AgentType::DomainClassifier,
            active: Mutex::new(HashMap::new()),
            peak: Mutex::new(0),
            runs: Mutex::new(0),
        });
        let h = harness(vec![slow.clone()], None);
        let orch = Arc::new(h.orch);
        let ids: Vec<EntityId> = (0..3).map(|i| domain(&format!("shop{i}.co.uk"))).collect();

        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let orch = orch.clone();
            let shutdown = shutdown.clone();
            async move { orch.run(shutdown).await }
        });

        for _ in 0..6 {
            for id in &ids {
                orch.submit_for_enrichment(id, Some(&[AgentType::DomainClassifier]))
                    .await
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for _ in 0..200 {
            let health = orch.get_pipeline_health();
            if health.in_flight == 0 && health.queue_depth(AgentType::DomainClassifier) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(*slow.peak.lock().unwrap(), 1);
        assert!(*slow.runs.lock().unwrap() >= 3);
    }

    #[tokio::test]
    async fn restore_rebuilds_state_from_storage() {
        let db_path =
            std::env::temp_dir().join(format!("cg_test_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&db_path).await.unwrap());
        let id = domain("example.co.uk");

        let classifier = Verdict::qualifying();
        *classifier.fail_first.lock().unwrap() = Some(AgentError::fatal("bad page"));
        let h = harness(vec![classifier], Some(storage.clone()));
        h.orch
            .submit_for_enrichment(&id, Some(&[AgentType::DomainClassifier]))
            .await
            .unwrap();
        h.orch.drain().await.unwrap();
        let keyword = EntityId::keyword_batch(3);
        h.orch
            .submit_for_enrichment(&keyword, Some(&[AgentType::KeywordMiner]))
            .await
            .unwrap();
        // Simulate a crash mid-run: the job is left `running` in storage
        let mut interrupted = h
            .orch
            .dispatcher()
            .with_queues(|q| q.next_ready(AgentType::KeywordMiner, t0(), |_| true))
            .unwrap();
        interrupted.status = JobStatus::Running;
        storage.upsert_job(&interrupted).await.unwrap();
        let before = h.orch.get_current_fact_record(&id).await.unwrap();

        let fresh = harness(Vec::new(), Some(storage.clone()));
        let report = fresh.orch.restore().await.unwrap();
        assert_eq!(report.entities, 2);
        assert_eq!(report.jobs, 2);
        assert_eq!(fresh.orch.get_current_fact_record(&id).await.unwrap(), before);
        assert_eq!(fresh.orch.dead_letters().len(), 1);

        let health = fresh.orch.get_pipeline_health();
        assert_eq!(health.queue_depth(AgentType::KeywordMiner), 1);
        assert_eq!(health.in_flight, 0);
        fresh.orch.drain().await.unwrap();
        let batch = fresh.orch.get_current_fact_record(&keyword).await.unwrap();
        assert!(batch.group(groups::KEYWORD_SET).is_some());

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn change_history_spans_process_restarts() {
        let db_path =
            std::env::temp_dir().join(format!("cg_test_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&db_path).await.unwrap());
        let id = domain("example.co.uk");
        let backlinks = |traffic: u64| {
            json!({
                "domain": "example.co.uk",
                "domain_rating": 54,
                "organic_traffic_estimate": traffic,
                "source": "fixture"
            })
        };

        // First process: classify, then take the baseline
        let first = harness(vec![Verdict::qualifying()], Some(storage.clone()));
        first
            .fixture("backlinks")
            .set_payload("backlink_metrics", Some("example.co.uk"), backlinks(1000));
        first
            .orch
            .submit_for_enrichment(&id, Some(&[AgentType::DomainClassifier]))
            .await
            .unwrap();
        first.orch.drain().await.unwrap();
        first.orch.tick().await.unwrap();
        first.orch.drain().await.unwrap();
        let record = first.orch.get_current_fact_record(&id).await.unwrap();
        assert_eq!(record.value(groups::CHANGE_TRACKING).unwrap()["baseline"], json!(true));
        drop(first);

        // A later process, a month on
        let later = harness(vec![Verdict::qualifying()], Some(storage.clone()));
        let report = later.orch.restore().await.unwrap();
        assert!(report.snapshots >= 1);
        later.clock.advance(chrono::Duration::days(30));
        later
            .fixture("backlinks")
            .set_payload("backlink_metrics", Some("example.co.uk"), backlinks(1250));
        later.orch.tick().await.unwrap();
        later.orch.drain().await.unwrap();

        let history = later.orch.get_change_history(&id, TimeRange::all());
        assert_eq!(history.len(), 1);
        let change = &history[0];
        assert!((change.traffic_delta_percent().unwrap() - 25.0).abs() < 1e-9);
        assert_eq!(change.period_end - change.period_start, chrono::Duration::days(30));
        assert_eq!(
            storage
                .list_change_records(&id, TimeRange::all())
                .await
                .unwrap()
                .len(),
            1
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn deleted_entity_stays_deleted_after_restore() {
        let db_path =
            std::env::temp_dir().join(format!("cg_test_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&db_path).await.unwrap());
        let id = domain("example.co.uk");

        let h = harness(Vec::new(), Some(storage.clone()));
        h.orch.submit_for_enrichment(&id, None).await.unwrap();
        assert_eq!(h.orch.cancel_entity(&id).await.unwrap(), 1);
        drop(h);

        let fresh = harness(Vec::new(), Some(storage.clone()));
        let report = fresh.orch.restore().await.unwrap();
        assert_eq!(report.entities, 0);
        assert_eq!(report.jobs, 0);
        assert!(fresh.orch.submit_for_enrichment(&id, None).await.is_err());
        assert!(fresh.orch.cancel_entity(&id).await.is_err());

        let health = fresh.orch.get_pipeline_health();
        assert_eq!(health.entities, 0);
        assert_eq!(health.retired, 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn submission_serializes_for_the_cli() {
        let s = Submission {
            accepted: vec![AgentType::DomainClassifier],
            ..Default::default()
        };
        let v: Value = serde_json::to_value(&s).unwrap();
        assert_eq!(v["accepted"], json!(["domain_classifier"]));
    }
}
