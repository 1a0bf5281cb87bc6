//! Cadence engine.
//!
//! The scheduler holds no state of its own: each tick it looks at the
//! enrolled entities, their current fact records and the queues, and
//! enqueues one job per due `(agent, entity)` pair that has nothing
//! outstanding.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, instrument};

use cartograph_shared::{
    AgentType, AppConfig, Cadence, Entity, EntityId, EntityKind, FactRecord, Job, PassKind,
    groups,
};

use crate::queue::JobQueues;

const DAY_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct AgentSchedule {
    pub cadence: Cadence,
    pub priority: u8,
    pub provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub agents: HashMap<AgentType, AgentSchedule>,
    pub keyword_batches: u32,
    pub full_pass: Duration,
    pub sample_pass: Duration,
    pub sample_fraction: f64,
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        let agents = AgentType::ALL
            .into_iter()
            .map(|agent| {
                let c = config.agents.get(agent);
                (
                    agent,
                    AgentSchedule {
                        cadence: c.cadence.clone(),
                        priority: c.priority,
                        provider: c.provider.clone(),
                    },
                )
            })
            .collect();
        let cd = &config.change_detection;
        Self {
            agents,
            keyword_batches: config.pipeline.keyword_batches.max(1),
            full_pass: Duration::days(i64::from(cd.full_pass_days)),
            sample_pass: Duration::hours(i64::from(cd.sample_pass_hours)),
            sample_fraction: cd.sample_fraction.clamp(0.0, 1.0),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub enqueued: usize,
    /// Due, but a job for the same pair was already outstanding.
    pub deduplicated: usize,
    /// Due, but held back until classification says the entity qualifies.
    pub gated: usize,
    /// Due, but a dead-lettered job for the pair awaits replay.
    pub held: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    NotDue,
    Due,
    Gated,
}

fn stale(updated: Option<DateTime<Utc>>, now: DateTime<Utc>, every: Duration) -> bool {
    updated.is_none_or(|t| now - t >= every)
}

pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Keyword batch entities this configuration rotates through.
    pub fn keyword_batch_entities(&self, now: DateTime<Utc>) -> Vec<Entity> {
        (0..self.config.keyword_batches)
            .map(|i| Entity::new(EntityId::keyword_batch(i), now))
            .collect()
    }

    /// Which change-tracking pass a run at `now` makes: full when the last
    /// full pass is older than the full interval, sample otherwise.
    pub fn pass_kind(&self, record: Option<&FactRecord>, now: DateTime<Utc>) -> PassKind {
        let last = record.and_then(|r| r.updated_at(groups::CHANGE_TRACKING));
        if stale(last, now, self.config.full_pass) {
            PassKind::Full
        } else {
            PassKind::Sample
        }
    }

    /// Domain entities in this tick's sampling set: the top fraction by
    /// entity priority, ties broken by id.
    fn sample_set(&self, entities: &[Entity]) -> HashSet<EntityId> {
        let mut domains: Vec<&Entity> = entities
            .iter()
            .filter(|e| e.kind() == EntityKind::Domain)
            .collect();
        domains.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        let take = (self.config.sample_fraction * domains.len() as f64).ceil() as usize;
        domains
            .into_iter()
            .take(take)
            .map(|e| e.entity_id.clone())
            .collect()
    }

    fn decide(
        &self,
        agent: AgentType,
        entity: &Entity,
        record: Option<&FactRecord>,
        in_sample: bool,
        now: DateTime<Utc>,
    ) -> Decision {
        let Some(schedule) = self.config.agents.get(&agent) else {
            return Decision::NotDue;
        };
        if agent.entity_kind() != entity.kind() {
            return Decision::NotDue;
        }
        let own = record.and_then(|r| r.updated_at(agent.group()));

        let due = match &schedule.cadence {
            Cadence::Interval { every_secs } => {
                stale(own, now, Duration::seconds(*every_secs as i64))
            }
            Cadence::RotatingBatch { every_secs } => {
                let today = now.timestamp().div_euclid(DAY_SECS) as u64;
                let batches = u64::from(self.config.keyword_batches);
                entity
                    .entity_id
                    .batch_index()
                    .is_some_and(|i| u64::from(i) % batches == today % batches)
                    && stale(own, now, Duration::seconds(*every_secs as i64))
            }
            Cadence::MonthlyWithSampling => {
                // Nothing to snapshot until another agent has written facts
                let has_facts = record.is_some_and(|r| {
                    r.groups.keys().any(|g| g != groups::CHANGE_TRACKING)
                });
                has_facts
                    && (stale(own, now, self.config.full_pass)
                        || (in_sample && stale(own, now, self.config.sample_pass)))
            }
            Cadence::AfterAgent { upstream } => {
                match record.and_then(|r| r.updated_at(upstream.group())) {
                    Some(up) => own.is_none_or(|t| up > t),
                    None => false,
                }
            }
        };

        if !due {
            Decision::NotDue
        } else if agent.requires_qualification()
            && record.and_then(FactRecord::qualifies) != Some(true)
        {
            Decision::Gated
        } else {
            Decision::Due
        }
    }

    /// Run one tick: enqueue every due job that is not already outstanding.
    /// Returns the report and the jobs that were enqueued.
    #[instrument(skip_all, fields(entities = entities.len()))]
    pub fn tick(
        &self,
        now: DateTime<Utc>,
        entities: &[Entity],
        records: &HashMap<EntityId, FactRecord>,
        queues: &mut JobQueues,
    ) -> (TickReport, Vec<Job>) {
        let sample = self.sample_set(entities);
        let mut report = TickReport::default();
        let mut enqueued = Vec::new();

        for entity in entities {
            let record = records.get(&entity.entity_id);
            let in_sample = sample.contains(&entity.entity_id);
            for agent in AgentType::ALL {
                match self.decide(agent, entity, record, in_sample, now) {
                    Decision::NotDue => {}
                    Decision::Gated => report.gated += 1,
                    Decision::Due => {
                        if queues.is_outstanding(agent, &entity.entity_id) {
                            report.deduplicated += 1;
                            continue;
                        }
                        if queues.is_dead_lettered(agent, &entity.entity_id) {
                            report.held += 1;
                            continue;
                        }
                        let Some(schedule) = self.config.agents.get(&agent) else {
                            continue;
                        };
                        let job = Job::new(
                            agent,
                            entity.entity_id.clone(),
                            schedule.priority,
                            schedule.provider.clone(),
                            now,
                        );
                        if queues.enqueue(job.clone()) {
                            report.enqueued += 1;
                            enqueued.push(job);
                        }
                    }
                }
            }
        }

        debug!(
            enqueued = report.enqueued,
            deduplicated = report.deduplicated,
            gated = report.gated,
            "scheduler tick"
        );
        (report, enqueued)
    }

    /// Job for an explicit submission, bypassing cadence.
    pub fn submission(&self, agent: AgentType, entity_id: &EntityId, now: DateTime<Utc>) -> Job {
        let (priority, provider) = self
            .config
            .agents
            .get(&agent)
            .map(|s| (s.priority, s.provider.clone()))
            .unwrap_or((5, None));
        Job::new(agent, entity_id.clone(), priority, provider, now)
    }
}
