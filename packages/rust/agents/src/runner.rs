//! The runner contract and the set of runners the dispatcher draws from.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use cartograph_providers::{ProviderGateway, ProviderRegistry};
use cartograph_shared::{
    AgentError, AgentType, AppConfig, CartographError, Clock, EntityId, FactDelta, FactRecord,
    IdempotencyKey, JobId, PassKind, Result,
};

use crate::change_tracking::ChangeTrackingRunner;
use crate::classifier::DomainClassifierRunner;
use crate::intent::IntentScoringRunner;
use crate::keyword_miner::KeywordMinerRunner;
use crate::seo_metrics::SeoMetricsRunner;
use crate::serp_discovery::SerpDiscoveryRunner;
use crate::tech_stack::TechStackRunner;

/// A fact record as it stood at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub record: FactRecord,
}

/// Everything a runner may read. Runners never touch orchestration state.
#[derive(Clone)]
pub struct RunContext {
    pub job_id: JobId,
    pub entity_id: EntityId,
    pub idempotency_key: IdempotencyKey,
    /// The entity's merged record at dispatch time.
    pub record: FactRecord,
    /// Previous snapshot, for change tracking.
    pub prior: Option<Snapshot>,
    /// Which change-detection pass scheduled this run.
    pub pass: PassKind,
    pub cancel: CancellationToken,
    pub clock: Arc<dyn Clock>,
}

impl RunContext {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn check_cancelled(&self) -> std::result::Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Build the delta for `agent`'s group, stamped with this job's key.
    pub fn delta(
        &self,
        agent: AgentType,
        value: serde_json::Value,
        confidence: f64,
        evidence: Vec<String>,
    ) -> FactDelta {
        FactDelta {
            agent_type: agent,
            entity_id: self.entity_id.clone(),
            group_name: agent.group().to_string(),
            value,
            confidence,
            evidence,
            produced_at: self.now(),
            idempotency_key: self.idempotency_key.clone(),
            error: None,
        }
    }
}

/// One enrichment agent: inputs in, evidence-scored delta out.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    fn agent_type(&self) -> AgentType;

    async fn run(&self, ctx: &RunContext) -> std::result::Result<FactDelta, AgentError>;
}

/// Agent type -> runner.
#[derive(Default, Clone)]
pub struct RunnerSet {
    runners: HashMap<AgentType, Arc<dyn AgentRunner>>,
}

impl RunnerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The seven runners, wired to the providers named in `[agents.*]`.
    pub fn from_config(config: &AppConfig, registry: &ProviderRegistry) -> Result<Self> {
        let provider = |agent: AgentType| -> Result<Arc<ProviderGateway>> {
            let id = config.agents.get(agent).provider.as_deref().ok_or_else(|| {
                CartographError::config(format!("agent {agent} needs a provider"))
            })?;
            registry.get(id).ok_or_else(|| {
                CartographError::config(format!("agent {agent} uses unknown provider '{id}'"))
            })
        };

        let supplementary = match config.agents.seo_metrics.supplementary_provider.as_deref() {
            Some(id) => Some(registry.get(id).ok_or_else(|| {
                CartographError::config(format!("seo_metrics uses unknown provider '{id}'"))
            })?),
            None => None,
        };

        let mut set = Self::new();
        set.insert(Arc::new(KeywordMinerRunner::new(
            config.pipeline.keyword_batches,
            config.pipeline.max_keywords_per_batch,
        )));
        set.insert(Arc::new(SerpDiscoveryRunner::new(provider(
            AgentType::SerpDiscovery,
        )?)));
        set.insert(Arc::new(DomainClassifierRunner::new(provider(
            AgentType::DomainClassifier,
        )?)));
        set.insert(Arc::new(SeoMetricsRunner::new(
            provider(AgentType::SeoMetrics)?,
            supplementary,
        )));
        set.insert(Arc::new(TechStackRunner::new(provider(AgentType::TechStack)?)));
        set.insert(Arc::new(IntentScoringRunner));
        set.insert(Arc::new(ChangeTrackingRunner::new(
            config.change_detection.alert_threshold,
        )));
        Ok(set)
    }

    /// Add or replace the runner for its agent type.
    pub fn insert(&mut self, runner: Arc<dyn AgentRunner>) {
        self.runners.insert(runner.agent_type(), runner);
    }

    pub fn get(&self, agent: AgentType) -> Option<Arc<dyn AgentRunner>> {
        self.runners.get(&agent).cloned()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
