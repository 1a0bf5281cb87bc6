//! Core domain types for the enrichment pipeline.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CartographError, Result};

/// Current schema version for fact records.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Prefix of synthetic entities that carry one rotating keyword batch.
const KEYWORD_BATCH_PREFIX: &str = "kw-batch-";

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$")
        .expect("valid regex")
});

/// Fact group names written by the agents.
pub mod groups {
    pub const KEYWORD_SET: &str = "keyword_set";
    pub const DISCOVERY: &str = "discovery";
    pub const CLASSIFICATION: &str = "classification";
    pub const SEO_METRICS: &str = "seo_metrics";
    pub const TECHNICAL_LAYER: &str = "technical_layer";
    pub const INTENT_LAYER: &str = "intent_layer";
    pub const SERP_INTELLIGENCE: &str = "serp_intelligence";
    pub const CHANGE_TRACKING: &str = "change_tracking";
}

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Stable identifier of an enriched entity: a lowercase domain name, or a
/// synthetic keyword-batch id (`kw-batch-N`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Normalize (trim, lowercase, drop a trailing dot) and wrap.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let s = raw.as_ref().trim().trim_end_matches('.').to_ascii_lowercase();
        Self(s)
    }

    /// The synthetic entity carrying keyword batch `index`.
    pub fn keyword_batch(index: u32) -> Self {
        Self(format!("{KEYWORD_BATCH_PREFIX}{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Batch index for keyword-batch entities.
    pub fn batch_index(&self) -> Option<u32> {
        self.0.strip_prefix(KEYWORD_BATCH_PREFIX)?.parse().ok()
    }

    pub fn kind(&self) -> EntityKind {
        if self.batch_index().is_some() {
            EntityKind::KeywordBatch
        } else {
            EntityKind::Domain
        }
    }

    /// Whether this id is a syntactically valid domain name.
    pub fn is_valid_domain(&self) -> bool {
        self.0.len() <= 253 && DOMAIN_RE.is_match(&self.0)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What kind of subject an entity id names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Domain,
    KeywordBatch,
}

/// An entity enrolled for scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: EntityId,
    pub created_at: DateTime<Utc>,
    /// Crawl priority (higher first) used by sampling passes.
    #[serde(default = "default_entity_priority")]
    pub priority: u8,
}

fn default_entity_priority() -> u8 {
    5
}

impl Entity {
    pub fn new(entity_id: EntityId, created_at: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            created_at,
            priority: default_entity_priority(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.entity_id.kind()
    }
}

// ---------------------------------------------------------------------------
// AgentType
// ---------------------------------------------------------------------------

/// The seven enrichment agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    KeywordMiner,
    SerpDiscovery,
    DomainClassifier,
    SeoMetrics,
    TechStack,
    IntentScoring,
    ChangeTracking,
}

impl AgentType {
    pub const ALL: [AgentType; 7] = [
        AgentType::KeywordMiner,
        AgentType::SerpDiscovery,
        AgentType::DomainClassifier,
        AgentType::SeoMetrics,
        AgentType::TechStack,
        AgentType::IntentScoring,
        AgentType::ChangeTracking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeywordMiner => "keyword_miner",
            Self::SerpDiscovery => "serp_discovery",
            Self::DomainClassifier => "domain_classifier",
            Self::SeoMetrics => "seo_metrics",
            Self::TechStack => "tech_stack",
            Self::IntentScoring => "intent_scoring",
            Self::ChangeTracking => "change_tracking",
        }
    }

    /// The fact group this agent writes.
    pub fn group(&self) -> &'static str {
        match self {
            Self::KeywordMiner => groups::KEYWORD_SET,
            Self::SerpDiscovery => groups::DISCOVERY,
            Self::DomainClassifier => groups::CLASSIFICATION,
            Self::SeoMetrics => groups::SEO_METRICS,
            Self::TechStack => groups::TECHNICAL_LAYER,
            Self::IntentScoring => groups::INTENT_LAYER,
            Self::ChangeTracking => groups::CHANGE_TRACKING,
        }
    }

    /// The kind of entity this agent runs against.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Self::KeywordMiner | Self::SerpDiscovery => EntityKind::KeywordBatch,
            _ => EntityKind::Domain,
        }
    }

    /// Agents that only run once classification has said the entity qualifies.
    pub fn requires_qualification(&self) -> bool {
        matches!(self, Self::SeoMetrics | Self::TechStack | Self::IntentScoring)
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = CartographError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| CartographError::validation(format!("unknown agent type '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for job identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Deterministic hash of `(job_id, entity_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(job_id: &JobId, entity_id: &EntityId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(job_id.0.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(entity_id.as_str().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    DeadLettered,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::DeadLettered => "dead_lettered",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the job has been retired (kept for audit only).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered | Self::Cancelled)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CartographError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "dead_lettered" => Ok(Self::DeadLettered),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CartographError::parse(format!("unknown job status '{other}'"))),
        }
    }
}

/// One entry in a job's attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    /// `succeeded`, `recoverable`, `fatal`, `provider_unavailable`, `cancelled`, `replayed`.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A unit of scheduled work: one agent run against one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub agent_type: AgentType,
    pub entity_id: EntityId,
    pub scheduled_at: DateTime<Utc>,
    /// Higher runs first.
    pub priority: u8,
    pub attempt_count: u32,
    pub idempotency_key: IdempotencyKey,
    /// Provider whose breaker gates dispatch, if the agent calls out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Earliest time the job may be dispatched (backoff).
    pub not_before: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl Job {
    pub fn new(
        agent_type: AgentType,
        entity_id: EntityId,
        priority: u8,
        provider_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let job_id = JobId::new();
        let idempotency_key = IdempotencyKey::derive(&job_id, &entity_id);
        Self {
            job_id,
            agent_type,
            entity_id,
            scheduled_at: now,
            priority,
            attempt_count: 0,
            idempotency_key,
            provider_id,
            not_before: now,
            status: JobStatus::Queued,
            history: Vec::new(),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>, outcome: &str, detail: Option<String>) {
        self.history.push(AttemptRecord {
            attempt: self.attempt_count,
            at,
            outcome: outcome.to_string(),
            detail,
        });
    }
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

/// One agent's proposed update to one group of a fact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactDelta {
    pub agent_type: AgentType,
    pub entity_id: EntityId,
    pub group_name: String,
    pub value: serde_json::Value,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub produced_at: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FactDelta {
    /// Check the confidence range and the evidence requirement.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(CartographError::validation(format!(
                "confidence {} out of range for group {}",
                self.confidence, self.group_name
            )));
        }
        if self.confidence < 1.0 && self.evidence.iter().all(|e| e.trim().is_empty()) {
            return Err(CartographError::validation(format!(
                "group {} has confidence {} but no evidence",
                self.group_name, self.confidence
            )));
        }
        if self.group_name.is_empty() {
            return Err(CartographError::validation("delta has empty group name"));
        }
        Ok(())
    }
}

/// Current state of one group within a fact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactGroup {
    pub value: serde_json::Value,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub agent_type: AgentType,
    pub updated_at: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
}

/// Evidence note left on an entity when a job ends in failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNote {
    pub agent_type: AgentType,
    pub job_id: JobId,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// The current, versioned, grouped enrichment state for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub entity_id: EntityId,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub groups: BTreeMap<String, FactGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureNote>,
}

impl FactRecord {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            schema_version: CURRENT_SCHEMA_VERSION,
            last_updated_at: None,
            groups: BTreeMap::new(),
            last_failure: None,
        }
    }

    pub fn group(&self, name: &str) -> Option<&FactGroup> {
        self.groups.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        self.groups.get(name).map(|g| &g.value)
    }

    pub fn updated_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.groups.get(name).map(|g| g.updated_at)
    }

    /// The classification verdict, if the entity has been classified.
    pub fn qualifies(&self) -> Option<bool> {
        self.value(groups::CLASSIFICATION)?
            .get("qualifies")?
            .as_bool()
    }
}

// ---------------------------------------------------------------------------
// Provider state
// ---------------------------------------------------------------------------

/// Circuit breaker state of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::str::FromStr for CircuitState {
    type Err = CartographError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            other => Err(CartographError::parse(format!("unknown circuit state '{other}'"))),
        }
    }
}

/// Persisted view of one provider's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderState {
    pub provider_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_probe_at: Option<DateTime<Utc>>,
    /// Current cooldown; doubles on each failed probe.
    pub cooldown_secs: u64,
    /// How many times the circuit has opened.
    #[serde(default)]
    pub open_events: u64,
}

// ---------------------------------------------------------------------------
// Change records
// ---------------------------------------------------------------------------

/// Numeric change of one field between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    pub before: f64,
    pub after: f64,
    pub absolute: f64,
    /// Percentage change; absent when `before` is zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

/// Which change-detection pass produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Full,
    Sample,
}

/// Derived diff between two time-separated fact record snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub entity_id: EntityId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[serde(default)]
    pub field_deltas: BTreeMap<String, FieldDelta>,
    pub trending_score: f64,
    #[serde(default)]
    pub feature_gains: Vec<String>,
    #[serde(default)]
    pub feature_losses: Vec<String>,
    #[serde(default)]
    pub keyword_wins: u32,
    #[serde(default)]
    pub keyword_losses: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_reason: Option<String>,
    pub pass: PassKind,
}

/// Field path of the organic traffic estimate inside a fact record.
pub const TRAFFIC_FIELD: &str = "seo_metrics.organic_traffic_estimate";

impl ChangeRecord {
    /// Percentage change of the organic traffic estimate, if both snapshots had one.
    pub fn traffic_delta_percent(&self) -> Option<f64> {
        self.field_deltas.get(TRAFFIC_FIELD)?.percent
    }
}

/// Inclusive time window for history queries; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.is_none_or(|s| at >= s) && self.until.is_none_or(|u| at <= u)
    }
}
