//! Shared fixtures for runner tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cartograph_providers::{FixtureProvider, ProviderGateway};
use cartograph_shared::{
    AgentType, BreakerConfig, EntityId, FactGroup, FactRecord, IdempotencyKey, JobId,
    ManualClock, PassKind, ProviderEntry,
};

use crate::runner::RunContext;

pub(crate) fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub(crate) fn context(entity_id: EntityId, record: FactRecord) -> RunContext {
    let job_id = JobId::new();
    RunContext {
        idempotency_key: IdempotencyKey::derive(&job_id, &entity_id),
        job_id,
        entity_id,
        record,
        prior: None,
        pass: PassKind::Full,
        cancel: CancellationToken::new(),
        clock: Arc::new(ManualClock::new(t0())),
    }
}

pub(crate) fn gateway(provider: Arc<FixtureProvider>) -> Arc<ProviderGateway> {
    let entry = ProviderEntry {
        timeout_secs: 2,
        poll_interval_ms: 1,
        ..ProviderEntry::fixture("fixture")
    };
    Arc::new(ProviderGateway::new(
        provider,
        &entry,
        &BreakerConfig::default(),
        Arc::new(ManualClock::new(t0())),
    ))
}

/// A record holding a single group.
pub(crate) fn with_group(
    entity_id: EntityId,
    group: &str,
    agent: AgentType,
    value: Value,
) -> FactRecord {
    let mut record = FactRecord::new(entity_id.clone());
    record.groups.insert(
        group.to_string(),
        FactGroup {
            value,
            confidence: 1.0,
            evidence: vec![],
            agent_type: agent,
            updated_at: t0(),
            idempotency_key: IdempotencyKey::derive(&JobId::new(), &entity_id),
        },
    );
    record.last_updated_at = Some(t0());
    record
}
