//! The single writer of fact records.
//!
//! Merges for one entity are serialized by a per-entity async lock, so a
//! merge (including its write-through to storage) is never interleaved with
//! another merge for the same entity.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument};

use cartograph_shared::{
    CURRENT_SCHEMA_VERSION, CartographError, EntityId, FactDelta, FactGroup, FactRecord,
    FailureNote, IdempotencyKey, Result,
};
use cartograph_storage::Storage;

/// Result of applying one delta.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record: FactRecord,
    /// `false` when the delta's key had already been applied.
    pub applied: bool,
}

#[derive(Debug)]
struct EntityFacts {
    record: FactRecord,
    /// Most recent applied keys, oldest first.
    applied: VecDeque<IdempotencyKey>,
    applied_set: HashSet<IdempotencyKey>,
}

impl EntityFacts {
    fn new(record: FactRecord, keys: Vec<IdempotencyKey>) -> Self {
        Self {
            record,
            applied_set: keys.iter().cloned().collect(),
            applied: keys.into(),
        }
    }

    fn remember(&mut self, key: IdempotencyKey, retention: usize) {
        self.applied_set.insert(key.clone());
        self.applied.push_back(key);
        while self.applied.len() > retention {
            if let Some(old) = self.applied.pop_front() {
                self.applied_set.remove(&old);
            }
        }
    }

    fn keys(&self) -> Vec<IdempotencyKey> {
        self.applied.iter().cloned().collect()
    }
}

pub struct FactMerger {
    entities: Mutex<HashMap<EntityId, Arc<AsyncMutex<EntityFacts>>>>,
    retention: usize,
    storage: Option<Arc<Storage>>,
}

impl FactMerger {
    pub fn new(retention: usize, storage: Option<Arc<Storage>>) -> Self {
        Self {
            entities: Mutex::new(HashMap::new()),
            retention: retention.max(1),
            storage,
        }
    }

    fn slot(&self, entity_id: &EntityId) -> Arc<AsyncMutex<EntityFacts>> {
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        entities
            .entry(entity_id.clone())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(EntityFacts::new(
                    FactRecord::new(entity_id.clone()),
                    Vec::new(),
                )))
            })
            .clone()
    }

    fn existing(&self, entity_id: &EntityId) -> Option<Arc<AsyncMutex<EntityFacts>>> {
        let entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        entities.get(entity_id).cloned()
    }

    /// Apply a delta. A delta whose key was already applied returns the
    /// current record unchanged.
    ///
    /// The delta's group is replaced wholesale: value, confidence and
    /// evidence all come from the newer delta.
    #[instrument(skip_all, fields(entity_id = %delta.entity_id, group = %delta.group_name))]
    pub async fn apply(&self, delta: &FactDelta) -> Result<MergeOutcome> {
        delta.validate()?;

        let slot = self.slot(&delta.entity_id);
        let mut facts = slot.lock().await;

        if facts.applied_set.contains(&delta.idempotency_key) {
            debug!(key = %delta.idempotency_key, "delta already applied");
            return Ok(MergeOutcome {
                record: facts.record.clone(),
                applied: false,
            });
        }

        let mut record = facts.record.clone();
        record.groups.insert(
            delta.group_name.clone(),
            FactGroup {
                value: delta.value.clone(),
                confidence: delta.confidence,
                evidence: delta.evidence.clone(),
                agent_type: delta.agent_type,
                updated_at: delta.produced_at,
                idempotency_key: delta.idempotency_key.clone(),
            },
        );
        record.last_updated_at = Some(
            record
                .last_updated_at
                .map_or(delta.produced_at, |t| t.max(delta.produced_at)),
        );
        record.schema_version = record.schema_version.max(CURRENT_SCHEMA_VERSION);

        let mut keys = facts.keys();
        keys.push(delta.idempotency_key.clone());
        if keys.len() > self.retention {
            keys.drain(..keys.len() - self.retention);
        }
        if let Some(storage) = &self.storage {
            storage.upsert_fact_record(&record, &keys).await?;
        }

        facts.record = record;
        facts.remember(delta.idempotency_key.clone(), self.retention);
        Ok(MergeOutcome {
            record: facts.record.clone(),
            applied: true,
        })
    }

    /// Leave a failure note on an entity. Groups are left untouched, so the
    /// record simply goes stale.
    pub async fn record_failure(&self, entity_id: &EntityId, note: FailureNote) -> Result<()> {
        let slot = self.slot(entity_id);
        let mut facts = slot.lock().await;
        let mut record = facts.record.clone();
        record.last_failure = Some(note);
        if let Some(storage) = &self.storage {
            storage.upsert_fact_record(&record, &facts.keys()).await?;
        }
        facts.record = record;
        Ok(())
    }

    /// Current record, if the entity has one.
    pub async fn get(&self, entity_id: &EntityId) -> Option<FactRecord> {
        let slot = self.existing(entity_id)?;
        let facts = slot.lock().await;
        Some(facts.record.clone())
    }

    /// Records of every entity with at least one merged group.
    pub async fn snapshot_all(&self) -> HashMap<EntityId, FactRecord> {
        let slots: Vec<(EntityId, Arc<AsyncMutex<EntityFacts>>)> = {
            let entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
            entities
                .iter()
                .map(|(id, slot)| (id.clone(), slot.clone()))
                .collect()
        };
        let mut out = HashMap::with_capacity(slots.len());
        for (id, slot) in slots {
            out.insert(id, slot.lock().await.record.clone());
        }
        out
    }

    /// Seed from persisted records. Rows with a newer schema than this
    /// build understands are refused rather than downgraded.
    pub fn restore(&self, rows: Vec<(FactRecord, Vec<IdempotencyKey>)>) -> Result<()> {
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        for (record, keys) in rows {
            if record.schema_version > CURRENT_SCHEMA_VERSION {
                return Err(CartographError::validation(format!(
                    "fact record for {} has schema version {} (this build supports {})",
                    record.entity_id, record.schema_version, CURRENT_SCHEMA_VERSION
                )));
            }
            let mut facts = EntityFacts::new(record.clone(), Vec::new());
            for key in keys {
                facts.remember(key, self.retention);
            }
            entities.insert(record.entity_id.clone(), Arc::new(AsyncMutex::new(facts)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_shared::{AgentType, JobId, groups};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn delta(key_job: &JobId, value: serde_json::Value, confidence: f64, evidence: &[&str]) -> FactDelta {
        let entity = EntityId::new("example.co.uk");
        FactDelta {
            agent_type: AgentType::SeoMetrics,
            idempotency_key: IdempotencyKey::derive(key_job, &entity),
            entity_id: entity,
            group_name: groups::SEO_METRICS.into(),
            value,
            confidence,
            evidence: evidence.iter().map(|s| s.to_string()).collect(),
            produced_at: Utc::now(),
            error: None,
        }
    }

    #[tokio::test]
    async fn redelivery_is_a_no_op() {
        let merger = FactMerger::new(256, None);
        let job = JobId::new();
        let d = delta(&job, json!({"domain_rating": 54}), 1.0, &[]);

        let first = merger.apply(&d).await.unwrap();
        assert!(first.applied);
        for _ in 0..5 {
            let again = merger.apply(&d).await.unwrap();
            assert!(!again.applied);
            assert_eq!(again.record, first.record);
        }
    }

    #[tokio::test]
    async fn later_delta_supersedes_group() {
        let merger = FactMerger::new(256, None);
        let d1 = delta(&JobId::new(), json!({"domain_rating": 54}), 0.8, &["single source"]);
        let mut d2 = delta(&JobId::new(), json!({"domain_rating": 61}), 0.6, &["DR 61 vs DA 20"]);
        d2.produced_at = d1.produced_at + Duration::seconds(1);

        merger.apply(&d1).await.unwrap();
        let out = merger.apply(&d2).await.unwrap();
        let group = out.record.group(groups::SEO_METRICS).unwrap();
        assert_eq!(group.value, json!({"domain_rating": 61}));
        assert_eq!(group.confidence, 0.6);
        assert_eq!(group.evidence, vec!["DR 61 vs DA 20"]);
        assert_eq!(out.record.last_updated_at, Some(d2.produced_at));
    }

    #[tokio::test]
    async fn invalid_delta_is_rejected() {
        let merger = FactMerger::new(256, None);
        let d = delta(&JobId::new(), json!({}), 0.5, &[]);
        assert!(merger.apply(&d).await.is_err());
        assert!(merger.get(&d.entity_id).await.is_none());
    }

    #[tokio::test]
    async fn applied_window_is_bounded() {
        let merger = FactMerger::new(2, None);
        let first = delta(&JobId::new(), json!({"v": 1}), 1.0, &[]);
        merger.apply(&first).await.unwrap();
        merger.apply(&delta(&JobId::new(), json!({"v": 2}), 1.0, &[])).await.unwrap();
        merger.apply(&delta(&JobId::new(), json!({"v": 3}), 1.0, &[])).await.unwrap();

        // The oldest key fell out of the window
        assert!(merger.apply(&first).await.unwrap().applied);
    }

    #[tokio::test]
    async fn concurrent_redelivery_applies_once() {
        let merger = Arc::new(FactMerger::new(256, None));
        let d = delta(&JobId::new(), json!({"v": 1}), 1.0, &[]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let merger = merger.clone();
                let d = d.clone();
                tokio::spawn(async move { merger.apply(&d).await.unwrap().applied })
            })
            .collect();
        let mut applied = 0;
        for h in handles {
            if h.await.unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn failure_note_keeps_groups() {
        let merger = FactMerger::new(256, None);
        let d = delta(&JobId::new(), json!({"v": 1}), 1.0, &[]);
        merger.apply(&d).await.unwrap();

        let note = FailureNote {
            agent_type: AgentType::SeoMetrics,
            job_id: JobId::new(),
            reason: "recoverable: timeout".into(),
            at: Utc::now(),
        };
        merger.record_failure(&d.entity_id, note.clone()).await.unwrap();
        let record = merger.get(&d.entity_id).await.unwrap();
        assert_eq!(record.last_failure, Some(note));
        assert!(record.group(groups::SEO_METRICS).is_some());
    }

    #[tokio::test]
    async fn writes_through_and_restores() {
        let db_path =
            std::env::temp_dir().join(format!("cg_test_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&db_path).await.unwrap());
        let merger = FactMerger::new(256, Some(storage.clone()));
        let d = delta(&JobId::new(), json!({"v": 1}), 1.0, &[]);
        merger.apply(&d).await.unwrap();

        let restored = FactMerger::new(256, None);
        restored.restore(storage.list_fact_records().await.unwrap()).unwrap();
        assert!(!restored.apply(&d).await.unwrap().applied);
        assert_eq!(
            restored.get(&d.entity_id).await,
            merger.get(&d.entity_id).await
        );

        let _ = std::fs::remove_file(&db_path);
    }
}
