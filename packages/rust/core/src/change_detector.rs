//! Rolling snapshots and the append-only change history.
//!
//! Both are written through to storage when it is attached, so a pass in a
//! later process diffs against the snapshot an earlier one took.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use cartograph_agents::Snapshot;
use cartograph_shared::{
    ChangeRecord, EntityId, FactRecord, IdempotencyKey, Result, TimeRange, groups,
};
use cartograph_storage::Storage;

#[derive(Default)]
struct History {
    snapshots: VecDeque<Snapshot>,
    records: Vec<ChangeRecord>,
    /// Keys whose change record has been appended in this process.
    keys: HashSet<IdempotencyKey>,
}

pub struct ChangeDetector {
    entities: Mutex<BTreeMap<EntityId, History>>,
    retention: usize,
    storage: Option<Arc<Storage>>,
}

impl ChangeDetector {
    pub fn new(retention: usize, storage: Option<Arc<Storage>>) -> Self {
        Self {
            entities: Mutex::new(BTreeMap::new()),
            retention: retention.max(1),
            storage,
        }
    }

    /// Most recent snapshot for an entity.
    pub fn prior_snapshot(&self, entity_id: &EntityId) -> Option<Snapshot> {
        let entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        entities.get(entity_id)?.snapshots.back().cloned()
    }

    /// Keep a snapshot of `record` as it stood at `taken_at`. The
    /// change-tracking group itself is left out so diffs never compare the
    /// detector's own output. A second capture at the same instant is a
    /// no-op.
    pub async fn capture(&self, record: &FactRecord, taken_at: DateTime<Utc>) -> Result<()> {
        let mut record = record.clone();
        record.groups.remove(groups::CHANGE_TRACKING);

        {
            let entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
            let seen = entities
                .get(&record.entity_id)
                .is_some_and(|h| h.snapshots.iter().any(|s| s.taken_at == taken_at));
            if seen {
                return Ok(());
            }
        }
        if let Some(storage) = &self.storage {
            storage
                .append_snapshot(taken_at, &record, self.retention)
                .await?;
        }

        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        let history = entities.entry(record.entity_id.clone()).or_default();
        history.snapshots.push_back(Snapshot { taken_at, record });
        while history.snapshots.len() > self.retention {
            history.snapshots.pop_front();
        }
        Ok(())
    }

    /// Append the change record a change-tracking job produced under `key`.
    /// Returns `false` when that key's record is already in the history.
    #[instrument(skip_all, fields(entity_id = %record.entity_id))]
    pub async fn append(&self, key: &IdempotencyKey, record: ChangeRecord) -> Result<bool> {
        {
            let entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
            if entities
                .get(&record.entity_id)
                .is_some_and(|h| h.keys.contains(key))
            {
                return Ok(false);
            }
        }

        let stored = match &self.storage {
            Some(storage) => storage.append_change_record(key, &record).await?,
            None => true,
        };
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        let history = entities.entry(record.entity_id.clone()).or_default();
        history.keys.insert(key.clone());
        if !stored {
            // Stored by an earlier process and restored from there
            debug!(key = %key, "change record already stored");
            return Ok(false);
        }
        if let Some(reason) = &record.alert_reason {
            info!(score = record.trending_score, reason = %reason, "change alert");
        }
        history.records.push(record);
        Ok(true)
    }

    /// Change records whose period ends inside `range`, oldest first.
    pub fn history(&self, entity_id: &EntityId, range: TimeRange) -> Vec<ChangeRecord> {
        let entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        let Some(history) = entities.get(entity_id) else {
            return Vec::new();
        };
        let mut out: Vec<ChangeRecord> = history
            .records
            .iter()
            .filter(|r| range.contains(r.period_end))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.period_end);
        out
    }

    /// Seed history from persisted change records.
    pub fn restore(&self, records: Vec<ChangeRecord>) {
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        for record in records {
            entities
                .entry(record.entity_id.clone())
                .or_default()
                .records
                .push(record);
        }
    }

    /// Seed an entity's snapshots, oldest first.
    pub fn restore_snapshots(
        &self,
        entity_id: &EntityId,
        snapshots: Vec<(DateTime<Utc>, FactRecord)>,
    ) {
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        let history = entities.entry(entity_id.clone()).or_default();
        for (taken_at, record) in snapshots {
            history.snapshots.push_back(Snapshot { taken_at, record });
        }
        while history.snapshots.len() > self.retention {
            history.snapshots.pop_front();
        }
    }
}
