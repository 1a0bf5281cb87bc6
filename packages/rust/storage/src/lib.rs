//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the pipeline's
//! durable state: enrolled entities, the merged fact record per entity,
//! jobs (active, retired and dead-lettered), circuit breaker state per
//! provider, the change detector's rolling snapshots, and the append-only
//! change-record history.
//!
//! **Access rules:**
//! - The pipeline process: read-write (sole writer) via [`Storage::open`]
//! - Inspection commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};

use cartograph_shared::{
    CartographError, ChangeRecord, Entity, EntityId, FactRecord, IdempotencyKey, Job, JobId,
    JobStatus, ProviderState, Result, TimeRange,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CartographError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CartographError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CartographError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Entity operations
    // -----------------------------------------------------------------------

    /// Enroll an entity. Re-enrolling an existing entity is a no-op.
    pub async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        self.check_writable()?;
        let kind = serde_json::to_value(entity.kind())
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO entities (entity_id, kind, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity_id) DO NOTHING",
                params![
                    entity.entity_id.as_str(),
                    kind.as_str().unwrap_or("domain"),
                    i64::from(entity.priority),
                    entity.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Soft-delete an entity; it stops being scheduled.
    pub async fn mark_entity_deleted(&self, entity_id: &EntityId) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE entities SET deleted_at = ?1 WHERE entity_id = ?2",
                params![Utc::now().to_rfc3339(), entity_id.as_str()],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        Ok(())
    }

    /// List all live (not deleted) entities, oldest first.
    pub async fn list_entities(&self) -> Result<Vec<Entity>> {
        self.query_entities(
            "SELECT entity_id, priority, created_at FROM entities
             WHERE deleted_at IS NULL ORDER BY created_at, entity_id",
        )
        .await
    }

    /// Soft-deleted entities, oldest first.
    pub async fn list_deleted_entities(&self) -> Result<Vec<Entity>> {
        self.query_entities(
            "SELECT entity_id, priority, created_at FROM entities
             WHERE deleted_at IS NOT NULL ORDER BY created_at, entity_id",
        )
        .await
    }

    async fn query_entities(&self, sql: &str) -> Result<Vec<Entity>> {
        let mut rows = self
            .conn
            .query(sql, params![])
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| CartographError::Storage(e.to_string()))?;
            let priority = row.get::<i64>(1).unwrap_or(5);
            let created_at = parse_ts(&row.get::<String>(2).map_err(|e| {
                CartographError::Storage(e.to_string())
            })?)?;
            results.push(Entity {
                entity_id: EntityId::new(id),
                created_at,
                priority: u8::try_from(priority).unwrap_or(u8::MAX),
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Fact record operations
    // -----------------------------------------------------------------------

    /// Upsert the merged record for an entity together with its applied keys.
    ///
    /// The stored row is never replaced by one with a lower schema version.
    pub async fn upsert_fact_record(
        &self,
        record: &FactRecord,
        applied_keys: &[IdempotencyKey],
    ) -> Result<()> {
        self.check_writable()?;
        let record_json = serde_json::to_string(record)
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        let keys_json = serde_json::to_string(applied_keys)
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO fact_records (entity_id, schema_version, last_updated_at, record_json, applied_keys_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(entity_id) DO UPDATE SET
                   schema_version = excluded.schema_version,
                   last_updated_at = excluded.last_updated_at,
                   record_json = excluded.record_json,
                   applied_keys_json = excluded.applied_keys_json
                 WHERE excluded.schema_version >= fact_records.schema_version",
                params![
                    record.entity_id.as_str(),
                    i64::from(record.schema_version),
                    record.last_updated_at.map(|t| t.to_rfc3339()),
                    record_json,
                    keys_json,
                ],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get the merged record for an entity and its applied-key window.
    pub async fn get_fact_record(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<(FactRecord, Vec<IdempotencyKey>)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json, applied_keys_json FROM fact_records WHERE entity_id = ?1",
                params![entity_id.as_str()],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_fact_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(CartographError::Storage(e.to_string())),
        }
    }

    /// All stored fact records with their applied keys.
    pub async fn list_fact_records(&self) -> Result<Vec<(FactRecord, Vec<IdempotencyKey>)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json, applied_keys_json FROM fact_records ORDER BY entity_id",
                params![],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_fact_record(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Job operations
    // -----------------------------------------------------------------------

    /// Insert or update a job (keyed by `job_id`).
    pub async fn upsert_job(&self, job: &Job) -> Result<()> {
        self.check_writable()?;
        let job_json =
            serde_json::to_string(job).map_err(|e| CartographError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO jobs (job_id, agent_type, entity_id, status, priority, attempt_count,
                                   idempotency_key, provider_id, scheduled_at, not_before, job_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(job_id) DO UPDATE SET
                   status = excluded.status,
                   priority = excluded.priority,
                   attempt_count = excluded.attempt_count,
                   not_before = excluded.not_before,
                   job_json = excluded.job_json,
                   updated_at = excluded.updated_at",
                params![
                    job.job_id.to_string(),
                    job.agent_type.as_str(),
                    job.entity_id.as_str(),
                    job.status.as_str(),
                    i64::from(job.priority),
                    i64::from(job.attempt_count),
                    job.idempotency_key.as_str(),
                    job.provider_id.as_deref(),
                    job.scheduled_at.to_rfc3339(),
                    job.not_before.to_rfc3339(),
                    job_json,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a job by id.
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_json FROM jobs WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(CartographError::Storage(e.to_string())),
        }
    }

    /// List jobs in one status, or all jobs when `status` is `None`.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut rows = match status {
            Some(status) => {
                self.conn
                    .query(
                        "SELECT job_json FROM jobs WHERE status = ?1 ORDER BY scheduled_at",
                        params![status.as_str()],
                    )
                    .await
            }
            None => {
                self.conn
                    .query("SELECT job_json FROM jobs ORDER BY scheduled_at", params![])
                    .await
            }
        }
        .map_err(|e| CartographError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }

    /// Jobs that still need the pipeline: queued, running and dead-lettered.
    pub async fn list_pending_jobs(&self) -> Result<Vec<Job>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_json FROM jobs
                 WHERE status IN ('queued', 'running', 'dead_lettered')
                 ORDER BY scheduled_at",
                params![],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }

    /// Number of succeeded and cancelled jobs.
    pub async fn count_retired_jobs(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM jobs WHERE status IN ('succeeded', 'cancelled')",
                params![],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map(|n| n as usize).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(CartographError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Provider state operations
    // -----------------------------------------------------------------------

    /// Persist a breaker snapshot.
    pub async fn upsert_provider_state(&self, state: &ProviderState) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO provider_state (provider_id, state, consecutive_failures, opened_at,
                                             next_probe_at, cooldown_secs, open_events, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(provider_id) DO UPDATE SET
                   state = excluded.state,
                   consecutive_failures = excluded.consecutive_failures,
                   opened_at = excluded.opened_at,
                   next_probe_at = excluded.next_probe_at,
                   cooldown_secs = excluded.cooldown_secs,
                   open_events = excluded.open_events,
                   updated_at = excluded.updated_at",
                params![
                    state.provider_id.as_str(),
                    state.state.as_str(),
                    i64::from(state.consecutive_failures),
                    state.opened_at.map(|t| t.to_rfc3339()),
                    state.next_probe_at.map(|t| t.to_rfc3339()),
                    state.cooldown_secs as i64,
                    state.open_events as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        Ok(())
    }

    /// All persisted breaker snapshots.
    pub async fn list_provider_states(&self) -> Result<Vec<ProviderState>> {
        let mut rows = self
            .conn
            .query(
                "SELECT provider_id, state, consecutive_failures, opened_at, next_probe_at,
                        cooldown_secs, open_events
                 FROM provider_state ORDER BY provider_id",
                params![],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_provider_state(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Change record operations (append-only)
    // -----------------------------------------------------------------------

    /// Append the change record produced under `key`. Returns `false` when
    /// a record for that key is already stored. Existing rows cannot be
    /// updated or deleted.
    pub async fn append_change_record(
        &self,
        key: &IdempotencyKey,
        record: &ChangeRecord,
    ) -> Result<bool> {
        self.check_writable()?;
        let record_json = serde_json::to_string(record)
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO change_records (entity_id, period_start, period_end,
                                                       period_month, trending_score, record_json,
                                                       recorded_at, idempotency_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.entity_id.as_str(),
                    record.period_start.to_rfc3339(),
                    record.period_end.to_rfc3339(),
                    record.period_end.format("%Y-%m").to_string(),
                    record.trending_score,
                    record_json,
                    Utc::now().to_rfc3339(),
                    key.as_str(),
                ],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        Ok(inserted > 0)
    }

    /// Change records for an entity whose `period_end` falls in `range`, oldest first.
    pub async fn list_change_records(
        &self,
        entity_id: &EntityId,
        range: TimeRange,
    ) -> Result<Vec<ChangeRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM change_records WHERE entity_id = ?1 ORDER BY id",
                params![entity_id.as_str()],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let json: String = row
                .get(0)
                .map_err(|e| CartographError::Storage(e.to_string()))?;
            let record: ChangeRecord = serde_json::from_str(&json)
                .map_err(|e| CartographError::Storage(format!("invalid change record: {e}")))?;
            if range.contains(record.period_end) {
                results.push(record);
            }
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Snapshot operations
    // -----------------------------------------------------------------------

    /// Store a snapshot and drop all but the newest `retain` for the entity.
    /// A second snapshot at the same `taken_at` is ignored.
    pub async fn append_snapshot(
        &self,
        taken_at: DateTime<Utc>,
        record: &FactRecord,
        retain: usize,
    ) -> Result<()> {
        self.check_writable()?;
        let record_json = serde_json::to_string(record)
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO snapshots (entity_id, taken_at, record_json)
                 VALUES (?1, ?2, ?3)",
                params![record.entity_id.as_str(), taken_at.to_rfc3339(), record_json],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "DELETE FROM snapshots WHERE entity_id = ?1 AND id NOT IN (
                     SELECT id FROM snapshots WHERE entity_id = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                params![record.entity_id.as_str(), retain as i64],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Stored snapshots for an entity, oldest first.
    pub async fn list_snapshots(
        &self,
        entity_id: &EntityId,
    ) -> Result<Vec<(DateTime<Utc>, FactRecord)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT taken_at, record_json FROM snapshots WHERE entity_id = ?1 ORDER BY id",
                params![entity_id.as_str()],
            )
            .await
            .map_err(|e| CartographError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let taken_at = parse_ts(&row.get::<String>(0).map_err(|e| {
                CartographError::Storage(e.to_string())
            })?)?;
            let json: String = row
                .get(1)
                .map_err(|e| CartographError::Storage(e.to_string()))?;
            let record = serde_json::from_str(&json)
                .map_err(|e| CartographError::Storage(format!("invalid snapshot: {e}")))?;
            results.push((taken_at, record));
        }
        Ok(results)
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CartographError::Storage(format!("invalid date: {e}")))
}

/// Convert a `(record_json, applied_keys_json)` row.
fn row_to_fact_record(row: &libsql::Row) -> Result<(FactRecord, Vec<IdempotencyKey>)> {
    let record_json: String = row
        .get(0)
        .map_err(|e| CartographError::Storage(e.to_string()))?;
    let keys_json: String = row
        .get(1)
        .map_err(|e| CartographError::Storage(e.to_string()))?;
    let record = serde_json::from_str(&record_json)
        .map_err(|e| CartographError::Storage(format!("invalid fact record: {e}")))?;
    let keys = serde_json::from_str(&keys_json)
        .map_err(|e| CartographError::Storage(format!("invalid applied keys: {e}")))?;
    Ok((record, keys))
}

fn row_to_job(row: &libsql::Row) -> Result<Job> {
    let json: String = row
        .get(0)
        .map_err(|e| CartographError::Storage(e.to_string()))?;
    serde_json::from_str(&json).map_err(|e| CartographError::Storage(format!("invalid job: {e}")))
}

fn row_to_provider_state(row: &libsql::Row) -> Result<ProviderState> {
    let state: String = row
        .get(1)
        .map_err(|e| CartographError::Storage(e.to_string()))?;
    Ok(ProviderState {
        provider_id: row
            .get::<String>(0)
            .map_err(|e| CartographError::Storage(e.to_string()))?,
        state: state.parse()?,
        consecutive_failures: row
            .get::<i64>(2)
            .map(|v| v as u32)
            .map_err(|e| CartographError::Storage(e.to_string()))?,
        opened_at: row.get::<String>(3).ok().map(|s| parse_ts(&s)).transpose()?,
        next_probe_at: row.get::<String>(4).ok().map(|s| parse_ts(&s)).transpose()?,
        cooldown_secs: row
            .get::<i64>(5)
            .map(|v| v as u64)
            .map_err(|e| CartographError::Storage(e.to_string()))?,
        open_events: row.get::<i64>(6).map(|v| v as u64).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_shared::{
        AgentType, CircuitState, FactGroup, FieldDelta, PassKind, groups,
    };
    use chrono::Duration;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("cg_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn change_record(entity: &str, period_end: DateTime<Utc>) -> ChangeRecord {
        let mut field_deltas = BTreeMap::new();
        field_deltas.insert(
            "seo_metrics.organic_traffic_estimate".to_string(),
            FieldDelta {
                before: 1000.0,
                after: 1250.0,
                absolute: 250.0,
                percent: Some(25.0),
            },
        );
        ChangeRecord {
            entity_id: EntityId::new(entity),
            period_start: period_end - Duration::days(30),
            period_end,
            field_deltas,
            trending_score: 6.2,
            feature_gains: vec!["shopping_carousel".into()],
            feature_losses: vec![],
            keyword_wins: 2,
            keyword_losses: 0,
            alert_reason: Some("traffic_up_25%".into()),
            pass: PassKind::Full,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("cg_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn entity_enrollment_is_idempotent() {
        let storage = test_storage().await;
        let entity = Entity::new(EntityId::new("example.co.uk"), Utc::now());

        storage.insert_entity(&entity).await.expect("insert");
        storage.insert_entity(&entity).await.expect("re-insert");
        storage
            .insert_entity(&Entity::new(EntityId::keyword_batch(0), Utc::now()))
            .await
            .expect("insert batch");

        let entities = storage.list_entities().await.expect("list");
        assert_eq!(entities.len(), 2);

        storage
            .mark_entity_deleted(&EntityId::new("example.co.uk"))
            .await
            .expect("delete");
        let entities = storage.list_entities().await.expect("list");
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_id, EntityId::keyword_batch(0));

        let deleted = storage.list_deleted_entities().await.expect("list deleted");
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].entity_id, EntityId::new("example.co.uk"));
    }

    #[tokio::test]
    async fn fact_record_upsert_and_query() {
        let storage = test_storage().await;
        let entity = EntityId::new("example.co.uk");
        let job = Job::new(AgentType::DomainClassifier, entity.clone(), 8, None, Utc::now());

        let mut record = FactRecord::new(entity.clone());
        record.last_updated_at = Some(Utc::now());
        record.groups.insert(
            groups::CLASSIFICATION.into(),
            FactGroup {
                value: serde_json::json!({"qualifies": true}),
                confidence: 0.8,
                evidence: vec!["checkout path found".into()],
                agent_type: AgentType::DomainClassifier,
                updated_at: Utc::now(),
                idempotency_key: job.idempotency_key.clone(),
            },
        );

        storage
            .upsert_fact_record(&record, &[job.idempotency_key.clone()])
            .await
            .expect("upsert");

        let (found, keys) = storage
            .get_fact_record(&entity)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(found, record);
        assert_eq!(keys, vec![job.idempotency_key.clone()]);

        assert!(
            storage
                .get_fact_record(&EntityId::new("missing.co.uk"))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn fact_record_never_regresses_schema_version() {
        let storage = test_storage().await;
        let entity = EntityId::new("example.co.uk");

        let mut newer = FactRecord::new(entity.clone());
        newer.schema_version = 2;
        storage.upsert_fact_record(&newer, &[]).await.unwrap();

        let older = FactRecord::new(entity.clone());
        storage.upsert_fact_record(&older, &[]).await.unwrap();

        let (found, _) = storage.get_fact_record(&entity).await.unwrap().unwrap();
        assert_eq!(found.schema_version, 2);
    }

    #[tokio::test]
    async fn job_lifecycle() {
        let storage = test_storage().await;
        let mut job = Job::new(
            AgentType::SeoMetrics,
            EntityId::new("example.co.uk"),
            5,
            Some("backlinks".into()),
            Utc::now(),
        );
        storage.upsert_job(&job).await.expect("insert job");

        job.attempt_count = 6;
        job.status = JobStatus::DeadLettered;
        job.record(Utc::now(), "recoverable", Some("timeout".into()));
        storage.upsert_job(&job).await.expect("update job");

        let found = storage.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(found.status, JobStatus::DeadLettered);
        assert_eq!(found.attempt_count, 6);
        assert_eq!(found.history.len(), 1);

        let dead = storage
            .list_jobs(Some(JobStatus::DeadLettered))
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert!(storage.list_jobs(Some(JobStatus::Queued)).await.unwrap().is_empty());
        assert_eq!(storage.list_jobs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_jobs_skip_retired_ones() {
        let storage = test_storage().await;
        let entity = EntityId::new("example.co.uk");
        let now = Utc::now();
        for (agent, status) in [
            (AgentType::DomainClassifier, JobStatus::Succeeded),
            (AgentType::TechStack, JobStatus::Cancelled),
            (AgentType::SeoMetrics, JobStatus::DeadLettered),
            (AgentType::ChangeTracking, JobStatus::Running),
            (AgentType::IntentScoring, JobStatus::Queued),
        ] {
            let mut job = Job::new(agent, entity.clone(), 5, None, now);
            job.status = status;
            storage.upsert_job(&job).await.unwrap();
        }

        let pending = storage.list_pending_jobs().await.unwrap();
        let mut statuses: Vec<JobStatus> = pending.iter().map(|j| j.status).collect();
        statuses.sort_by_key(|s| s.as_str());
        assert_eq!(
            statuses,
            vec![JobStatus::DeadLettered, JobStatus::Queued, JobStatus::Running]
        );
        assert_eq!(storage.count_retired_jobs().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn provider_state_roundtrip() {
        let storage = test_storage().await;
        let now = Utc::now();
        let state = ProviderState {
            provider_id: "serp".into(),
            state: CircuitState::Open,
            consecutive_failures: 5,
            opened_at: Some(now),
            next_probe_at: Some(now + Duration::seconds(60)),
            cooldown_secs: 60,
            open_events: 1,
        };
        storage.upsert_provider_state(&state).await.expect("upsert");

        let states = storage.list_provider_states().await.expect("list");
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].state, CircuitState::Open);
        assert_eq!(states[0].consecutive_failures, 5);
        assert!(states[0].next_probe_at.is_some());
    }

    #[tokio::test]
    async fn change_records_are_append_only() {
        let storage = test_storage().await;
        let now = Utc::now();
        let entity = EntityId::new("example.co.uk");
        let first = IdempotencyKey::derive(&JobId::new(), &entity);
        let second = IdempotencyKey::derive(&JobId::new(), &entity);
        let earlier = change_record("example.co.uk", now - Duration::days(30));
        assert!(
            storage
                .append_change_record(&first, &earlier)
                .await
                .expect("append first")
        );
        assert!(
            storage
                .append_change_record(&second, &change_record("example.co.uk", now))
                .await
                .expect("append second")
        );
        // A redelivered job carries the same key
        assert!(
            !storage
                .append_change_record(&second, &change_record("example.co.uk", now))
                .await
                .expect("append again")
        );

        let all = storage
            .list_change_records(&EntityId::new("example.co.uk"), TimeRange::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].period_end < all[1].period_end);

        let recent = storage
            .list_change_records(
                &EntityId::new("example.co.uk"),
                TimeRange {
                    since: Some(now - Duration::days(1)),
                    until: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);

        let update = storage
            .conn
            .execute("UPDATE change_records SET trending_score = 0", params![])
            .await;
        assert!(update.is_err());
        let delete = storage
            .conn
            .execute("DELETE FROM change_records", params![])
            .await;
        assert!(delete.is_err());
    }

    #[tokio::test]
    async fn snapshots_keep_the_newest() {
        let storage = test_storage().await;
        let entity = EntityId::new("example.co.uk");
        let t0 = Utc::now() - Duration::days(90);
        for month in 0..3 {
            let mut record = FactRecord::new(entity.clone());
            record.last_updated_at = Some(t0 + Duration::days(30 * month));
            storage
                .append_snapshot(t0 + Duration::days(30 * month), &record, 2)
                .await
                .expect("append snapshot");
        }
        // Same instant again is ignored
        storage
            .append_snapshot(t0 + Duration::days(60), &FactRecord::new(entity.clone()), 2)
            .await
            .expect("append duplicate");

        let snapshots = storage.list_snapshots(&entity).await.expect("list");
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].0.timestamp(), (t0 + Duration::days(30)).timestamp());
        assert_eq!(snapshots[1].0.timestamp(), (t0 + Duration::days(60)).timestamp());
        assert_eq!(
            snapshots[1].1.last_updated_at.map(|t| t.timestamp()),
            Some((t0 + Duration::days(60)).timestamp())
        );
        assert!(
            storage
                .list_snapshots(&EntityId::new("other.co.uk"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("cg_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_entity(&Entity::new(EntityId::new("a.co.uk"), Utc::now()))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro
            .insert_entity(&Entity::new(EntityId::new("b.co.uk"), Utc::now()))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
        assert_eq!(ro.list_entities().await.unwrap().len(), 1);
    }
}
