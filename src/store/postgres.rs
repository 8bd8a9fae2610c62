// src/store/postgres.rs
//
// PostgreSQL-backed collaborators. Uniqueness of every (system, external id)
// pointer is enforced by partial unique indexes on `project_mapping`, so two
// writers racing for the same record cannot both succeed.
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{Map, Value as JsonValue};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

use crate::error::{ReconError, ReconResult};
use crate::models::core::{ExternalRecord, ExternalRef, RecordFields, SourceSystem};
use crate::models::mapping::{
    ConflictEntry, MappingFilter, MappingRecord, MappingUpdate, MatchType, NewMapping,
};
use crate::models::stats_models::{RunStatus, RunSummary};
use crate::store::{AuditEvent, AuditSink, MappingStore, RecordPage, RecordProvider, RunTracker};
use crate::utils::db_connect::PgPool;

const MAPPING_COLUMNS: &str = "id, pm_project_id, crm_deal_id, photo_project_id, \
     pm_name, crm_name, photo_name, match_type, match_score, conflicts, last_sync_at";

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS reconciliation;

CREATE TABLE IF NOT EXISTS reconciliation.project_mapping (
    id TEXT PRIMARY KEY,
    pm_project_id TEXT,
    crm_deal_id TEXT,
    photo_project_id TEXT,
    pm_name TEXT,
    crm_name TEXT,
    photo_name TEXT,
    match_type TEXT NOT NULL,
    match_score INTEGER,
    conflicts JSONB NOT NULL DEFAULT '[]'::jsonb,
    last_sync_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
    created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE UNIQUE INDEX IF NOT EXISTS project_mapping_pm_unique
    ON reconciliation.project_mapping (pm_project_id) WHERE pm_project_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS project_mapping_crm_unique
    ON reconciliation.project_mapping (crm_deal_id) WHERE crm_deal_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS project_mapping_photo_unique
    ON reconciliation.project_mapping (photo_project_id) WHERE photo_project_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS reconciliation.integration_credential (
    system TEXT PRIMARY KEY,
    access_token TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS reconciliation.mirrored_record (
    system TEXT NOT NULL,
    external_id TEXT NOT NULL,
    name TEXT,
    street_address TEXT,
    city TEXT,
    state TEXT,
    project_number TEXT,
    stage TEXT,
    estimated_value JSONB,
    embedded_cross_refs JSONB NOT NULL DEFAULT 'null'::jsonb,
    attributes JSONB NOT NULL DEFAULT '{}'::jsonb,
    synced_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (system, external_id)
);

CREATE TABLE IF NOT EXISTS reconciliation.audit_log (
    id BIGSERIAL PRIMARY KEY,
    action TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    status TEXT NOT NULL,
    details JSONB,
    recorded_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS reconciliation.match_run (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    description TEXT,
    processed INTEGER NOT NULL DEFAULT 0,
    total INTEGER NOT NULL DEFAULT 0,
    summary JSONB,
    started_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
    finished_at TIMESTAMPTZ
);
"#;

/// Creates the reconciliation schema and tables if they are missing.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for ensure_schema")?;
    conn.batch_execute(SCHEMA_SQL)
        .await
        .context("Failed to create reconciliation schema")?;
    info!("Reconciliation schema is in place");
    Ok(())
}

fn id_column(system: SourceSystem) -> &'static str {
    match system {
        SourceSystem::Pm => "pm_project_id",
        SourceSystem::Crm => "crm_deal_id",
        SourceSystem::Photo => "photo_project_id",
    }
}

/// Which side a unique-index name guards, e.g. `project_mapping_crm_unique`.
fn system_for_constraint(constraint: &str) -> Option<SourceSystem> {
    SourceSystem::ALL
        .iter()
        .copied()
        .find(|system| constraint.contains(&format!("_{}_", system.as_str())))
}

/// Turns a unique violation into `ConstraintViolation` for the matching ref in
/// `refs`; every other database error becomes `Store`.
fn map_write_error(e: tokio_postgres::Error, refs: &[ExternalRef], action: &str) -> ReconError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let system = e
            .as_db_error()
            .and_then(|db| db.constraint())
            .and_then(system_for_constraint);
        let violated = refs
            .iter()
            .find(|r| Some(r.system) == system)
            .or_else(|| refs.first());
        if let Some(r) = violated {
            debug!("Unique violation on {} during {}", r, action);
            return ReconError::ConstraintViolation {
                system: r.system,
                external_id: r.external_id.clone(),
            };
        }
    }
    anyhow::Error::new(e)
        .context(format!("Failed to {}", action))
        .into()
}

fn mapping_from_row(row: &Row) -> anyhow::Result<MappingRecord> {
    let match_type: String = row.try_get("match_type")?;
    let match_score: Option<i32> = row.try_get("match_score")?;
    let conflicts: JsonValue = row.try_get("conflicts")?;
    let conflicts: Vec<ConflictEntry> =
        serde_json::from_value(conflicts).context("Failed to decode mapping conflicts")?;
    Ok(MappingRecord {
        id: row.try_get("id")?,
        pm_project_id: row.try_get("pm_project_id")?,
        crm_deal_id: row.try_get("crm_deal_id")?,
        photo_project_id: row.try_get("photo_project_id")?,
        pm_name: row.try_get("pm_name")?,
        crm_name: row.try_get("crm_name")?,
        photo_name: row.try_get("photo_name")?,
        match_type: match_type.parse::<MatchType>().map_err(|e| anyhow!(e))?,
        match_score: match_score.and_then(|s| u32::try_from(s).ok()),
        conflicts,
        last_sync_at: row.try_get::<_, DateTime<Utc>>("last_sync_at")?,
    })
}

async fn select_mapping<C: GenericClient>(
    client: &C,
    where_clause: &str,
    params: &[&(dyn ToSql + Sync)],
) -> anyhow::Result<Option<MappingRecord>> {
    let sql = format!(
        "SELECT {} FROM reconciliation.project_mapping WHERE {}",
        MAPPING_COLUMNS, where_clause
    );
    let row = client
        .query_opt(sql.as_str(), params)
        .await
        .context("Failed to query project_mapping")?;
    row.as_ref().map(mapping_from_row).transpose()
}

pub struct PgMappingStore {
    pool: PgPool,
}

impl PgMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn find_by_external_id(
        &self,
        system: SourceSystem,
        external_id: &str,
    ) -> ReconResult<Option<MappingRecord>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for find_by_external_id")?;
        let where_clause = format!("{} = $1", id_column(system));
        Ok(select_mapping(&*conn, &where_clause, &[&external_id]).await?)
    }

    async fn get(&self, mapping_id: &str) -> ReconResult<Option<MappingRecord>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for get mapping")?;
        Ok(select_mapping(&*conn, "id = $1", &[&mapping_id]).await?)
    }

    async fn create(&self, mapping: NewMapping) -> ReconResult<MappingRecord> {
        let record = mapping.into_record(Uuid::new_v4().to_string(), Utc::now());
        let conflicts =
            serde_json::to_value(&record.conflicts).context("Failed to serialize conflicts")?;
        let match_score = record.match_score.map(|s| s as i32);

        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for create mapping")?;
        let sql = format!(
            "INSERT INTO reconciliation.project_mapping ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING {}",
            MAPPING_COLUMNS, MAPPING_COLUMNS
        );
        let row = conn
            .query_one(
                sql.as_str(),
                &[
                    &record.id,
                    &record.pm_project_id,
                    &record.crm_deal_id,
                    &record.photo_project_id,
                    &record.pm_name,
                    &record.crm_name,
                    &record.photo_name,
                    &record.match_type.as_str(),
                    &match_score,
                    &conflicts,
                    &record.last_sync_at,
                ],
            )
            .await
            .map_err(|e| map_write_error(e, &record.linked_refs(), "insert project_mapping"))?;
        Ok(mapping_from_row(&row)?)
    }

    async fn update(&self, mapping_id: &str, update: MappingUpdate) -> ReconResult<MappingRecord> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for update mapping")?;
        let transaction = conn
            .transaction()
            .await
            .context("Failed to start transaction for update mapping")?;

        let current = select_mapping(&transaction, "id = $1 FOR UPDATE", &[&mapping_id])
            .await?
            .ok_or_else(|| ReconError::MappingNotFound(mapping_id.to_string()))?;
        // The row lock is held from here; dropping the transaction rolls back.
        current.check_expected_empty(&update)?;
        let mut next = current;
        next.apply(&update, Utc::now());

        let conflicts =
            serde_json::to_value(&next.conflicts).context("Failed to serialize conflicts")?;
        let match_score = next.match_score.map(|s| s as i32);
        let sql = format!(
            "UPDATE reconciliation.project_mapping SET \
                pm_project_id = $2, crm_deal_id = $3, photo_project_id = $4, \
                pm_name = $5, crm_name = $6, photo_name = $7, \
                match_type = $8, match_score = $9, conflicts = $10, last_sync_at = $11 \
             WHERE id = $1 RETURNING {}",
            MAPPING_COLUMNS
        );
        let row = transaction
            .query_one(
                sql.as_str(),
                &[
                    &next.id,
                    &next.pm_project_id,
                    &next.crm_deal_id,
                    &next.photo_project_id,
                    &next.pm_name,
                    &next.crm_name,
                    &next.photo_name,
                    &next.match_type.as_str(),
                    &match_score,
                    &conflicts,
                    &next.last_sync_at,
                ],
            )
            .await
            .map_err(|e| map_write_error(e, &update.assigned_refs(), "update project_mapping"))?;
        let updated = mapping_from_row(&row)?;

        transaction
            .commit()
            .await
            .context("Failed to commit mapping update")?;
        Ok(updated)
    }

    async fn list_mappings(&self, filter: &MappingFilter) -> ReconResult<Vec<MappingRecord>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();

        if let Some(match_type) = filter.match_type {
            params.push(Box::new(match_type.as_str().to_string()));
            conditions.push(format!("match_type = ${}", params.len()));
        }
        if filter.conflicts_only {
            conditions.push("jsonb_array_length(conflicts) > 0".to_string());
        }
        if let Some(system) = filter.linked_system {
            conditions.push(format!("{} IS NOT NULL", id_column(system)));
        }

        let mut sql = format!("SELECT {} FROM reconciliation.project_mapping", MAPPING_COLUMNS);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at, id");
        if let Some(limit) = filter.limit {
            params.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ${}", params.len()));
        }
        params.push(Box::new(filter.offset as i64));
        sql.push_str(&format!(" OFFSET ${}", params.len()));

        let params_slice: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for list_mappings")?;
        let rows = conn
            .query(sql.as_str(), params_slice.as_slice())
            .await
            .context("Failed to list project mappings")?;
        let mappings = rows
            .iter()
            .map(mapping_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(mappings)
    }
}

/// Reads one system's mirrored records. Refuses to serve anything when the
/// system has no stored access token, since the mirror would be stale.
pub struct PgRecordProvider {
    system: SourceSystem,
    pool: PgPool,
}

impl PgRecordProvider {
    pub fn new(system: SourceSystem, pool: PgPool) -> Self {
        Self { system, pool }
    }

    pub fn all(pool: &PgPool) -> Vec<Self> {
        SourceSystem::ALL
            .iter()
            .map(|system| Self::new(*system, pool.clone()))
            .collect()
    }
}

fn string_attribute(attributes: &Map<String, JsonValue>, key: &str) -> Option<String> {
    attributes.get(key).and_then(JsonValue::as_str).map(str::to_string)
}

/// Decodes one mirrored row. Failures come back as `ReconError::Record` so the
/// run can count them against the row's id.
fn record_from_row(system: SourceSystem, row: &Row) -> ReconResult<ExternalRecord> {
    let external_id: String = row
        .try_get("external_id")
        .map_err(|e| ReconError::record(system, "", e.to_string()))?;
    if external_id.trim().is_empty() {
        return Err(ReconError::record(system, &external_id, "empty external id"));
    }
    let fields = fields_from_row(row, external_id.clone())
        .map_err(|e| ReconError::record(system, &external_id, e.to_string()))?;

    let mut record = ExternalRecord::from_fields(system, fields);
    match &mut record {
        ExternalRecord::Crm(crm) => {
            crm.pipeline = string_attribute(&crm.fields.attributes, "pipeline");
            crm.owner_email = string_attribute(&crm.fields.attributes, "ownerEmail");
        }
        ExternalRecord::Pm(pm) => {
            pm.project_manager = string_attribute(&pm.fields.attributes, "projectManager");
        }
        ExternalRecord::Photo(photo) => {
            photo.photo_count = photo
                .fields
                .attributes
                .get("photoCount")
                .and_then(JsonValue::as_i64);
        }
    }
    Ok(record)
}

fn fields_from_row(row: &Row, external_id: String) -> anyhow::Result<RecordFields> {
    let attributes = match row.try_get::<_, JsonValue>("attributes")? {
        JsonValue::Object(map) => map,
        JsonValue::Null => Map::new(),
        other => return Err(anyhow!("attributes is not an object: {}", other)),
    };
    Ok(RecordFields {
        external_id,
        name: row.try_get("name")?,
        street_address: row.try_get("street_address")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        project_number: row.try_get("project_number")?,
        stage: row.try_get("stage")?,
        estimated_value: row.try_get("estimated_value")?,
        embedded_cross_refs: row.try_get("embedded_cross_refs")?,
        attributes,
    })
}

#[async_trait]
impl RecordProvider for PgRecordProvider {
    fn system(&self) -> SourceSystem {
        self.system
    }

    async fn list_records(&self, limit: usize, offset: usize) -> ReconResult<RecordPage> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for list_records")?;

        let token: Option<String> = conn
            .query_opt(
                "SELECT access_token FROM reconciliation.integration_credential WHERE system = $1",
                &[&self.system.as_str()],
            )
            .await
            .context("Failed to read integration credential")?
            .map(|row| row.try_get::<_, Option<String>>("access_token"))
            .transpose()
            .context("Failed to decode integration credential")?
            .flatten();
        if token.map_or(true, |t| t.trim().is_empty()) {
            return Err(ReconError::Configuration {
                system: self.system,
                reason: "no access token stored".to_string(),
            });
        }

        let total: i64 = conn
            .query_one(
                "SELECT COUNT(*) FROM reconciliation.mirrored_record WHERE system = $1",
                &[&self.system.as_str()],
            )
            .await
            .context("Failed to count mirrored records")?
            .get(0);

        let rows = conn
            .query(
                "SELECT external_id, name, street_address, city, state, project_number, stage, \
                        estimated_value, embedded_cross_refs, attributes \
                 FROM reconciliation.mirrored_record WHERE system = $1 \
                 ORDER BY external_id LIMIT $2 OFFSET $3",
                &[&self.system.as_str(), &(limit as i64), &(offset as i64)],
            )
            .await
            .context("Failed to read mirrored records")?;

        let mut page = RecordPage {
            total: total.max(0) as usize,
            ..Default::default()
        };
        for row in &rows {
            match record_from_row(self.system, row) {
                Ok(record) => page.data.push(record),
                Err(e) => {
                    warn!("Rejecting malformed {} mirrored row: {}", self.system, e);
                    page.rejected.push(e);
                }
            }
        }
        Ok(page)
    }
}

pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record_event(&self, event: AuditEvent) -> ReconResult<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for audit_log")?;
        conn.execute(
            "INSERT INTO reconciliation.audit_log \
                 (action, entity_type, entity_id, status, details, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &event.action,
                &event.entity_type,
                &event.entity_id,
                &event.status,
                &event.details,
                &event.recorded_at,
            ],
        )
        .await
        .context("Failed to insert audit_log row")?;
        Ok(())
    }
}

/// One `match_run` row per bulk run.
pub struct PgRunTracker {
    pool: PgPool,
}

impl PgRunTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunTracker for PgRunTracker {
    async fn start_run(&self, run_id: &str, description: Option<&str>) -> ReconResult<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for start_run")?;
        conn.execute(
            "INSERT INTO reconciliation.match_run (id, status, description, started_at) \
             VALUES ($1, $2, $3, CURRENT_TIMESTAMP)",
            &[&run_id, &RunStatus::Running.as_str(), &description],
        )
        .await
        .context("Failed to insert match_run row")?;
        info!("Created match_run {}", run_id);
        Ok(())
    }

    async fn record_progress(
        &self,
        run_id: &str,
        processed: usize,
        total: usize,
    ) -> ReconResult<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for record_progress")?;
        let updated = conn
            .execute(
                "UPDATE reconciliation.match_run SET processed = $2, total = $3 \
                 WHERE id = $1 AND status = 'running'",
                &[&run_id, &(processed as i32), &(total as i32)],
            )
            .await
            .context("Failed to update match_run progress")?;
        if updated == 0 {
            return Err(anyhow!("run {} is not running", run_id).into());
        }
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &str,
        summary: &RunSummary,
        status: RunStatus,
    ) -> ReconResult<()> {
        if !RunStatus::Running.can_transition_to(status) {
            return Err(anyhow!("run {} cannot finish as {}", run_id, status.as_str()).into());
        }
        let summary_json =
            serde_json::to_value(summary).context("Failed to serialize run summary")?;
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for finish_run")?;
        let updated = conn
            .execute(
                "UPDATE reconciliation.match_run \
                 SET status = $2, processed = $3, summary = $4, finished_at = CURRENT_TIMESTAMP \
                 WHERE id = $1 AND status = 'running'",
                &[&run_id, &status.as_str(), &(summary.processed() as i32), &summary_json],
            )
            .await
            .context("Failed to finish match_run")?;
        if updated == 0 {
            return Err(anyhow!("run {} is not running", run_id).into());
        }
        Ok(())
    }
}
