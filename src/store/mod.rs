// src/store/mod.rs
//
// Collaborators the reconciliation engine talks to. The engine only sees these
// traits; `memory` backs tests and dry runs, `postgres` backs production.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ReconError, ReconResult};
use crate::models::core::{ExternalRecord, ExternalRef, SourceSystem};
use crate::models::mapping::{MappingFilter, MappingRecord, MappingUpdate, NewMapping};
use crate::models::stats_models::{RunStatus, RunSummary};

pub mod memory;
pub mod postgres;

/// One page of mirrored rows. `total` counts rejected rows too.
#[derive(Debug, Default)]
pub struct RecordPage {
    pub data: Vec<ExternalRecord>,
    /// Rows that could not be decoded, as `ReconError::Record`.
    pub rejected: Vec<ReconError>,
    pub total: usize,
}

/// Everything one provider served across all pages.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub records: Vec<ExternalRecord>,
    pub rejected: Vec<ReconError>,
}

/// Mirrored records of one system.
#[async_trait]
pub trait RecordProvider: Send + Sync {
    fn system(&self) -> SourceSystem;

    async fn list_records(&self, limit: usize, offset: usize) -> ReconResult<RecordPage>;
}

/// Durable table of canonical mappings. Implementations must reject a write
/// that would make two mappings reference the same `(system, external_id)`
/// with `ReconError::ConstraintViolation`, and apply each write atomically.
/// `update` must also fail with `ConstraintViolation` when a side listed in
/// `MappingUpdate::expect_empty` holds a different id at write time.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn find_by_external_id(
        &self,
        system: SourceSystem,
        external_id: &str,
    ) -> ReconResult<Option<MappingRecord>>;

    async fn get(&self, mapping_id: &str) -> ReconResult<Option<MappingRecord>>;

    async fn create(&self, mapping: NewMapping) -> ReconResult<MappingRecord>;

    async fn update(&self, mapping_id: &str, update: MappingUpdate) -> ReconResult<MappingRecord>;

    async fn list_mappings(&self, filter: &MappingFilter) -> ReconResult<Vec<MappingRecord>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub status: String,
    pub details: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: &str,
        entity_type: &str,
        entity_id: &str,
        status: &str,
        details: JsonValue,
    ) -> Self {
        Self {
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            status: status.to_string(),
            details,
            recorded_at: Utc::now(),
        }
    }
}

/// Fire-and-forget audit trail. Callers log failures and move on.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_event(&self, event: AuditEvent) -> ReconResult<()>;
}

/// Audit sink that only writes to the log.
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record_event(&self, event: AuditEvent) -> ReconResult<()> {
        debug!(
            "audit: {} {} '{}' -> {} ({})",
            event.action, event.entity_type, event.entity_id, event.status, event.details
        );
        Ok(())
    }
}

/// Persists bulk-run progress keyed by run id.
#[async_trait]
pub trait RunTracker: Send + Sync {
    async fn start_run(&self, run_id: &str, description: Option<&str>) -> ReconResult<()>;

    async fn record_progress(
        &self,
        run_id: &str,
        processed: usize,
        total: usize,
    ) -> ReconResult<()>;

    async fn finish_run(
        &self,
        run_id: &str,
        summary: &RunSummary,
        status: RunStatus,
    ) -> ReconResult<()>;
}

/// Pushes linked ids back into the master system's own record.
#[async_trait]
pub trait IdentifierWriteBack: Send + Sync {
    async fn write_back(&self, master: &ExternalRef, mapping: &MappingRecord) -> ReconResult<()>;
}

/// Default write-back when no master-system client is wired in.
pub struct LoggingWriteBack;

#[async_trait]
impl IdentifierWriteBack for LoggingWriteBack {
    async fn write_back(&self, master: &ExternalRef, mapping: &MappingRecord) -> ReconResult<()> {
        debug!(
            "Write-back for {} skipped (no client configured); mapping {} links {:?}",
            master,
            mapping.id,
            mapping.linked_refs()
        );
        Ok(())
    }
}

/// Pages through a provider until `total` rows (or an empty page) are seen.
pub async fn load_all_records(
    provider: &dyn RecordProvider,
    page_size: usize,
) -> ReconResult<LoadedRecords> {
    let page_size = page_size.max(1);
    let mut loaded = LoadedRecords::default();
    let mut offset = 0;
    loop {
        let page = provider.list_records(page_size, offset).await?;
        let fetched = page.data.len() + page.rejected.len();
        loaded.records.extend(page.data);
        loaded.rejected.extend(page.rejected);
        offset += fetched;
        if fetched == 0 || offset >= page.total {
            break;
        }
    }
    debug!(
        "Loaded {} {} records ({} rejected)",
        loaded.records.len(),
        provider.system(),
        loaded.rejected.len()
    );
    Ok(loaded)
}
