// src/store/memory.rs
//
// In-process collaborators. The mapping store holds one lock across each
// check-and-write, which gives it the same uniqueness guarantee the database
// indexes give `PgMappingStore`.
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ReconError, ReconResult};
use crate::models::core::{ExternalRecord, ExternalRef, SourceSystem};
use crate::models::mapping::{MappingFilter, MappingRecord, MappingUpdate, NewMapping};
use crate::models::stats_models::{RunStatus, RunSummary};
use crate::store::{
    AuditEvent, AuditSink, IdentifierWriteBack, MappingStore, RecordPage, RecordProvider,
    RunTracker,
};

#[derive(Default)]
struct MappingTable {
    /// Creation order.
    rows: Vec<MappingRecord>,
    index: HashMap<ExternalRef, String>,
}

impl MappingTable {
    fn position(&self, mapping_id: &str) -> Option<usize> {
        self.rows.iter().position(|m| m.id == mapping_id)
    }

    fn check_unique(&self, refs: &[ExternalRef], owner: Option<&str>) -> ReconResult<()> {
        for r in refs {
            if let Some(existing) = self.index.get(r) {
                if Some(existing.as_str()) != owner {
                    return Err(ReconError::ConstraintViolation {
                        system: r.system,
                        external_id: r.external_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn reindex(&mut self, before: Option<&MappingRecord>, after: &MappingRecord) {
        if let Some(before) = before {
            for r in before.linked_refs() {
                self.index.remove(&r);
            }
        }
        for r in after.linked_refs() {
            self.index.insert(r, after.id.clone());
        }
    }
}

#[derive(Default)]
pub struct MemoryMappingStore {
    table: Mutex<MappingTable>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn find_by_external_id(
        &self,
        system: SourceSystem,
        external_id: &str,
    ) -> ReconResult<Option<MappingRecord>> {
        let table = self.table.lock().await;
        let key = ExternalRef::new(system, external_id);
        Ok(table
            .index
            .get(&key)
            .and_then(|id| table.position(id))
            .map(|i| table.rows[i].clone()))
    }

    async fn get(&self, mapping_id: &str) -> ReconResult<Option<MappingRecord>> {
        let table = self.table.lock().await;
        Ok(table.position(mapping_id).map(|i| table.rows[i].clone()))
    }

    async fn create(&self, mapping: NewMapping) -> ReconResult<MappingRecord> {
        let mut table = self.table.lock().await;
        let record = mapping.into_record(Uuid::new_v4().to_string(), Utc::now());
        table.check_unique(&record.linked_refs(), None)?;
        table.reindex(None, &record);
        table.rows.push(record.clone());
        Ok(record)
    }

    async fn update(&self, mapping_id: &str, update: MappingUpdate) -> ReconResult<MappingRecord> {
        let mut table = self.table.lock().await;
        let position = table
            .position(mapping_id)
            .ok_or_else(|| ReconError::MappingNotFound(mapping_id.to_string()))?;
        table.check_unique(&update.assigned_refs(), Some(mapping_id))?;
        table.rows[position].check_expected_empty(&update)?;

        let before = table.rows[position].clone();
        let mut after = before.clone();
        after.apply(&update, Utc::now());
        table.reindex(Some(&before), &after);
        table.rows[position] = after.clone();
        Ok(after)
    }

    async fn list_mappings(&self, filter: &MappingFilter) -> ReconResult<Vec<MappingRecord>> {
        let table = self.table.lock().await;
        let matching = table.rows.iter().filter(|m| filter.matches(m)).skip(filter.offset);
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        })
    }
}

/// Serves a fixed set of records, or refuses like a provider with no credential.
pub struct MemoryRecordProvider {
    system: SourceSystem,
    records: Vec<ExternalRecord>,
    /// `(external id, reason)` of rows served after `records` as rejects.
    rejected: Vec<(String, String)>,
    configured: bool,
}

impl MemoryRecordProvider {
    pub fn new(system: SourceSystem, records: Vec<ExternalRecord>) -> Self {
        Self {
            system,
            records,
            rejected: Vec::new(),
            configured: true,
        }
    }

    /// Adds a row the provider cannot decode.
    pub fn with_rejected(mut self, external_id: &str, reason: &str) -> Self {
        self.rejected.push((external_id.to_string(), reason.to_string()));
        self
    }

    pub fn unconfigured(system: SourceSystem) -> Self {
        Self {
            system,
            records: Vec::new(),
            rejected: Vec::new(),
            configured: false,
        }
    }
}

#[async_trait]
impl RecordProvider for MemoryRecordProvider {
    fn system(&self) -> SourceSystem {
        self.system
    }

    async fn list_records(&self, limit: usize, offset: usize) -> ReconResult<RecordPage> {
        if !self.configured {
            return Err(ReconError::Configuration {
                system: self.system,
                reason: "no access token stored".to_string(),
            });
        }
        let total = self.records.len() + self.rejected.len();
        let mut page = RecordPage {
            total,
            ..Default::default()
        };
        for i in offset..offset.saturating_add(limit).min(total) {
            match self.records.get(i) {
                Some(record) => page.data.push(record.clone()),
                None => {
                    let (external_id, reason) = &self.rejected[i - self.records.len()];
                    page.rejected
                        .push(ReconError::record(self.system, external_id, reason.as_str()));
                }
            }
        }
        Ok(page)
    }
}

#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: bool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every write fails.
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record_event(&self, event: AuditEvent) -> ReconResult<()> {
        if self.failing {
            return Err(anyhow!("audit sink unavailable").into());
        }
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub status: RunStatus,
    pub description: Option<String>,
    pub processed: usize,
    pub total: usize,
    pub summary: Option<RunSummary>,
}

#[derive(Default)]
pub struct MemoryRunTracker {
    runs: Mutex<HashMap<String, RunRow>>,
}

impl MemoryRunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run(&self, run_id: &str) -> Option<RunRow> {
        self.runs.lock().await.get(run_id).cloned()
    }

    pub async fn all(&self) -> Vec<(String, RunRow)> {
        let mut runs: Vec<(String, RunRow)> = self
            .runs
            .lock()
            .await
            .iter()
            .map(|(id, row)| (id.clone(), row.clone()))
            .collect();
        runs.sort_by(|a, b| a.0.cmp(&b.0));
        runs
    }
}

#[async_trait]
impl RunTracker for MemoryRunTracker {
    async fn start_run(&self, run_id: &str, description: Option<&str>) -> ReconResult<()> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(run_id) {
            return Err(anyhow!("run {} already exists", run_id).into());
        }
        runs.insert(
            run_id.to_string(),
            RunRow {
                status: RunStatus::Running,
                description: description.map(str::to_string),
                processed: 0,
                total: 0,
                summary: None,
            },
        );
        Ok(())
    }

    async fn record_progress(
        &self,
        run_id: &str,
        processed: usize,
        total: usize,
    ) -> ReconResult<()> {
        let mut runs = self.runs.lock().await;
        let row = runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow!("run {} not found", run_id))?;
        if row.status.is_terminal() {
            return Err(anyhow!("run {} is already {}", run_id, row.status.as_str()).into());
        }
        row.processed = processed;
        row.total = total;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &str,
        summary: &RunSummary,
        status: RunStatus,
    ) -> ReconResult<()> {
        let mut runs = self.runs.lock().await;
        let row = runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow!("run {} not found", run_id))?;
        if !row.status.can_transition_to(status) {
            return Err(anyhow!(
                "run {} cannot move from {} to {}",
                run_id,
                row.status.as_str(),
                status.as_str()
            )
            .into());
        }
        row.status = status;
        row.processed = summary.processed();
        row.summary = Some(summary.clone());
        Ok(())
    }
}

/// Records write-back calls instead of contacting the master system.
#[derive(Default)]
pub struct MemoryWriteBack {
    calls: Mutex<Vec<(ExternalRef, String)>>,
    failing: bool,
}

impl MemoryWriteBack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    /// `(master record, mapping id)` per call.
    pub async fn calls(&self) -> Vec<(ExternalRef, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl IdentifierWriteBack for MemoryWriteBack {
    async fn write_back(&self, master: &ExternalRef, mapping: &MappingRecord) -> ReconResult<()> {
        if self.failing {
            return Err(anyhow!("master system rejected write-back for {}", master).into());
        }
        self.calls.lock().await.push((master.clone(), mapping.id.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mapping::MatchType;
    use crate::store::load_all_records;
    use crate::models::core::RecordFields;

    fn pm_photo(pm: &str, photo: &str) -> NewMapping {
        NewMapping::new(MatchType::Exact, None)
            .with_side(SourceSystem::Pm, pm, None)
            .with_side(SourceSystem::Photo, photo, None)
    }

    #[tokio::test]
    async fn test_create_enforces_uniqueness_per_side() {
        let store = MemoryMappingStore::new();
        store.create(pm_photo("pm-1", "photo-1")).await.unwrap();

        let err = store.create(pm_photo("pm-1", "photo-2")).await.unwrap_err();
        assert!(err.is_constraint_violation());
        let err = store.create(pm_photo("pm-2", "photo-1")).await.unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_moves_index_entries() {
        let store = MemoryMappingStore::new();
        let created = store.create(pm_photo("pm-1", "photo-1")).await.unwrap();

        let update = MappingUpdate::default()
            .clear_side(SourceSystem::Photo)
            .set_side(SourceSystem::Crm, "deal-1", Some("Smith"));
        let updated = store.update(&created.id, update).await.unwrap();
        assert_eq!(updated.crm_deal_id.as_deref(), Some("deal-1"));

        assert!(store.find_by_external_id(SourceSystem::Photo, "photo-1").await.unwrap().is_none());
        let found = store.find_by_external_id(SourceSystem::Crm, "deal-1").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);

        // photo-1 is free again
        store.create(pm_photo("pm-2", "photo-1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_rejects_ids_owned_elsewhere() {
        let store = MemoryMappingStore::new();
        let first = store.create(pm_photo("pm-1", "photo-1")).await.unwrap();
        store.create(pm_photo("pm-2", "photo-2")).await.unwrap();

        let taken = MappingUpdate::default().set_side(SourceSystem::Photo, "photo-2", None);
        let err = store.update(&first.id, taken).await.unwrap_err();
        assert!(err.is_constraint_violation());

        // re-asserting its own id is fine
        let own = MappingUpdate::default().set_side(SourceSystem::Photo, "photo-1", None);
        store.update(&first.id, own).await.unwrap();

        let err = store.update("missing", MappingUpdate::default()).await.unwrap_err();
        assert!(matches!(err, ReconError::MappingNotFound(_)));
    }

    #[tokio::test]
    async fn test_fill_side_loses_to_the_first_writer() {
        let store = MemoryMappingStore::new();
        let created = store
            .create(
                NewMapping::new(MatchType::Exact, None)
                    .with_side(SourceSystem::Pm, "pm-1", None)
                    .with_side(SourceSystem::Crm, "deal-1", None),
            )
            .await
            .unwrap();

        let first = MappingUpdate::default().fill_side(SourceSystem::Photo, "photo-1", None);
        store.update(&created.id, first).await.unwrap();
        let late = MappingUpdate::default().fill_side(SourceSystem::Photo, "photo-9", None);
        let err = store.update(&created.id, late).await.unwrap_err();
        assert!(err.is_constraint_violation());

        let mapping = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(mapping.photo_project_id.as_deref(), Some("photo-1"));
        assert!(store.find_by_external_id(SourceSystem::Photo, "photo-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_mappings_paginates() {
        let store = MemoryMappingStore::new();
        for i in 0..5 {
            store.create(pm_photo(&format!("pm-{}", i), &format!("photo-{}", i))).await.unwrap();
        }
        let page = store
            .list_mappings(&MappingFilter { limit: Some(2), offset: 3, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].pm_project_id.as_deref(), Some("pm-3"));
    }

    #[tokio::test]
    async fn test_provider_pages_and_configuration_error() {
        let records = (0..5)
            .map(|i| ExternalRecord::pm(RecordFields::new(format!("pm-{}", i), "Project")))
            .collect();
        let provider = MemoryRecordProvider::new(SourceSystem::Pm, records)
            .with_rejected("pm-x", "attributes is not an object");
        let loaded = load_all_records(&provider, 2).await.unwrap();
        assert_eq!(loaded.records.len(), 5);
        assert_eq!(loaded.rejected.len(), 1);
        assert_eq!(
            loaded.rejected[0].to_string(),
            "malformed pm record 'pm-x': attributes is not an object"
        );

        let err = load_all_records(&MemoryRecordProvider::unconfigured(SourceSystem::Crm), 2)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_run_tracker_transitions() {
        let tracker = MemoryRunTracker::new();
        tracker.start_run("run-1", Some("nightly")).await.unwrap();
        assert!(tracker.start_run("run-1", None).await.is_err());
        tracker.record_progress("run-1", 3, 10).await.unwrap();

        let summary = RunSummary::new("run-1", Utc::now());
        tracker.finish_run("run-1", &summary, RunStatus::Completed).await.unwrap();
        assert!(tracker.finish_run("run-1", &summary, RunStatus::Failed).await.is_err());
        assert!(tracker.record_progress("run-1", 4, 10).await.is_err());
        assert_eq!(tracker.run("run-1").await.unwrap().status, RunStatus::Completed);
    }
}
