// src/matching/manager.rs - Bulk reconciliation, manual links and unlinking
use chrono::Utc;
use indicatif::MultiProgress;
use log::{debug, info, warn};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ReconError, ReconResult};
use crate::matching::conflict::ConflictDetector;
use crate::matching::extract::ExtractorChain;
use crate::matching::strategy::{CandidatePool, MatchCandidate, MatchDecision, MatchPipeline};
use crate::models::core::{ExternalRecord, ExternalRef, SourceSystem};
use crate::models::mapping::{MappingFilter, MappingRecord, MappingUpdate, MatchType, NewMapping};
use crate::models::stats_models::{MatchDetail, MatchOutcome, RunStatus, RunSummary};
use crate::store::memory::MemoryRunTracker;
use crate::store::{
    load_all_records, AuditEvent, AuditSink, IdentifierWriteBack, LoadedRecords, LogAuditSink,
    LoggingWriteBack, MappingStore, RecordProvider, RunTracker,
};
use crate::utils::config::{ReconConfig, SystemPair};
use crate::utils::progress_bars::logging::ReconLogger;
use crate::utils::progress_bars::progress_config::pair_progress_bar;

/// Run progress is flushed to the tracker every this many records.
const PROGRESS_FLUSH_EVERY: usize = 50;

/// Mapping state as seen by one bulk run: the store snapshot taken at the
/// start plus every write this run made.
#[derive(Default)]
struct RunState {
    linked: HashMap<ExternalRef, String>,
    mappings: HashMap<String, MappingRecord>,
}

impl RunState {
    fn from_mappings(mappings: Vec<MappingRecord>) -> Self {
        let mut state = Self::default();
        for mapping in mappings {
            state.remember(mapping);
        }
        state
    }

    fn remember(&mut self, mapping: MappingRecord) {
        if let Some(previous) = self.mappings.get(&mapping.id) {
            for r in previous.linked_refs() {
                self.linked.remove(&r);
            }
        }
        for r in mapping.linked_refs() {
            self.linked.insert(r, mapping.id.clone());
        }
        self.mappings.insert(mapping.id.clone(), mapping);
    }

    fn mapping_for(&self, r: &ExternalRef) -> Option<&MappingRecord> {
        self.linked.get(r).and_then(|id| self.mappings.get(id))
    }

    fn is_linked(&self, r: &ExternalRef) -> bool {
        self.linked.contains_key(r)
    }
}

/// Drives reconciliation between the configured systems.
pub struct Reconciler {
    config: ReconConfig,
    providers: HashMap<SourceSystem, Arc<dyn RecordProvider>>,
    store: Arc<dyn MappingStore>,
    audit: Arc<dyn AuditSink>,
    runs: Arc<dyn RunTracker>,
    write_back: Arc<dyn IdentifierWriteBack>,
    pipeline: MatchPipeline,
    detector: ConflictDetector,
    multi_progress: Option<MultiProgress>,
}

impl Reconciler {
    pub fn new(config: ReconConfig, store: Arc<dyn MappingStore>) -> Self {
        let pipeline = MatchPipeline::new(ExtractorChain::default(), config.fuzzy_threshold);
        let detector = ConflictDetector::new(config.master_system);
        Self {
            config,
            providers: HashMap::new(),
            store,
            audit: Arc::new(LogAuditSink),
            runs: Arc::new(MemoryRunTracker::new()),
            write_back: Arc::new(LoggingWriteBack),
            pipeline,
            detector,
            multi_progress: None,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn RecordProvider>) -> Self {
        self.providers.insert(provider.system(), provider);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_run_tracker(mut self, runs: Arc<dyn RunTracker>) -> Self {
        self.runs = runs;
        self
    }

    pub fn with_write_back(mut self, write_back: Arc<dyn IdentifierWriteBack>) -> Self {
        self.write_back = write_back;
        self
    }

    pub fn with_pipeline(mut self, pipeline: MatchPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_progress(mut self, multi_progress: Option<MultiProgress>) -> Self {
        self.multi_progress = multi_progress;
        self
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    /// One pass over every unmatched source record of every configured pair.
    /// Per-record failures are counted in the summary; only a run where no
    /// pair has usable providers, or where the store itself is unreachable,
    /// returns `Err`.
    pub async fn run_bulk_match(&self) -> ReconResult<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let logger = ReconLogger::new(&run_id);
        logger.log_start(self.config.pairs.len(), self.config.master_system);

        self.runs
            .start_run(&run_id, Some("bulk reconciliation"))
            .await?;
        let mut summary = RunSummary::new(&run_id, Utc::now());

        match self.execute_run(&logger, &mut summary).await {
            Ok(()) => {
                summary.finished_at = Some(Utc::now());
                if let Err(e) = self
                    .runs
                    .finish_run(&run_id, &summary, RunStatus::Completed)
                    .await
                {
                    warn!("Failed to persist completion of run {}: {}", run_id, e);
                }
                logger.log_completion(&summary);
                self.audit(AuditEvent::new(
                    "bulk_match",
                    "match_run",
                    &run_id,
                    "success",
                    json!({
                        "matched": summary.matched,
                        "matchedViaIntegration": summary.matched_via_integration,
                        "matchedViaFuzzy": summary.matched_via_fuzzy,
                        "alreadyMatched": summary.already_matched,
                        "noMatch": summary.no_match,
                        "errors": summary.errors,
                    }),
                ))
                .await;
                Ok(summary)
            }
            Err(e) => {
                summary.finished_at = Some(Utc::now());
                if let Err(persist_err) = self
                    .runs
                    .finish_run(&run_id, &summary, RunStatus::Failed)
                    .await
                {
                    warn!("Failed to persist failure of run {}: {}", run_id, persist_err);
                }
                self.audit(AuditEvent::new(
                    "bulk_match",
                    "match_run",
                    &run_id,
                    "failed",
                    json!({ "error": e.to_string() }),
                ))
                .await;
                Err(e)
            }
        }
    }

    async fn execute_run(&self, logger: &ReconLogger, summary: &mut RunSummary) -> ReconResult<()> {
        let page_size = format!("page size {}", self.config.page_size);
        logger.log_phase("Loading records", Some(&page_size));
        let (mut records, unavailable) = self.load_records(logger).await?;

        let runnable: Vec<SystemPair> = self
            .config
            .pairs
            .iter()
            .copied()
            .filter(|pair| records.contains_key(&pair.source) && records.contains_key(&pair.target))
            .collect();
        if runnable.is_empty() {
            if let Some(err) = unavailable.into_values().next() {
                return Err(err);
            }
            return Ok(());
        }
        let mut involved: Vec<SourceSystem> =
            runnable.iter().flat_map(|p| [p.source, p.target]).collect();
        involved.sort();
        involved.dedup();
        for system in involved {
            let Some(loaded) = records.get_mut(&system) else {
                continue;
            };
            for err in loaded.rejected.drain(..) {
                let external_id = match &err {
                    ReconError::Record { external_id, .. } => external_id.clone(),
                    _ => String::new(),
                };
                logger.log_record_error(system, &external_id, &err.to_string());
                summary.record(
                    MatchDetail::new(system, &external_id, MatchOutcome::Error)
                        .with_message(err.to_string()),
                );
            }
        }
        for pair in self.config.pairs.iter().filter(|p| !runnable.contains(*p)) {
            let reason = [pair.source, pair.target]
                .iter()
                .filter_map(|s| unavailable.get(s))
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            summary.record(
                MatchDetail::new(pair.source, "", MatchOutcome::Skipped)
                    .with_message(format!("{} → {} skipped: {}", pair.source, pair.target, reason)),
            );
        }

        logger.log_phase("Loading existing mappings", None);
        let existing = self.store.list_mappings(&MappingFilter::all()).await?;
        logger.log_debug(&format!("{} existing mappings", existing.len()));
        let mut state = RunState::from_mappings(existing);

        let total: usize = runnable
            .iter()
            .map(|p| records.get(&p.source).map_or(0, |l| l.records.len()))
            .sum();
        let mut processed = 0;

        for pair in runnable {
            let (Some(sources), Some(targets)) =
                (records.get(&pair.source), records.get(&pair.target))
            else {
                continue;
            };
            logger.log_phase(&format!("Matching {} → {}", pair.source, pair.target), None);
            self.run_pair(
                pair,
                &sources.records,
                &targets.records,
                &mut state,
                summary,
                logger,
                &mut processed,
                total,
            )
            .await;
        }
        Ok(())
    }

    /// Records per system, plus the configuration errors of providers that could not load.
    async fn load_records(
        &self,
        logger: &ReconLogger,
    ) -> ReconResult<(
        BTreeMap<SourceSystem, LoadedRecords>,
        BTreeMap<SourceSystem, ReconError>,
    )> {
        let mut needed: Vec<SourceSystem> = self
            .config
            .pairs
            .iter()
            .flat_map(|p| [p.source, p.target])
            .collect();
        needed.sort();
        needed.dedup();

        let mut records = BTreeMap::new();
        let mut unavailable = BTreeMap::new();
        for system in needed {
            let Some(provider) = self.providers.get(&system) else {
                logger.log_provider_unavailable(system, "no provider registered");
                unavailable.insert(
                    system,
                    ReconError::Configuration {
                        system,
                        reason: "no provider registered".to_string(),
                    },
                );
                continue;
            };
            match load_all_records(provider.as_ref(), self.config.page_size).await {
                Ok(loaded) => {
                    logger.log_data_loaded(system, loaded.records.len());
                    records.insert(system, loaded);
                }
                Err(e) if e.is_configuration() => {
                    logger.log_provider_unavailable(system, &e.to_string());
                    unavailable.insert(system, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok((records, unavailable))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pair(
        &self,
        pair: SystemPair,
        sources: &[ExternalRecord],
        targets: &[ExternalRecord],
        state: &mut RunState,
        summary: &mut RunSummary,
        logger: &ReconLogger,
        processed: &mut usize,
        total: usize,
    ) {
        let targets_by_id: HashMap<&str, &ExternalRecord> =
            targets.iter().map(|t| (t.external_id(), t)).collect();

        // Targets that have no counterpart in the source system yet.
        let mut pool = CandidatePool::new(
            targets
                .iter()
                .filter(|t| {
                    state
                        .mapping_for(&t.external_ref())
                        .map_or(true, |m| m.external_id(pair.source).is_none())
                })
                .cloned(),
        );

        let mut ordered: Vec<&ExternalRecord> = sources.iter().collect();
        ordered.sort_by(|a, b| a.external_id().cmp(b.external_id()));
        let unmatched = ordered
            .iter()
            .filter(|r| !state.is_linked(&r.external_ref()))
            .count();
        logger.log_pair_start(pair.source, pair.target, unmatched, pool.len());

        let pb = pair_progress_bar(
            self.multi_progress.as_ref(),
            ordered.len() as u64,
            &format!("{} → {}", pair.source, pair.target),
        );

        for record in ordered {
            let detail = match self
                .process_record(pair, record, &targets_by_id, &mut pool, state, summary)
                .await
            {
                Ok(detail) => detail,
                Err(e) => {
                    logger.log_record_error(record.system(), record.external_id(), &e.to_string());
                    MatchDetail::new(record.system(), record.external_id(), MatchOutcome::Error)
                        .with_message(e.to_string())
                }
            };
            summary.record(detail);

            *processed += 1;
            if let Some(pb) = &pb {
                pb.inc(1);
            }
            if *processed % PROGRESS_FLUSH_EVERY == 0 {
                if let Err(e) = self
                    .runs
                    .record_progress(&summary.run_id, *processed, total)
                    .await
                {
                    warn!("Failed to persist progress for run {}: {}", summary.run_id, e);
                }
            }
        }

        if let Some(pb) = pb {
            pb.finish_with_message(format!("{} → {} done", pair.source, pair.target));
        }
    }

    async fn process_record(
        &self,
        pair: SystemPair,
        record: &ExternalRecord,
        targets_by_id: &HashMap<&str, &ExternalRecord>,
        pool: &mut CandidatePool,
        state: &mut RunState,
        summary: &mut RunSummary,
    ) -> ReconResult<MatchDetail> {
        if record.external_id().trim().is_empty() {
            return Err(ReconError::record(
                record.system(),
                record.external_id(),
                "empty external id",
            ));
        }

        let source_ref = record.external_ref();
        if let Some(mapping) = state.mapping_for(&source_ref).cloned() {
            let mut detail = MatchDetail::new(
                record.system(),
                record.external_id(),
                MatchOutcome::AlreadyMatched,
            )
            .with_mapping(&mapping.id);
            if let Some(target_id) = mapping.external_id(pair.target) {
                detail = detail.with_target(pair.target, target_id);
                if let Some(target) = targets_by_id.get(target_id) {
                    if let Some(updated) = self.refresh_conflicts(&mapping, target, record).await? {
                        summary.conflicts_updated += 1;
                        detail = detail.with_message(format!(
                            "{} conflict(s) recorded",
                            updated.conflicts.len()
                        ));
                        state.remember(updated);
                    }
                }
            }
            return Ok(detail);
        }

        match self.pipeline.decide(record, pair.target, pool)? {
            MatchDecision::NoMatch { best_score } => {
                let mut detail =
                    MatchDetail::new(record.system(), record.external_id(), MatchOutcome::NoMatch);
                if let Some(best) = best_score {
                    detail = detail.with_message(format!(
                        "best fuzzy score {} below threshold {}",
                        best,
                        self.pipeline.fuzzy_threshold()
                    ));
                }
                Ok(detail)
            }
            MatchDecision::Matched(candidate) => {
                self.upsert_match(pair, record, candidate, pool, state).await
            }
        }
    }

    /// Re-runs conflict detection for an established mapping; returns the
    /// updated mapping when the stored conflict list changed.
    async fn refresh_conflicts(
        &self,
        mapping: &MappingRecord,
        target: &ExternalRecord,
        source: &ExternalRecord,
    ) -> ReconResult<Option<MappingRecord>> {
        let report = self.detector.detect(target, source);
        if report.conflicts == mapping.conflicts {
            return Ok(None);
        }
        debug!(
            "Mapping {} conflicts changed: {} → {}",
            mapping.id,
            mapping.conflicts.len(),
            report.conflicts.len()
        );
        let updated = self
            .store
            .update(&mapping.id, MappingUpdate::default().with_conflicts(report.conflicts))
            .await?;
        Ok(Some(updated))
    }

    /// Writes the link: attaches to the target's existing partial mapping or
    /// creates a new one. A uniqueness violation means another writer got
    /// there first and is reported as `already_matched`.
    async fn upsert_match(
        &self,
        pair: SystemPair,
        record: &ExternalRecord,
        candidate: MatchCandidate,
        pool: &mut CandidatePool,
        state: &mut RunState,
    ) -> ReconResult<MatchDetail> {
        let target_id = candidate.target_id.clone();
        let base = MatchDetail::new(record.system(), record.external_id(), MatchOutcome::Matched)
            .with_target(pair.target, &target_id)
            .with_match(candidate.match_type, candidate.score);

        let write = self.write_match(pair, record, &candidate).await;
        if write.is_ok() || matches!(&write, Err(e) if e.is_constraint_violation()) {
            pool.claim(&target_id);
        }

        match write {
            Ok(Some(mapping)) => {
                info!(
                    "🔗 {} '{}' ↔ {} '{}' ({}{})",
                    record.system(),
                    record.external_id(),
                    pair.target,
                    target_id,
                    candidate.match_type,
                    candidate.score.map(|s| format!(", score {}", s)).unwrap_or_default()
                );
                self.audit(AuditEvent::new(
                    "auto_match",
                    "project_mapping",
                    &mapping.id,
                    "success",
                    json!({
                        "source": record.external_ref(),
                        "target": ExternalRef::new(pair.target, target_id.as_str()),
                        "matchType": candidate.match_type,
                        "matchScore": candidate.score,
                        "strategy": candidate.strategy.as_str(),
                    }),
                ))
                .await;
                let detail = base.with_mapping(&mapping.id);
                state.remember(mapping);
                Ok(detail)
            }
            Ok(None) => Ok(MatchDetail {
                outcome: MatchOutcome::AlreadyMatched,
                ..base
            }),
            Err(e) if e.is_constraint_violation() => {
                debug!(
                    "{} '{}' lost the race for {} '{}': {}",
                    record.system(),
                    record.external_id(),
                    pair.target,
                    target_id,
                    e
                );
                Ok(MatchDetail {
                    outcome: MatchOutcome::AlreadyMatched,
                    ..base
                }
                .with_message(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// `Ok(None)` when the store already holds exactly this link.
    async fn write_match(
        &self,
        pair: SystemPair,
        record: &ExternalRecord,
        candidate: &MatchCandidate,
    ) -> ReconResult<Option<MappingRecord>> {
        let existing = self
            .store
            .find_by_external_id(pair.target, &candidate.target_id)
            .await?;

        match existing {
            Some(mapping) => match mapping.external_id(pair.source) {
                Some(current) if current == record.external_id() => Ok(None),
                Some(_) => Err(ReconError::ConstraintViolation {
                    system: pair.target,
                    external_id: candidate.target_id.clone(),
                }),
                None => {
                    // The side was empty when read; the store re-checks under its lock.
                    let mut update = MappingUpdate::default()
                        .fill_side(pair.source, record.external_id(), record.name())
                        .with_match(candidate.match_type, candidate.score);
                    if mapping.display_name(pair.target).is_none()
                        && candidate.target_name.is_some()
                    {
                        update = update.fill_side(
                            pair.target,
                            &candidate.target_id,
                            candidate.target_name.as_deref(),
                        );
                    }
                    self.store.update(&mapping.id, update).await.map(Some)
                }
            },
            None => {
                let new_mapping = NewMapping::new(candidate.match_type, candidate.score)
                    .with_side(pair.source, record.external_id(), record.name())
                    .with_side(pair.target, &candidate.target_id, candidate.target_name.as_deref());
                self.store.create(new_mapping).await.map(Some)
            }
        }
    }

    /// Links two records directly, bypassing every strategy.
    pub async fn manual_link(
        &self,
        source: ExternalRef,
        target: ExternalRef,
    ) -> ReconResult<MappingRecord> {
        let result = self.write_manual_link(&source, &target).await;
        let (status, details) = match &result {
            Ok(mapping) => (
                "success",
                json!({ "source": &source, "target": &target, "mappingId": mapping.id }),
            ),
            Err(e) => (
                "failed",
                json!({ "source": &source, "target": &target, "error": e.to_string() }),
            ),
        };
        let entity_id = result
            .as_ref()
            .map(|m| m.id.clone())
            .unwrap_or_else(|_| source.to_string());
        self.audit(AuditEvent::new("manual_link", "project_mapping", &entity_id, status, details))
            .await;

        let mapping = result?;
        info!("🔗 Manual link {} ↔ {} (mapping {})", source, target, mapping.id);
        self.propagate_write_back(&mapping).await;
        Ok(mapping)
    }

    async fn write_manual_link(
        &self,
        source: &ExternalRef,
        target: &ExternalRef,
    ) -> ReconResult<MappingRecord> {
        if source.external_id.trim().is_empty() || target.external_id.trim().is_empty() {
            return Err(ReconError::InvalidLink("external ids must not be empty".to_string()));
        }
        if source.system == target.system {
            return Err(ReconError::InvalidLink(format!(
                "cannot link two {} records",
                source.system
            )));
        }

        let source_mapping = self
            .store
            .find_by_external_id(source.system, &source.external_id)
            .await?;
        let target_mapping = self
            .store
            .find_by_external_id(target.system, &target.external_id)
            .await?;

        let manual = MappingUpdate::default().with_match(MatchType::Manual, None);
        match (source_mapping, target_mapping) {
            (Some(a), Some(b)) if a.id == b.id => self.store.update(&a.id, manual).await,
            (Some(a), Some(b)) => Err(ReconError::InvalidLink(format!(
                "{} belongs to mapping {} and {} to mapping {}; unlink one first",
                source, a.id, target, b.id
            ))),
            (Some(a), None) => {
                ensure_side_free(&a, target)?;
                let update = manual.fill_side(target.system, &target.external_id, None);
                self.store.update(&a.id, update).await
            }
            (None, Some(b)) => {
                ensure_side_free(&b, source)?;
                let update = manual.fill_side(source.system, &source.external_id, None);
                self.store.update(&b.id, update).await
            }
            (None, None) => {
                let new_mapping = NewMapping::new(MatchType::Manual, None)
                    .with_side(source.system, &source.external_id, None)
                    .with_side(target.system, &target.external_id, None);
                self.store.create(new_mapping).await
            }
        }
    }

    async fn propagate_write_back(&self, mapping: &MappingRecord) {
        let master = self.config.master_system;
        let Some(master_id) = mapping.external_id(master) else {
            debug!("Mapping {} has no {} side; nothing to write back", mapping.id, master);
            return;
        };
        let master_ref = ExternalRef::new(master, master_id);
        if let Err(e) = self.write_back.write_back(&master_ref, mapping).await {
            warn!("Write-back to {} failed for mapping {}: {}", master_ref, mapping.id, e);
            self.audit(AuditEvent::new(
                "write_back",
                "project_mapping",
                &mapping.id,
                "failed",
                json!({ "master": master_ref, "error": e.to_string() }),
            ))
            .await;
        }
    }

    /// Clears every non-master pointer of a mapping. The row and its audit
    /// history stay.
    pub async fn unlink(&self, mapping_id: &str) -> ReconResult<MappingRecord> {
        let mapping = self
            .store
            .get(mapping_id)
            .await?
            .ok_or_else(|| ReconError::MappingNotFound(mapping_id.to_string()))?;

        let mut update = MappingUpdate::default().with_conflicts(Vec::new());
        let mut cleared = Vec::new();
        for system in SourceSystem::ALL {
            if system != self.config.master_system && mapping.external_id(system).is_some() {
                update = update.clear_side(system);
                cleared.push(system);
            }
        }

        let updated = self.store.update(mapping_id, update).await?;
        info!("✂️  Unlinked {:?} from mapping {}", cleared, mapping_id);
        self.audit(AuditEvent::new(
            "unlink",
            "project_mapping",
            mapping_id,
            "success",
            json!({ "cleared": cleared, "previous": mapping.linked_refs() }),
        ))
        .await;
        Ok(updated)
    }

    pub async fn list_mappings(&self, filter: &MappingFilter) -> ReconResult<Vec<MappingRecord>> {
        self.store.list_mappings(filter).await
    }

    async fn audit(&self, event: AuditEvent) {
        let action = event.action.clone();
        if let Err(e) = self.audit.record_event(event).await {
            warn!("Audit event '{}' not recorded: {}", action, e);
        }
    }
}

/// A manual link may fill an empty side but never replaces a linked one.
fn ensure_side_free(mapping: &MappingRecord, incoming: &ExternalRef) -> ReconResult<()> {
    match mapping.external_id(incoming.system) {
        Some(current) if current != incoming.external_id => Err(ReconError::InvalidLink(format!(
            "mapping {} already links {} id '{}'; unlink it first",
            mapping.id, incoming.system, current
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(id: &str, pm: &str, photo: Option<&str>) -> MappingRecord {
        let mut new_mapping =
            NewMapping::new(MatchType::Exact, None).with_side(SourceSystem::Pm, pm, None);
        if let Some(photo) = photo {
            new_mapping = new_mapping.with_side(SourceSystem::Photo, photo, None);
        }
        new_mapping.into_record(id.to_string(), Utc::now())
    }

    #[test]
    fn test_run_state_tracks_relinks() {
        let mut state = RunState::from_mappings(vec![mapping("m-1", "pm-1", Some("photo-1"))]);
        let photo = ExternalRef::new(SourceSystem::Photo, "photo-1");
        assert!(state.is_linked(&photo));
        assert_eq!(state.mapping_for(&photo).map(|m| m.id.as_str()), Some("m-1"));

        state.remember(mapping("m-1", "pm-1", Some("photo-2")));
        assert!(!state.is_linked(&photo));
        assert!(state.is_linked(&ExternalRef::new(SourceSystem::Photo, "photo-2")));
        assert!(state.is_linked(&ExternalRef::new(SourceSystem::Pm, "pm-1")));
    }

    #[test]
    fn test_manual_link_never_replaces_a_side() {
        let existing = mapping("m-1", "pm-1", Some("photo-1"));
        let same = ExternalRef::new(SourceSystem::Photo, "photo-1");
        assert!(ensure_side_free(&existing, &same).is_ok());
        let empty_side = ExternalRef::new(SourceSystem::Crm, "deal-1");
        assert!(ensure_side_free(&existing, &empty_side).is_ok());
        assert!(matches!(
            ensure_side_free(&existing, &ExternalRef::new(SourceSystem::Photo, "photo-2")),
            Err(ReconError::InvalidLink(_))
        ));
    }
}
