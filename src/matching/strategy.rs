// src/matching/strategy.rs
//
// Per-record match decision: integration → identifier → exact name → fuzzy,
// stopping at the first strategy that accepts a candidate.
use log::debug;

use crate::error::{ReconError, ReconResult};
use crate::matching::extract::ExtractorChain;
use crate::matching::score::score;
use crate::models::core::{ExternalRecord, NormalizedFields, SourceSystem};
use crate::models::mapping::MatchType;

pub const DEFAULT_FUZZY_THRESHOLD: u32 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Integration,
    Identifier,
    ExactName,
    Fuzzy,
}

impl StrategyKind {
    pub const ORDER: [StrategyKind; 4] = [
        StrategyKind::Integration,
        StrategyKind::Identifier,
        StrategyKind::ExactName,
        StrategyKind::Fuzzy,
    ];

    pub fn match_type(&self) -> MatchType {
        match self {
            StrategyKind::Integration => MatchType::Integration,
            StrategyKind::Identifier | StrategyKind::ExactName => MatchType::Exact,
            StrategyKind::Fuzzy => MatchType::Fuzzy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Integration => "integration",
            StrategyKind::Identifier => "identifier",
            StrategyKind::ExactName => "exact_name",
            StrategyKind::Fuzzy => "fuzzy",
        }
    }
}

struct PoolEntry {
    record: ExternalRecord,
    normalized: NormalizedFields,
}

/// Unlinked target-side records, kept in ascending external-id order so that
/// every scan (and every fuzzy tie) resolves the same way on every run.
pub struct CandidatePool {
    entries: Vec<PoolEntry>,
}

impl CandidatePool {
    pub fn new(records: impl IntoIterator<Item = ExternalRecord>) -> Self {
        let mut entries: Vec<PoolEntry> = records
            .into_iter()
            .map(|record| PoolEntry {
                normalized: record.normalized(),
                record,
            })
            .collect();
        entries.sort_by(|a, b| a.record.external_id().cmp(b.record.external_id()));
        entries.dedup_by(|a, b| a.record.external_id() == b.record.external_id());
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, external_id: &str) -> Option<&ExternalRecord> {
        self.position(external_id).map(|i| &self.entries[i].record)
    }

    /// Removes a claimed candidate so no other record can match it in this pass.
    pub fn claim(&mut self, external_id: &str) -> Option<ExternalRecord> {
        self.position(external_id).map(|i| self.entries.remove(i).record)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.record.external_id())
    }

    fn position(&self, external_id: &str) -> Option<usize> {
        self.entries
            .binary_search_by(|e| e.record.external_id().cmp(external_id))
            .ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCandidate {
    pub target_system: SourceSystem,
    pub target_id: String,
    pub target_name: Option<String>,
    pub strategy: StrategyKind,
    pub match_type: MatchType,
    /// Present only for fuzzy matches.
    pub score: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchDecision {
    Matched(MatchCandidate),
    NoMatch { best_score: Option<u32> },
}

pub struct MatchPipeline {
    extractors: ExtractorChain,
    fuzzy_threshold: u32,
}

impl Default for MatchPipeline {
    fn default() -> Self {
        Self::new(ExtractorChain::default(), DEFAULT_FUZZY_THRESHOLD)
    }
}

impl MatchPipeline {
    pub fn new(extractors: ExtractorChain, fuzzy_threshold: u32) -> Self {
        Self {
            extractors,
            fuzzy_threshold,
        }
    }

    pub fn fuzzy_threshold(&self) -> u32 {
        self.fuzzy_threshold
    }

    pub fn accepts_score(&self, score: u32) -> bool {
        score >= self.fuzzy_threshold
    }

    /// Runs the strategies in priority order against `pool`.
    pub fn decide(
        &self,
        record: &ExternalRecord,
        target_system: SourceSystem,
        pool: &CandidatePool,
    ) -> ReconResult<MatchDecision> {
        if record.external_id().trim().is_empty() {
            return Err(ReconError::record(
                record.system(),
                record.external_id(),
                "empty external id",
            ));
        }
        if record.system() == target_system {
            return Err(ReconError::record(
                record.system(),
                record.external_id(),
                format!("cannot match a record against its own system ({})", target_system),
            ));
        }

        let normalized = record.normalized();
        for strategy in StrategyKind::ORDER {
            let found = match strategy {
                StrategyKind::Integration => self.integration(record, target_system, pool),
                StrategyKind::Identifier => identifier(record, pool),
                StrategyKind::ExactName => exact_name(&normalized, pool),
                StrategyKind::Fuzzy => self.fuzzy(&normalized, pool),
            };
            if let Some((target_id, target_name, score)) = found {
                debug!(
                    "{} '{}' matched {} '{}' via {} strategy{}",
                    record.system(),
                    record.external_id(),
                    target_system,
                    target_id,
                    strategy.as_str(),
                    score.map(|s| format!(" (score {})", s)).unwrap_or_default()
                );
                return Ok(MatchDecision::Matched(MatchCandidate {
                    target_system,
                    target_id,
                    target_name,
                    strategy,
                    match_type: strategy.match_type(),
                    score,
                }));
            }
        }

        Ok(MatchDecision::NoMatch {
            best_score: best_fuzzy(&normalized, pool).map(|(_, s)| s),
        })
    }

    /// Accepted unconditionally: the source system asserted the link itself.
    fn integration(
        &self,
        record: &ExternalRecord,
        target_system: SourceSystem,
        pool: &CandidatePool,
    ) -> Option<Found> {
        let (target_id, shape) = self.extractors.extract(record, target_system)?;
        debug!(
            "{} '{}' self-reports {} id '{}' ({})",
            record.system(),
            record.external_id(),
            target_system,
            target_id,
            shape
        );
        let target_name = pool
            .get(&target_id)
            .and_then(|r| r.name().map(str::to_string));
        Some((target_id, target_name, None))
    }

    fn fuzzy(&self, normalized: &NormalizedFields, pool: &CandidatePool) -> Option<Found> {
        let (index, best) = best_fuzzy(normalized, pool)?;
        if !self.accepts_score(best) {
            return None;
        }
        let record = &pool.entries[index].record;
        Some((
            record.external_id().to_string(),
            record.name().map(str::to_string),
            Some(best),
        ))
    }
}

/// Target id, display name and score of a strategy hit.
type Found = (String, Option<String>, Option<u32>);

fn identifier(record: &ExternalRecord, pool: &CandidatePool) -> Option<Found> {
    let wanted = record.project_number().map(str::trim).filter(|n| !n.is_empty())?;
    pool.entries
        .iter()
        .find(|e| e.record.project_number().map(str::trim) == Some(wanted))
        .map(|e| to_found(&e.record))
}

fn exact_name(normalized: &NormalizedFields, pool: &CandidatePool) -> Option<Found> {
    if normalized.name.is_empty() {
        return None;
    }
    pool.entries
        .iter()
        .find(|e| e.normalized.name == normalized.name)
        .map(|e| to_found(&e.record))
}

/// Highest-scoring candidate; the first one in pool order wins a tie.
fn best_fuzzy(normalized: &NormalizedFields, pool: &CandidatePool) -> Option<(usize, u32)> {
    let mut best: Option<(usize, u32)> = None;
    for (index, entry) in pool.entries.iter().enumerate() {
        let s = score(normalized, &entry.normalized);
        if best.map_or(true, |(_, top)| s > top) {
            best = Some((index, s));
        }
    }
    best
}

fn to_found(record: &ExternalRecord) -> Found {
    (
        record.external_id().to_string(),
        record.name().map(str::to_string),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::RecordFields;
    use serde_json::json;

    fn pm(id: &str, name: &str, street: &str, city: &str) -> ExternalRecord {
        ExternalRecord::pm(RecordFields::new(id, name).with_address(street, city, "CO"))
    }

    fn photo(id: &str, name: &str, street: &str, city: &str) -> ExternalRecord {
        ExternalRecord::photo(RecordFields::new(id, name).with_address(street, city, "CO"))
    }

    fn matched(decision: MatchDecision) -> MatchCandidate {
        match decision {
            MatchDecision::Matched(candidate) => candidate,
            other => panic!("expected a match, got {:?}", other),
        }
    }

    fn decide_pm(record: &ExternalRecord, pool: &CandidatePool) -> MatchCandidate {
        matched(MatchPipeline::default().decide(record, SourceSystem::Pm, pool).unwrap())
    }

    #[test]
    fn test_pool_is_sorted_and_claimable() {
        let mut pool = CandidatePool::new(vec![
            pm("pm-3", "C", "", ""),
            pm("pm-1", "A", "", ""),
            pm("pm-2", "B", "", ""),
            pm("pm-1", "A duplicate", "", ""),
        ]);
        assert_eq!(pool.ids().collect::<Vec<_>>(), vec!["pm-1", "pm-2", "pm-3"]);
        assert!(pool.claim("pm-2").is_some());
        assert!(pool.claim("pm-2").is_none());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_fuzzy_match_smith_residence() {
        let pool = CandidatePool::new(vec![
            pm("pm-1", "Smith Residence Remodel", "123 Main Street", "Denver"),
            pm("pm-2", "Jones Kitchen", "9 Elm St", "Denver"),
        ]);
        let record = photo("photo-1", "Smith Residence", "123 Main St", "Denver");
        let candidate = decide_pm(&record, &pool);
        assert_eq!(candidate.target_id, "pm-1");
        assert_eq!(candidate.match_type, MatchType::Fuzzy);
        assert_eq!(candidate.score, Some(150));
    }

    #[test]
    fn test_integration_short_circuits_scoring() {
        let pool = CandidatePool::new(vec![pm(
            "pm-1",
            "Smith Residence Remodel",
            "123 Main Street",
            "Denver",
        )]);
        let record = ExternalRecord::photo(
            RecordFields::new("photo-1", "Smith Residence")
                .with_address("123 Main St", "Denver", "CO")
                .with_cross_refs(json!([{"type": "pm", "relationId": "555"}])),
        );
        let candidate = decide_pm(&record, &pool);
        assert_eq!(candidate.target_id, "555");
        assert_eq!(candidate.strategy, StrategyKind::Integration);
        assert_eq!(candidate.match_type, MatchType::Integration);
        assert_eq!(candidate.score, None);
        assert_eq!(candidate.target_name, None);
    }

    #[test]
    fn test_identifier_strategy_trims_values() {
        let pool = CandidatePool::new(vec![
            ExternalRecord::pm(
                RecordFields::new("pm-1", "Completely Different").with_project_number(" J-1001 "),
            ),
        ]);
        let record =
            ExternalRecord::crm(RecordFields::new("deal-1", "Smith").with_project_number("J-1001"));
        let candidate = decide_pm(&record, &pool);
        assert_eq!(candidate.strategy, StrategyKind::Identifier);
        assert_eq!(candidate.match_type, MatchType::Exact);
        assert_eq!(candidate.target_name.as_deref(), Some("Completely Different"));
    }

    #[test]
    fn test_exact_name_before_fuzzy() {
        let pool = CandidatePool::new(vec![
            pm("pm-1", "Smith Residence Remodel", "123 Main Street", "Denver"),
            pm("pm-2", "SMITH RESIDENCE", "77 Far Away Rd", "Boulder"),
        ]);
        let record = photo("photo-1", "Smith Residence", "123 Main St", "Denver");
        let candidate = decide_pm(&record, &pool);
        assert_eq!(candidate.target_id, "pm-2");
        assert_eq!(candidate.strategy, StrategyKind::ExactName);
        assert_eq!(candidate.score, None);
    }

    #[test]
    fn test_threshold_boundary() {
        let pipeline = MatchPipeline::default();
        assert!(pipeline.accepts_score(70));
        assert!(!pipeline.accepts_score(69));

        // 8/10 name overlap and nothing else: exactly 70
        let pool =
            CandidatePool::new(vec![ExternalRecord::pm(RecordFields::new("pm-1", "abcdefghij"))]);
        let record = ExternalRecord::photo(RecordFields::new("photo-1", "abcdefgh"));
        let candidate = matched(pipeline.decide(&record, SourceSystem::Pm, &pool).unwrap());
        assert_eq!(candidate.score, Some(70));

        // 6/10 overlap scores 50 and is rejected
        let record = ExternalRecord::photo(RecordFields::new("photo-2", "abcdef"));
        assert_eq!(
            pipeline.decide(&record, SourceSystem::Pm, &pool).unwrap(),
            MatchDecision::NoMatch { best_score: Some(50) }
        );
    }

    #[test]
    fn test_fuzzy_tie_goes_to_lowest_external_id() {
        let pool = CandidatePool::new(vec![
            pm("pm-b", "Harbor Point Phase", "1 Dock St", "Seattle"),
            pm("pm-a", "Harbor Point Tower", "1 Dock St", "Seattle"),
        ]);
        let record = photo("photo-1", "Harbor Point", "1 Dock Street", "Seattle");
        let pipeline = MatchPipeline::default();
        let first = matched(pipeline.decide(&record, SourceSystem::Pm, &pool).unwrap());
        let second = matched(pipeline.decide(&record, SourceSystem::Pm, &pool).unwrap());
        assert_eq!(first.target_id, "pm-a");
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_records_are_errors() {
        let pool = CandidatePool::new(Vec::new());
        let record = ExternalRecord::photo(RecordFields::new("  ", "Nameless"));
        let err = MatchPipeline::default().decide(&record, SourceSystem::Pm, &pool).unwrap_err();
        assert!(matches!(err, ReconError::Record { .. }));

        let record = ExternalRecord::pm(RecordFields::new("pm-1", "Self"));
        assert!(MatchPipeline::default().decide(&record, SourceSystem::Pm, &pool).is_err());
    }

    #[test]
    fn test_empty_pool_is_no_match() {
        let pool = CandidatePool::new(Vec::new());
        let record = photo("photo-1", "Smith Residence", "123 Main St", "Denver");
        assert_eq!(
            MatchPipeline::default().decide(&record, SourceSystem::Pm, &pool).unwrap(),
            MatchDecision::NoMatch { best_score: None }
        );
    }
}
