// src/models/stats_models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::core::SourceSystem;
use crate::models::mapping::MatchType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched,
    AlreadyMatched,
    NoMatch,
    Error,
    /// The record's pair could not run (e.g. the provider is unconfigured).
    Skipped,
}

impl MatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOutcome::Matched => "matched",
            MatchOutcome::AlreadyMatched => "already_matched",
            MatchOutcome::NoMatch => "no_match",
            MatchOutcome::Error => "error",
            MatchOutcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one source record during a bulk run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDetail {
    pub system: SourceSystem,
    pub external_id: String,
    pub outcome: MatchOutcome,
    pub target_system: Option<SourceSystem>,
    pub target_id: Option<String>,
    pub match_type: Option<MatchType>,
    pub match_score: Option<u32>,
    pub mapping_id: Option<String>,
    pub message: Option<String>,
}

impl MatchDetail {
    pub fn new(system: SourceSystem, external_id: &str, outcome: MatchOutcome) -> Self {
        Self {
            system,
            external_id: external_id.to_string(),
            outcome,
            target_system: None,
            target_id: None,
            match_type: None,
            match_score: None,
            mapping_id: None,
            message: None,
        }
    }

    pub fn with_target(mut self, system: SourceSystem, external_id: &str) -> Self {
        self.target_system = Some(system);
        self.target_id = Some(external_id.to_string());
        self
    }

    pub fn with_match(mut self, match_type: MatchType, match_score: Option<u32>) -> Self {
        self.match_type = Some(match_type);
        self.match_score = match_score;
        self
    }

    pub fn with_mapping(mut self, mapping_id: &str) -> Self {
        self.mapping_id = Some(mapping_id.to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Result of a bulk reconciliation run. Always returned, even on partial failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub matched: usize,
    pub matched_via_integration: usize,
    pub matched_via_fuzzy: usize,
    pub already_matched: usize,
    pub no_match: usize,
    pub errors: usize,
    pub conflicts_updated: usize,
    pub details: Vec<MatchDetail>,
}

impl RunSummary {
    pub fn new(run_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            started_at,
            finished_at: None,
            matched: 0,
            matched_via_integration: 0,
            matched_via_fuzzy: 0,
            already_matched: 0,
            no_match: 0,
            errors: 0,
            conflicts_updated: 0,
            details: Vec::new(),
        }
    }

    /// Counts the detail and keeps it.
    pub fn record(&mut self, detail: MatchDetail) {
        match detail.outcome {
            MatchOutcome::Matched => {
                self.matched += 1;
                match detail.match_type {
                    Some(MatchType::Integration) => self.matched_via_integration += 1,
                    Some(MatchType::Fuzzy) => self.matched_via_fuzzy += 1,
                    _ => {}
                }
            }
            MatchOutcome::AlreadyMatched => self.already_matched += 1,
            MatchOutcome::NoMatch => self.no_match += 1,
            MatchOutcome::Error => self.errors += 1,
            MatchOutcome::Skipped => {}
        }
        self.details.push(detail);
    }

    pub fn processed(&self) -> usize {
        self.matched + self.already_matched + self.no_match + self.errors
    }
}

/// Lifecycle of a persisted bulk run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Running, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_by_outcome() {
        let mut summary = RunSummary::new("run-1", Utc::now());
        summary.record(
            MatchDetail::new(SourceSystem::Photo, "p1", MatchOutcome::Matched)
                .with_match(MatchType::Integration, None),
        );
        summary.record(
            MatchDetail::new(SourceSystem::Photo, "p2", MatchOutcome::Matched)
                .with_match(MatchType::Fuzzy, Some(90)),
        );
        summary.record(
            MatchDetail::new(SourceSystem::Photo, "p3", MatchOutcome::Matched)
                .with_match(MatchType::Exact, None),
        );
        summary.record(MatchDetail::new(SourceSystem::Photo, "p4", MatchOutcome::AlreadyMatched));
        summary.record(MatchDetail::new(SourceSystem::Photo, "p5", MatchOutcome::NoMatch));
        summary.record(MatchDetail::new(SourceSystem::Photo, "p6", MatchOutcome::Error));
        summary.record(MatchDetail::new(SourceSystem::Crm, "", MatchOutcome::Skipped));

        assert_eq!(summary.matched, 3);
        assert_eq!(summary.matched_via_integration, 1);
        assert_eq!(summary.matched_via_fuzzy, 1);
        assert_eq!(summary.already_matched, 1);
        assert_eq!(summary.no_match, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.processed(), 6);
        assert_eq!(summary.details.len(), 7);
    }

    #[test]
    fn test_run_status_transitions() {
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_value(MatchOutcome::AlreadyMatched).unwrap();
        assert_eq!(json, "already_matched");
        assert_eq!(MatchOutcome::NoMatch.to_string(), "no_match");
    }
}
