// src/models/mapping.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ReconError, ReconResult};
use crate::models::core::{ExternalRef, SourceSystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// The source system itself asserted the link.
    Integration,
    Exact,
    Fuzzy,
    Manual,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Integration => "integration",
            MatchType::Exact => "exact",
            MatchType::Fuzzy => "fuzzy",
            MatchType::Manual => "manual",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "integration" => Ok(MatchType::Integration),
            "exact" => Ok(MatchType::Exact),
            "fuzzy" => Ok(MatchType::Fuzzy),
            "manual" => Ok(MatchType::Manual),
            other => Err(format!("unknown match type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    SourceWins,
    BothKept,
}

/// One disagreement between the two sides of a mapping on a tracked field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub field: String,
    pub value_a: String,
    pub value_b: String,
    pub resolution: ConflictResolution,
}

/// The id and display name one system contributes to a mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSide {
    pub external_id: Option<String>,
    pub display_name: Option<String>,
}

/// Canonical cross-system link for one real-world project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRecord {
    pub id: String,
    pub pm_project_id: Option<String>,
    pub crm_deal_id: Option<String>,
    pub photo_project_id: Option<String>,
    pub pm_name: Option<String>,
    pub crm_name: Option<String>,
    pub photo_name: Option<String>,
    pub match_type: MatchType,
    /// Present only for fuzzy matches.
    pub match_score: Option<u32>,
    pub conflicts: Vec<ConflictEntry>,
    pub last_sync_at: DateTime<Utc>,
}

impl MappingRecord {
    pub fn external_id(&self, system: SourceSystem) -> Option<&str> {
        match system {
            SourceSystem::Pm => self.pm_project_id.as_deref(),
            SourceSystem::Crm => self.crm_deal_id.as_deref(),
            SourceSystem::Photo => self.photo_project_id.as_deref(),
        }
    }

    pub fn display_name(&self, system: SourceSystem) -> Option<&str> {
        match system {
            SourceSystem::Pm => self.pm_name.as_deref(),
            SourceSystem::Crm => self.crm_name.as_deref(),
            SourceSystem::Photo => self.photo_name.as_deref(),
        }
    }

    pub fn references(&self, system: SourceSystem, external_id: &str) -> bool {
        self.external_id(system) == Some(external_id)
    }

    pub fn linked_refs(&self) -> Vec<ExternalRef> {
        SourceSystem::ALL
            .iter()
            .filter_map(|system| {
                self.external_id(*system)
                    .map(|id| ExternalRef::new(*system, id))
            })
            .collect()
    }

    pub fn linked_system_count(&self) -> usize {
        self.linked_refs().len()
    }

    pub fn set_side(&mut self, system: SourceSystem, side: MappingSide) {
        let (id_slot, name_slot) = match system {
            SourceSystem::Pm => (&mut self.pm_project_id, &mut self.pm_name),
            SourceSystem::Crm => (&mut self.crm_deal_id, &mut self.crm_name),
            SourceSystem::Photo => (&mut self.photo_project_id, &mut self.photo_name),
        };
        *id_slot = side.external_id;
        *name_slot = side.display_name;
    }

    /// Fails with `ConstraintViolation` when a side the update expects to be
    /// empty already holds a different id. Stores call this under the same
    /// lock or row lock as the write.
    pub fn check_expected_empty(&self, update: &MappingUpdate) -> ReconResult<()> {
        for system in &update.expect_empty {
            let incoming = update.incoming_id(*system);
            match (self.external_id(*system), incoming) {
                (Some(current), Some(incoming)) if current == incoming => {}
                (Some(current), incoming) => {
                    return Err(ReconError::ConstraintViolation {
                        system: *system,
                        external_id: incoming.unwrap_or(current).to_string(),
                    });
                }
                (None, _) => {}
            }
        }
        Ok(())
    }

    /// Applies a partial update in place; used by store implementations.
    pub fn apply(&mut self, update: &MappingUpdate, now: DateTime<Utc>) {
        for system in &update.clear_sides {
            self.set_side(*system, MappingSide::default());
        }
        for (system, side) in &update.set_sides {
            self.set_side(*system, side.clone());
        }
        if let Some(match_type) = update.match_type {
            self.match_type = match_type;
            self.match_score = update.match_score;
        }
        if let Some(conflicts) = &update.conflicts {
            self.conflicts = conflicts.clone();
        }
        self.last_sync_at = now;
    }
}

/// Fields for a new mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMapping {
    pub sides: Vec<(SourceSystem, MappingSide)>,
    pub match_type: MatchType,
    pub match_score: Option<u32>,
    pub conflicts: Vec<ConflictEntry>,
}

impl NewMapping {
    pub fn new(match_type: MatchType, match_score: Option<u32>) -> Self {
        Self {
            sides: Vec::new(),
            match_type,
            match_score: if match_type == MatchType::Fuzzy { match_score } else { None },
            conflicts: Vec::new(),
        }
    }

    pub fn with_side(
        mut self,
        system: SourceSystem,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Self {
        self.sides.push((
            system,
            MappingSide {
                external_id: Some(external_id.to_string()),
                display_name: display_name.map(str::to_string),
            },
        ));
        self
    }

    pub fn into_record(self, id: String, now: DateTime<Utc>) -> MappingRecord {
        let mut record = MappingRecord {
            id,
            pm_project_id: None,
            crm_deal_id: None,
            photo_project_id: None,
            pm_name: None,
            crm_name: None,
            photo_name: None,
            match_type: self.match_type,
            match_score: self.match_score,
            conflicts: self.conflicts,
            last_sync_at: now,
        };
        for (system, side) in self.sides {
            record.set_side(system, side);
        }
        record
    }
}

/// Partial update of an existing mapping. Cleared sides are applied before set sides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingUpdate {
    pub set_sides: Vec<(SourceSystem, MappingSide)>,
    pub clear_sides: Vec<SourceSystem>,
    /// Sides that must still be empty (or already hold the incoming id) when
    /// the write lands.
    pub expect_empty: Vec<SourceSystem>,
    /// When present the match score is replaced too.
    pub match_type: Option<MatchType>,
    pub match_score: Option<u32>,
    pub conflicts: Option<Vec<ConflictEntry>>,
}

impl MappingUpdate {
    pub fn set_side(
        mut self,
        system: SourceSystem,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Self {
        self.set_sides.push((
            system,
            MappingSide {
                external_id: Some(external_id.to_string()),
                display_name: display_name.map(str::to_string),
            },
        ));
        self
    }

    /// Like `set_side`, but the store refuses the write if another id took the
    /// side since the mapping was read.
    pub fn fill_side(
        self,
        system: SourceSystem,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Self {
        let mut update = self.set_side(system, external_id, display_name);
        update.expect_empty.push(system);
        update
    }

    pub fn clear_side(mut self, system: SourceSystem) -> Self {
        self.clear_sides.push(system);
        self
    }

    pub fn with_match(mut self, match_type: MatchType, match_score: Option<u32>) -> Self {
        self.match_type = Some(match_type);
        self.match_score = if match_type == MatchType::Fuzzy { match_score } else { None };
        self
    }

    pub fn with_conflicts(mut self, conflicts: Vec<ConflictEntry>) -> Self {
        self.conflicts = Some(conflicts);
        self
    }

    fn incoming_id(&self, system: SourceSystem) -> Option<&str> {
        self.set_sides
            .iter()
            .rev()
            .find(|(s, _)| *s == system)
            .and_then(|(_, side)| side.external_id.as_deref())
    }

    /// External ids this update would newly assign; these are the writes the
    /// uniqueness constraint guards.
    pub fn assigned_refs(&self) -> Vec<ExternalRef> {
        self.set_sides
            .iter()
            .filter_map(|(system, side)| {
                side.external_id
                    .as_deref()
                    .map(|id| ExternalRef::new(*system, id))
            })
            .collect()
    }
}

/// Query for `list_mappings`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingFilter {
    pub match_type: Option<MatchType>,
    pub conflicts_only: bool,
    /// Only mappings with a pointer into this system.
    pub linked_system: Option<SourceSystem>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl MappingFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, mapping: &MappingRecord) -> bool {
        if let Some(match_type) = self.match_type {
            if mapping.match_type != match_type {
                return false;
            }
        }
        if self.conflicts_only && mapping.conflicts.is_empty() {
            return false;
        }
        if let Some(system) = self.linked_system {
            if mapping.external_id(system).is_none() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MappingRecord {
        NewMapping::new(MatchType::Fuzzy, Some(150))
            .with_side(SourceSystem::Pm, "pm-1", Some("Smith Residence Remodel"))
            .with_side(SourceSystem::Photo, "photo-1", Some("Smith Residence"))
            .into_record("m-1".to_string(), Utc::now())
    }

    #[test]
    fn test_new_mapping_sets_sides() {
        let mapping = sample();
        assert_eq!(mapping.external_id(SourceSystem::Pm), Some("pm-1"));
        assert_eq!(mapping.external_id(SourceSystem::Photo), Some("photo-1"));
        assert_eq!(mapping.external_id(SourceSystem::Crm), None);
        assert_eq!(mapping.display_name(SourceSystem::Photo), Some("Smith Residence"));
        assert_eq!(mapping.linked_system_count(), 2);
        assert_eq!(mapping.match_score, Some(150));
    }

    #[test]
    fn test_score_only_kept_for_fuzzy() {
        let mapping =
            NewMapping::new(MatchType::Manual, Some(99)).into_record("m".into(), Utc::now());
        assert_eq!(mapping.match_score, None);

        let update = MappingUpdate::default().with_match(MatchType::Integration, Some(10));
        assert_eq!(update.match_score, None);
    }

    #[test]
    fn test_apply_clears_before_setting() {
        let mut mapping = sample();
        let update = MappingUpdate::default()
            .clear_side(SourceSystem::Photo)
            .set_side(SourceSystem::Crm, "deal-3", Some("Smith"))
            .with_match(MatchType::Manual, None);
        mapping.apply(&update, Utc::now());

        assert_eq!(mapping.photo_project_id, None);
        assert_eq!(mapping.photo_name, None);
        assert_eq!(mapping.crm_deal_id.as_deref(), Some("deal-3"));
        assert_eq!(mapping.match_type, MatchType::Manual);
        assert_eq!(mapping.match_score, None);
        assert_eq!(update.assigned_refs(), vec![ExternalRef::new(SourceSystem::Crm, "deal-3")]);
    }

    #[test]
    fn test_fill_side_requires_empty_or_same_id() {
        let mapping = sample();
        let same = MappingUpdate::default().fill_side(SourceSystem::Photo, "photo-1", None);
        assert!(mapping.check_expected_empty(&same).is_ok());
        let empty = MappingUpdate::default().fill_side(SourceSystem::Crm, "deal-1", None);
        assert!(mapping.check_expected_empty(&empty).is_ok());

        let taken = MappingUpdate::default().fill_side(SourceSystem::Photo, "photo-9", None);
        match mapping.check_expected_empty(&taken) {
            Err(ReconError::ConstraintViolation { system, external_id }) => {
                assert_eq!(system, SourceSystem::Photo);
                assert_eq!(external_id, "photo-9");
            }
            other => panic!("expected a constraint violation, got {:?}", other),
        }
        // plain set_side keeps overwrite semantics
        let overwrite = MappingUpdate::default().set_side(SourceSystem::Photo, "photo-9", None);
        assert!(mapping.check_expected_empty(&overwrite).is_ok());
    }

    #[test]
    fn test_filter_matches() {
        let mapping = sample();
        assert!(MappingFilter::all().matches(&mapping));
        assert!(!MappingFilter { conflicts_only: true, ..Default::default() }.matches(&mapping));
        assert!(!MappingFilter {
            linked_system: Some(SourceSystem::Crm),
            ..Default::default()
        }
        .matches(&mapping));
        assert!(MappingFilter {
            match_type: Some(MatchType::Fuzzy),
            ..Default::default()
        }
        .matches(&mapping));
    }

    #[test]
    fn test_mapping_serializes_camel_case() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["pmProjectId"], "pm-1");
        assert_eq!(value["matchType"], "fuzzy");
        assert_eq!(value["matchScore"], 150);
    }
}
