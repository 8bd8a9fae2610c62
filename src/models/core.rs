// src/models/core.rs
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

use crate::matching::normalize::{normalize_address, normalize_name, normalize_text};

/// The three external systems whose project records are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceSystem {
    Crm,
    Pm,
    Photo,
}

impl SourceSystem {
    pub const ALL: [SourceSystem; 3] = [SourceSystem::Crm, SourceSystem::Pm, SourceSystem::Photo];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSystem::Crm => "crm",
            SourceSystem::Pm => "pm",
            SourceSystem::Photo => "photo",
        }
    }

    /// Tag values other systems use when they self-report a link to this system.
    /// Compared case-insensitively.
    pub fn tags(&self) -> &'static [&'static str] {
        match self {
            SourceSystem::Crm => &["crm"],
            SourceSystem::Pm => &["pm", "project_management"],
            SourceSystem::Photo => &["photo", "photos"],
        }
    }

    pub fn matches_tag(&self, tag: &str) -> bool {
        let tag = tag.trim();
        self.tags().iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceSystem::ALL
            .iter()
            .copied()
            .find(|system| system.matches_tag(s))
            .ok_or_else(|| format!("unknown source system '{}'", s))
    }
}

/// Addresses one record in one system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRef {
    pub system: SourceSystem,
    pub external_id: String,
}

impl ExternalRef {
    pub fn new(system: SourceSystem, external_id: impl Into<String>) -> Self {
        Self {
            system,
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.system, self.external_id)
    }
}

/// Attributes every mirrored record carries, whatever system it came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFields {
    pub external_id: String,
    pub name: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    /// Shared business identifier such as a job or project number.
    pub project_number: Option<String>,
    /// Lifecycle stage (deal stage, project status).
    pub stage: Option<String>,
    /// Kept raw; systems disagree on whether this is a number or a string.
    pub estimated_value: Option<JsonValue>,
    #[serde(default)]
    pub embedded_cross_refs: JsonValue,
    #[serde(default)]
    pub attributes: Map<String, JsonValue>,
}

impl RecordFields {
    pub fn new(external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, street: &str, city: &str, state: &str) -> Self {
        self.street_address = Some(street.to_string());
        self.city = Some(city.to_string());
        self.state = Some(state.to_string());
        self
    }

    pub fn with_cross_refs(mut self, cross_refs: JsonValue) -> Self {
        self.embedded_cross_refs = cross_refs;
        self
    }

    pub fn with_project_number(mut self, project_number: &str) -> Self {
        self.project_number = Some(project_number.to_string());
        self
    }

    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn with_estimated_value(mut self, value: JsonValue) -> Self {
        self.estimated_value = Some(value);
        self
    }

    pub fn with_attribute(mut self, key: &str, value: JsonValue) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmRecord {
    #[serde(flatten)]
    pub fields: RecordFields,
    pub pipeline: Option<String>,
    pub owner_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmRecord {
    #[serde(flatten)]
    pub fields: RecordFields,
    pub project_manager: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRecord {
    #[serde(flatten)]
    pub fields: RecordFields,
    pub photo_count: Option<i64>,
}

/// One entity as mirrored from a source system. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "system", rename_all = "lowercase")]
pub enum ExternalRecord {
    Crm(CrmRecord),
    Pm(PmRecord),
    Photo(PhotoRecord),
}

impl ExternalRecord {
    pub fn crm(fields: RecordFields) -> Self {
        ExternalRecord::Crm(CrmRecord {
            fields,
            pipeline: None,
            owner_email: None,
        })
    }

    pub fn pm(fields: RecordFields) -> Self {
        ExternalRecord::Pm(PmRecord {
            fields,
            project_manager: None,
        })
    }

    pub fn photo(fields: RecordFields) -> Self {
        ExternalRecord::Photo(PhotoRecord {
            fields,
            photo_count: None,
        })
    }

    /// Builds the variant for `system` around shared fields.
    pub fn from_fields(system: SourceSystem, fields: RecordFields) -> Self {
        match system {
            SourceSystem::Crm => Self::crm(fields),
            SourceSystem::Pm => Self::pm(fields),
            SourceSystem::Photo => Self::photo(fields),
        }
    }

    pub fn system(&self) -> SourceSystem {
        match self {
            ExternalRecord::Crm(_) => SourceSystem::Crm,
            ExternalRecord::Pm(_) => SourceSystem::Pm,
            ExternalRecord::Photo(_) => SourceSystem::Photo,
        }
    }

    pub fn fields(&self) -> &RecordFields {
        match self {
            ExternalRecord::Crm(r) => &r.fields,
            ExternalRecord::Pm(r) => &r.fields,
            ExternalRecord::Photo(r) => &r.fields,
        }
    }

    pub fn external_id(&self) -> &str {
        &self.fields().external_id
    }

    pub fn external_ref(&self) -> ExternalRef {
        ExternalRef::new(self.system(), self.external_id())
    }

    pub fn name(&self) -> Option<&str> {
        self.fields().name.as_deref()
    }

    pub fn project_number(&self) -> Option<&str> {
        self.fields().project_number.as_deref()
    }

    pub fn embedded_cross_refs(&self) -> &JsonValue {
        &self.fields().embedded_cross_refs
    }

    pub fn attributes(&self) -> &Map<String, JsonValue> {
        &self.fields().attributes
    }

    /// The single normalization step feeding the scorer.
    pub fn normalized(&self) -> NormalizedFields {
        let fields = self.fields();
        NormalizedFields::new(
            fields.name.as_deref(),
            fields.street_address.as_deref(),
            fields.city.as_deref(),
            fields.state.as_deref(),
        )
    }
}

/// Comparison-ready view of a record's name and location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedFields {
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    /// Normalized street address followed by the normalized city.
    pub locality: String,
}

impl NormalizedFields {
    pub fn new(
        name: Option<&str>,
        street_address: Option<&str>,
        city: Option<&str>,
        state: Option<&str>,
    ) -> Self {
        let address = normalize_address(street_address);
        let city = normalize_text(city);
        let locality = [address.as_str(), city.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            name: normalize_name(name),
            address,
            city,
            state: normalize_text(state),
            locality,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_system_parsing() {
        assert_eq!("PM".parse::<SourceSystem>().unwrap(), SourceSystem::Pm);
        assert_eq!("project_management".parse::<SourceSystem>().unwrap(), SourceSystem::Pm);
        assert_eq!(" crm ".parse::<SourceSystem>().unwrap(), SourceSystem::Crm);
        assert!("erp".parse::<SourceSystem>().is_err());
    }

    #[test]
    fn test_record_accessors_follow_variant() {
        let record = ExternalRecord::photo(
            RecordFields::new("photo-1", "Smith Residence")
                .with_address("123 Main St", "Denver", "CO"),
        );
        assert_eq!(record.system(), SourceSystem::Photo);
        assert_eq!(record.external_id(), "photo-1");
        assert_eq!(record.external_ref().to_string(), "photo:photo-1");
    }

    #[test]
    fn test_normalized_fields_locality() {
        let record = ExternalRecord::pm(
            RecordFields::new("pm-1", "Smith Residence Remodel")
                .with_address("123 Main Street", "Denver", "CO"),
        );
        let normalized = record.normalized();
        assert_eq!(normalized.name, "smithresidenceremodel");
        assert_eq!(normalized.address, "123 main");
        assert_eq!(normalized.city, "denver");
        assert_eq!(normalized.locality, "123 main denver");
    }

    #[test]
    fn test_record_serializes_with_system_tag() {
        let record = ExternalRecord::crm(RecordFields::new("deal-7", "Lakeview"));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["system"], json!("crm"));
        assert_eq!(value["externalId"], json!("deal-7"));

        let back: ExternalRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.system(), SourceSystem::Crm);
    }
}
