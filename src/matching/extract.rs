// src/matching/extract.rs
//
// Source systems sometimes self-report the id of the same project in another
// system. Each payload shape is handled by an independent extractor; the chain
// tries them in order and the first hit wins.
use serde_json::{Map, Value as JsonValue};

use crate::models::core::{ExternalRecord, SourceSystem};

/// Id fields read from a matching entry, most authoritative first.
const ID_FIELD_ORDER: [&str; 5] = ["relationId", "externalId", "projectId", "dealId", "id"];

/// Fields an entry uses to say which system it points at.
const TAG_FIELDS: [&str; 3] = ["type", "provider", "name"];

pub trait CrossRefExtractor: Send + Sync {
    fn shape(&self) -> &'static str;

    fn try_extract(&self, record: &ExternalRecord, target: SourceSystem) -> Option<String>;
}

/// `[{"type": "pm", "relationId": "555"}, ...]`
pub struct TaggedEntryExtractor;

impl CrossRefExtractor for TaggedEntryExtractor {
    fn shape(&self) -> &'static str {
        "tagged_entries"
    }

    fn try_extract(&self, record: &ExternalRecord, target: SourceSystem) -> Option<String> {
        let entries = record.embedded_cross_refs().as_array()?;
        find_in_tagged_entries(entries, target)
    }
}

/// `{"pm": {"projectId": 555}}` or `{"pm": "555"}`
pub struct KeyedBySystemExtractor;

impl CrossRefExtractor for KeyedBySystemExtractor {
    fn shape(&self) -> &'static str {
        "keyed_by_system"
    }

    fn try_extract(&self, record: &ExternalRecord, target: SourceSystem) -> Option<String> {
        let by_system = record.embedded_cross_refs().as_object()?;
        by_system
            .iter()
            .filter(|(key, _)| target.matches_tag(key))
            .find_map(|(_, value)| match value {
                JsonValue::Object(entry) => read_id_fields(entry),
                scalar => scalar_to_id(scalar),
            })
    }
}

/// `pmProjectId` / `crm_deal_id` style properties directly on the record.
pub struct FlatPropertyExtractor;

impl FlatPropertyExtractor {
    fn property_names(target: SourceSystem) -> &'static [&'static str] {
        match target {
            SourceSystem::Crm => &["crmDealId", "crm_deal_id", "crmId", "crm_id"],
            SourceSystem::Pm => &["pmProjectId", "pm_project_id", "pmId", "pm_id"],
            SourceSystem::Photo => &["photoProjectId", "photo_project_id", "photoId", "photo_id"],
        }
    }
}

impl CrossRefExtractor for FlatPropertyExtractor {
    fn shape(&self) -> &'static str {
        "flat_property"
    }

    fn try_extract(&self, record: &ExternalRecord, target: SourceSystem) -> Option<String> {
        let attributes = record.attributes();
        Self::property_names(target)
            .iter()
            .find_map(|name| attributes.get(*name).and_then(scalar_to_id))
    }
}

/// `"external_ids": [{"provider": "crm", "id": "D-1"}]` nested in the record attributes.
pub struct NestedExternalIdsExtractor;

impl CrossRefExtractor for NestedExternalIdsExtractor {
    fn shape(&self) -> &'static str {
        "nested_external_ids"
    }

    fn try_extract(&self, record: &ExternalRecord, target: SourceSystem) -> Option<String> {
        let entries = record.attributes().get("external_ids")?.as_array()?;
        find_in_tagged_entries(entries, target)
    }
}

/// Ordered list of extractors. Adding a shape means pushing another extractor.
pub struct ExtractorChain {
    extractors: Vec<Box<dyn CrossRefExtractor>>,
}

impl Default for ExtractorChain {
    fn default() -> Self {
        Self {
            extractors: vec![
                Box::new(TaggedEntryExtractor),
                Box::new(KeyedBySystemExtractor),
                Box::new(FlatPropertyExtractor),
                Box::new(NestedExternalIdsExtractor),
            ],
        }
    }
}

impl ExtractorChain {
    pub fn new(extractors: Vec<Box<dyn CrossRefExtractor>>) -> Self {
        Self { extractors }
    }

    pub fn push(&mut self, extractor: Box<dyn CrossRefExtractor>) {
        self.extractors.push(extractor);
    }

    /// Returns the counterpart id in `target` and the shape it was read from.
    pub fn extract(
        &self,
        record: &ExternalRecord,
        target: SourceSystem,
    ) -> Option<(String, &'static str)> {
        if record.system() == target {
            return None;
        }
        self.extractors.iter().find_map(|extractor| {
            extractor
                .try_extract(record, target)
                .map(|id| (id, extractor.shape()))
        })
    }
}

pub fn extract_cross_ref_id(record: &ExternalRecord, target: SourceSystem) -> Option<String> {
    ExtractorChain::default()
        .extract(record, target)
        .map(|(id, _)| id)
}

fn find_in_tagged_entries(entries: &[JsonValue], target: SourceSystem) -> Option<String> {
    entries
        .iter()
        .filter_map(JsonValue::as_object)
        .filter(|entry| entry_targets(entry, target))
        .find_map(read_id_fields)
}

fn entry_targets(entry: &Map<String, JsonValue>, target: SourceSystem) -> bool {
    TAG_FIELDS.iter().any(|field| {
        entry
            .get(*field)
            .and_then(JsonValue::as_str)
            .map_or(false, |tag| target.matches_tag(tag))
    })
}

fn read_id_fields(entry: &Map<String, JsonValue>) -> Option<String> {
    ID_FIELD_ORDER
        .iter()
        .find_map(|field| entry.get(*field).and_then(scalar_to_id))
}

fn scalar_to_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
