// src/matching/conflict.rs
use log::warn;
use serde_json::Value as JsonValue;

use crate::error::{ReconError, ReconResult};
use crate::matching::normalize::{normalize_address, normalize_text};
use crate::models::core::{ExternalRecord, SourceSystem};
use crate::models::mapping::{ConflictEntry, ConflictResolution};

/// Shared attributes compared across the two sides of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedField {
    Stage,
    Address,
    City,
    EstimatedValue,
}

impl TrackedField {
    pub const ALL: [TrackedField; 4] = [
        TrackedField::Stage,
        TrackedField::Address,
        TrackedField::City,
        TrackedField::EstimatedValue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackedField::Stage => "stage",
            TrackedField::Address => "address",
            TrackedField::City => "city",
            TrackedField::EstimatedValue => "estimated_value",
        }
    }

    /// Normalized string form of this field on `record`; `None` when the record
    /// carries no value.
    pub fn normalized_value(&self, record: &ExternalRecord) -> ReconResult<Option<String>> {
        let fields = record.fields();
        let value = match self {
            TrackedField::Stage => normalize_text(fields.stage.as_deref()),
            TrackedField::Address => normalize_address(fields.street_address.as_deref()),
            TrackedField::City => normalize_text(fields.city.as_deref()),
            TrackedField::EstimatedValue => match &fields.estimated_value {
                None | Some(JsonValue::Null) => String::new(),
                Some(raw) => normalize_amount(self.as_str(), raw)?,
            },
        };
        Ok(if value.is_empty() { None } else { Some(value) })
    }
}

/// Amounts compare as two-decimal numbers so "125,000" and 125000.0 agree.
fn normalize_amount(field: &str, raw: &JsonValue) -> ReconResult<String> {
    let parsed = match raw {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | ' '))
                .collect();
            if cleaned.is_empty() {
                return Ok(String::new());
            }
            cleaned.parse::<f64>().ok()
        }
        other => {
            return Err(ReconError::ConflictDetection {
                field: field.to_string(),
                reason: format!("unsupported value type: {}", other),
            })
        }
    };
    parsed
        .filter(|v| v.is_finite())
        .map(|v| format!("{:.2}", v))
        .ok_or_else(|| ReconError::ConflictDetection {
            field: field.to_string(),
            reason: format!("not a number: {}", raw),
        })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictReport {
    pub conflicts: Vec<ConflictEntry>,
    /// Fields that could not be compared and were left out.
    pub skipped_fields: Vec<String>,
}

/// Diffs the tracked fields of two linked records. A pure function of the
/// records' current values.
pub struct ConflictDetector {
    master: SourceSystem,
    fields: Vec<TrackedField>,
}

impl ConflictDetector {
    pub fn new(master: SourceSystem) -> Self {
        Self {
            master,
            fields: TrackedField::ALL.to_vec(),
        }
    }

    pub fn with_fields(master: SourceSystem, fields: Vec<TrackedField>) -> Self {
        Self { master, fields }
    }

    pub fn master(&self) -> SourceSystem {
        self.master
    }

    pub fn resolution_for(&self, a: SourceSystem, b: SourceSystem) -> ConflictResolution {
        if a == self.master || b == self.master {
            ConflictResolution::SourceWins
        } else {
            ConflictResolution::BothKept
        }
    }

    /// Fields present on only one side are not conflicts.
    pub fn detect(&self, a: &ExternalRecord, b: &ExternalRecord) -> ConflictReport {
        let resolution = self.resolution_for(a.system(), b.system());
        let mut report = ConflictReport::default();

        for field in &self.fields {
            let values = field
                .normalized_value(a)
                .and_then(|va| field.normalized_value(b).map(|vb| (va, vb)));
            match values {
                Ok((Some(value_a), Some(value_b))) if value_a != value_b => {
                    report.conflicts.push(ConflictEntry {
                        field: field.as_str().to_string(),
                        value_a,
                        value_b,
                        resolution,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Skipping field '{}' comparing {} '{}' with {} '{}': {}",
                        field.as_str(),
                        a.system(),
                        a.external_id(),
                        b.system(),
                        b.external_id(),
                        e
                    );
                    report.skipped_fields.push(field.as_str().to_string());
                }
            }
        }
        report
    }
}
