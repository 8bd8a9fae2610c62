// src/error.rs
use thiserror::Error;

use crate::models::core::SourceSystem;

pub type ReconResult<T> = Result<T, ReconError>;

#[derive(Debug, Error)]
pub enum ReconError {
    /// The record provider for a system cannot be used (usually no credential).
    #[error("{system} record provider is not configured: {reason}")]
    Configuration { system: SourceSystem, reason: String },

    /// One record has an unexpected shape. Counted per record, never fatal to a run.
    #[error("malformed {system} record '{external_id}': {reason}")]
    Record {
        system: SourceSystem,
        external_id: String,
        reason: String,
    },

    /// A mapping write would reference an external id that another mapping already holds.
    #[error("a mapping already references {system} id '{external_id}'")]
    ConstraintViolation {
        system: SourceSystem,
        external_id: String,
    },

    #[error("could not compare field '{field}': {reason}")]
    ConflictDetection { field: String, reason: String },

    #[error("mapping '{0}' not found")]
    MappingNotFound(String),

    #[error("invalid link: {0}")]
    InvalidLink(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ReconError {
    pub fn record(system: SourceSystem, external_id: &str, reason: impl Into<String>) -> Self {
        ReconError::Record {
            system,
            external_id: external_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, ReconError::ConstraintViolation { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ReconError::Configuration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_record() {
        let err = ReconError::record(SourceSystem::Photo, "photo-1", "missing name");
        assert_eq!(err.to_string(), "malformed photo record 'photo-1': missing name");

        let err = ReconError::ConstraintViolation {
            system: SourceSystem::Pm,
            external_id: "555".to_string(),
        };
        assert!(err.is_constraint_violation());
        assert!(!err.is_configuration());
        assert_eq!(err.to_string(), "a mapping already references pm id '555'");
    }

    #[test]
    fn test_anyhow_errors_convert_to_store() {
        let err: ReconError = anyhow::anyhow!("connection refused").into();
        assert!(matches!(err, ReconError::Store(_)));
        assert_eq!(err.to_string(), "connection refused");
    }
}
