//! Plant model error type.

use thiserror::Error;

/// Result type used across the plant model.
pub type PlantResult<T> = Result<T, PlantError>;

/// Errors raised while building or querying the plant model.
///
/// These are deterministic data errors (malformed master data, unknown ids,
/// invalid simulation input). IO failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlantError {
    /// A value failed validation (e.g. malformed master data).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Threshold bands are not ordered correctly for an entity.
    #[error("invalid thresholds for {entity}: {reason}")]
    InvalidThresholds { entity: String, reason: String },

    /// An identifier was empty or otherwise malformed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A referenced entity does not exist in the catalog.
    #[error("unknown {kind} '{id}'")]
    UnknownEntity { kind: &'static str, id: String },

    /// The same identifier was declared twice.
    #[error("duplicate {kind} '{id}'")]
    Duplicate { kind: &'static str, id: String },

    /// A conflicting operation was requested (e.g. a fault is already active).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A simulated value was NaN or infinite.
    #[error("non-finite value for {0}")]
    NonFinite(String),
}

impl PlantError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unknown(kind: &'static str, id: impl Into<String>) -> Self {
        Self::UnknownEntity { kind, id: id.into() }
    }

    pub fn duplicate(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Duplicate { kind, id: id.into() }
    }
}
