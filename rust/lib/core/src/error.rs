use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────
//
// Stable, machine-readable identifiers. Callers match on these,
// never on the human-readable message string. The one exception is
// `CONSTRAINT_FAILED`, whose message is the storage text verbatim.

/// Stable error code constants.
pub mod error_code {
    pub const DUPLICATE_MODEL: &str = "DUPLICATE_MODEL";
    pub const INVALID_FIELD: &str = "INVALID_FIELD";
    pub const CONFIGURATION: &str = "CONFIGURATION";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const CONSTRAINT_FAILED: &str = "CONSTRAINT_FAILED";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── OrmError ────────────────────────────────────────────────────────

/// Unified error type of the model/record engine.
///
/// Configuration variants are raised while the registry is being built
/// and are not recoverable. Everything else is raised per call and
/// aborts the enclosing environment's transaction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrmError {
    /// A model with this name was already declared.
    #[error("model '{0}' is already declared")]
    DuplicateModel(String),

    /// A field declaration cannot be accepted.
    #[error("invalid field {model}.{field}: {reason}")]
    InvalidField {
        model: String,
        field: String,
        reason: String,
    },

    /// Unknown model, dependency cycle, mixin cycle, missing layer, ...
    #[error("{0}")]
    Configuration(String),

    /// Method not allowed for the acting user, or record excluded by a rule.
    #[error("{0}")]
    Permission(String),

    /// Constraint hook or storage constraint failure.
    #[error("{0}")]
    Constraint(String),

    /// Input rejected before any SQL is issued.
    #[error("{0}")]
    Validation(String),

    /// Referenced record or field does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Storage backend failure.
    #[error("{0}")]
    Storage(String),

    /// Unexpected internal error.
    #[error("{0}")]
    Internal(String),
}

impl OrmError {
    /// Stable, machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            OrmError::DuplicateModel(_) => error_code::DUPLICATE_MODEL,
            OrmError::InvalidField { .. } => error_code::INVALID_FIELD,
            OrmError::Configuration(_) => error_code::CONFIGURATION,
            OrmError::Permission(_) => error_code::PERMISSION_DENIED,
            OrmError::Constraint(_) => error_code::CONSTRAINT_FAILED,
            OrmError::Validation(_) => error_code::VALIDATION_FAILED,
            OrmError::NotFound(_) => error_code::NOT_FOUND,
            OrmError::Storage(_) => error_code::STORAGE_ERROR,
            OrmError::Internal(_) => error_code::INTERNAL,
        }
    }

    /// True for startup-time errors (duplicate/unknown model, bad field, cycles).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            OrmError::DuplicateModel(_) | OrmError::InvalidField { .. } | OrmError::Configuration(_)
        )
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, OrmError::Permission(_))
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, OrmError::Constraint(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, OrmError::Validation(_))
    }

    /// Shorthand for an [`OrmError::InvalidField`].
    pub fn invalid_field(model: &str, field: &str, reason: impl Into<String>) -> Self {
        OrmError::InvalidField {
            model: model.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
