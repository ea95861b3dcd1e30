use thiserror::Error;

#[derive(Debug, Error)]
pub enum MocError {
    /// Attribute/subject/collection applicability or mutual-exclusivity violation.
    #[error("schema violation: {message}")]
    Schema { message: String },
    /// Value codec decode failure (bad number, bad datetime, bad range order, ...).
    #[error("value format error: {message}")]
    Format { message: String },
    /// Duplicate assertion or incompatible concurrent state.
    #[error("conflict: {message}")]
    Conflict { message: String },
    /// A write referenced a row that vanished mid-call; safe to retry the operation.
    #[error("referential integrity error: {message}")]
    Integrity { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl MocError {
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

pub type MocResult<T> = Result<T, MocError>;
