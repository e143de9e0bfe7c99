//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// The ID contains characters outside the allow-list.
    #[error("invalid instance ID '{id}': only letters, digits, '-' and '_' are allowed")]
    IllegalCharacters { id: String },

    /// The ID exceeds the maximum length.
    #[error("instance ID is {len} characters long, maximum is {max}")]
    TooLong { len: usize, max: usize },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if the input failed the instance id allow-list.
    pub fn is_allow_list_error(&self) -> bool {
        matches!(
            self,
            IdError::IllegalCharacters { .. } | IdError::TooLong { .. }
        )
    }
}
