//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The identifier contains a character that cannot appear in a registry path.
    #[error("invalid character {ch:?} in {kind} '{value}'")]
    InvalidCharacter {
        kind: &'static str,
        value: String,
        ch: char,
    },

    /// The instance id is missing one of its `@` separators.
    #[error("instance id '{0}' must have the form hostname@pid@seed")]
    MissingSeparator(String),

    /// A numeric component of the instance id does not parse.
    #[error("invalid {component} in instance id '{value}'")]
    InvalidComponent {
        component: &'static str,
        value: String,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
