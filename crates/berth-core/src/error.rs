// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for Berth operations
#[derive(Error, Debug, Diagnostic)]
pub enum BerthError {
    /// Required field missing from an object
    #[error("Missing required field {field} on {kind}")]
    #[diagnostic(
        code(berth::missing_field),
        help("Set {field} on the {kind} before handing it to the scheduler")
    )]
    MissingField {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        field: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(berth::serialization_error),
        help("Ensure the document is valid JSON or YAML")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type alias for Berth operations
pub type Result<T> = std::result::Result<T, BerthError>;

impl BerthError {
    /// Create a MissingField error
    pub fn missing_field(kind: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            kind: kind.into(),
            field: field.into(),
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BerthError::missing_field("Pod", "metadata.name");
        assert!(matches!(err, BerthError::MissingField { .. }));
        assert_eq!(err.to_string(), "Missing required field metadata.name on Pod");
    }
}
