//! Error types for the flow graph
//!
//! Parse and structural errors abort an import before anything is mutated.
//! Anything softer (unknown types, dropped cross-tab wires) is reported as an
//! [`ImportWarning`](crate::import::ImportWarning) instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using FlowGraphError
pub type Result<T> = std::result::Result<T, FlowGraphError>;

/// Stable error codes surfaced to callers
///
/// The collaborator codes (`credentials_load_failed` and friends) are produced
/// by the deploy/persistence layer; they live here so every surface agrees on
/// the same strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Interchange JSON could not be parsed
    InvalidFlow,
    /// A subflow instance was placed inside its own template
    SubflowSelfReference,
    /// A subflow instance would make a template contain itself transitively
    CircularSubflowReference,
    /// Credentials could not be loaded by the persistence layer
    CredentialsLoadFailed,
    /// Version control authentication failed
    GitAuthFailed,
    /// Anything else
    UnexpectedError,
}

impl ErrorCode {
    /// The wire string for this code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidFlow => "invalid_flow",
            Self::SubflowSelfReference => "subflow_self_reference",
            Self::CircularSubflowReference => "circular_subflow_reference",
            Self::CredentialsLoadFailed => "credentials_load_failed",
            Self::GitAuthFailed => "git_auth_failed",
            Self::UnexpectedError => "unexpected_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while editing, importing or merging flows
#[derive(Debug, Error)]
pub enum FlowGraphError {
    /// Malformed interchange JSON
    #[error("Invalid flow ({code}): {message}")]
    Parse { code: ErrorCode, message: String },

    /// Self-referencing or circular subflow
    #[error("Structural error ({code}): {message}")]
    Structural { code: ErrorCode, message: String },

    /// Programming-contract violation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A referenced entity does not exist
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// The operation touches a locked workspace
    #[error("Workspace '{0}' is locked")]
    Locked(String),

    /// Convert-to-subflow selection has more than one inbound source node
    #[error("Cannot create subflow: selection has inputs from multiple nodes")]
    MultipleInputs,

    /// Nothing to operate on
    #[error("No nodes selected")]
    EmptySelection,

    /// Merge invoked while conflicts are still unresolved
    #[error("Unresolved merge conflicts: {0:?}")]
    UnresolvedConflicts(Vec<String>),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),
}

impl FlowGraphError {
    /// Create a parse error from an underlying JSON error
    pub fn parse(err: serde_json::Error) -> Self {
        Self::Parse {
            code: ErrorCode::InvalidFlow,
            message: err.to_string(),
        }
    }

    /// Create a parse error for JSON that is well-formed but not a flow
    pub fn invalid_flow(message: impl Into<String>) -> Self {
        Self::Parse {
            code: ErrorCode::InvalidFlow,
            message: message.into(),
        }
    }

    /// Create a structural error with the given code
    pub fn structural(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Structural {
            code,
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable code for user-facing errors, if this error carries one
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Parse { code, .. } | Self::Structural { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_carries_code() {
        let err = serde_json::from_str::<serde_json::Value>("[{").unwrap_err();
        let err = FlowGraphError::parse(err);
        assert_eq!(err.code(), Some(ErrorCode::InvalidFlow));
        assert!(err.to_string().starts_with("Invalid flow (invalid_flow)"));
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::CredentialsLoadFailed).unwrap();
        assert_eq!(json, "\"credentials_load_failed\"");
        assert_eq!(ErrorCode::GitAuthFailed.as_str(), "git_auth_failed");
    }

    #[test]
    fn test_code_absent_for_contract_errors() {
        let err = FlowGraphError::InvalidOperation("nope".to_string());
        assert!(err.code().is_none());
    }
}
