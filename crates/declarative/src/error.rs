//! Error types for the declarative crate
//!
//! Run-level errors live in [`Error`]. Failures that only concern one
//! resource during execution are [`ResourceError`]s and end up in the
//! execution report instead of aborting the run.

use crate::types::Operation;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A single problem found while building a resource graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Dependency edges form a cycle
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A reference or `depends_on` entry points at nothing in the graph
    #[error("resource '{resource}' references unknown '{reference}'")]
    UnresolvedReference { resource: String, reference: String },

    /// Two resources share a logical identifier
    #[error("duplicate resource identifier '{id}'")]
    DuplicateIdentifier { id: String },

    /// No schema is registered for the resource kind
    #[error("resource '{resource}' has unknown kind '{kind}'")]
    UnknownKind { resource: String, kind: String },

    /// Identifier contains characters outside `[A-Za-z0-9_-]` or is reserved
    #[error("invalid resource identifier '{id}'")]
    InvalidIdentifier { id: String },

    /// Parameter declared without a value or default
    #[error("parameter '{name}' has no value")]
    MissingParameter { name: String },

    /// Condition does not name a boolean parameter
    #[error("'{subject}' has invalid condition '{condition}'")]
    InvalidCondition { subject: String, condition: String },
}

/// Every validation problem found in one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n  - {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Errors that abort a whole operation
#[derive(Debug, Error)]
pub enum Error {
    /// Graph construction failed; nothing was sent to the provider
    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    /// Persisted state is unreadable or inconsistent; never repaired automatically
    #[error("state corruption in {}: {message}", .path.display())]
    StateCorruption { path: PathBuf, message: String },

    /// IO error
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize state
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `--target` named something the change-set does not contain
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    /// Worker pool could not be created
    #[error("failed to create worker pool: {0}")]
    WorkerPool(String),
}

/// Result type for declarative operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single resource during execution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// Provider refused the request
    #[error("{operation} rejected: {message}")]
    RemoteRejection { operation: Operation, message: String },

    /// Remote object did not reach a terminal state in time
    #[error("{operation} timed out after {}s", .elapsed.as_secs_f64())]
    Timeout {
        operation: Operation,
        elapsed: Duration,
    },

    /// Provider reported a terminal failure
    #[error("{operation} failed: {message}")]
    Remote { operation: Operation, message: String },

    /// Run was cancelled while this resource was in flight
    #[error("{operation} cancelled")]
    Cancelled { operation: Operation },

    /// An output reference could not be resolved from recorded state
    #[error("cannot resolve {reference}: {message}")]
    UnresolvedOutput { reference: String, message: String },

    /// A prerequisite did not reach terminal success
    #[error("prerequisite '{prerequisite}' did not succeed")]
    PrerequisiteFailed { prerequisite: String },

    /// Recording the transition failed
    #[error("state update failed: {0}")]
    State(String),

    /// The worker applying this resource panicked
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl ResourceError {
    /// Whether the record was left in its in-progress status
    pub fn leaves_in_progress(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_display_lists_every_problem() {
        let errors = ValidationErrors(vec![
            ValidationError::DuplicateIdentifier { id: "vpc".into() },
            ValidationError::CyclicDependency {
                cycle: vec!["a".into(), "b".into(), "a".into()],
            },
        ]);
        let text = errors.to_string();
        assert!(text.contains("2 validation error(s)"));
        assert!(text.contains("duplicate resource identifier 'vpc'"));
        assert!(text.contains("a -> b -> a"));
    }

    #[test]
    fn resource_error_keeps_provider_message_verbatim() {
        let err = ResourceError::RemoteRejection {
            operation: Operation::Create,
            message: "InstanceLimitExceeded: quota is 5".into(),
        };
        assert_eq!(
            err.to_string(),
            "create rejected: InstanceLimitExceeded: quota is 5"
        );
    }

    #[test]
    fn only_timeouts_and_cancellation_leave_records_in_progress() {
        assert!(
            ResourceError::Cancelled {
                operation: Operation::Update
            }
            .leaves_in_progress()
        );
        assert!(
            !ResourceError::Remote {
                operation: Operation::Create,
                message: "boom".into()
            }
            .leaves_in_progress()
        );
    }
}
