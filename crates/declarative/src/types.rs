//! Core types for declarative resource management

use crate::error::ResourceError;
use crate::wait::WaitConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Operation a change-set entry performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Delete then create, for changes the kind cannot apply in place
    Replace,
    NoOp,
}

impl Operation {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::Replace => "-/+",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::NoOp => "no-op",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a resource
///
/// `Pending -> Creating | Updating | Deleting -> Succeeded | Deleted | Failed`.
/// `Skipped` marks resources whose prerequisite did not succeed, so cascades
/// are reported apart from primary failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    Creating,
    Updating,
    Deleting,
    Succeeded,
    Deleted,
    Failed,
    Skipped,
}

impl ResourceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Deleted | Self::Failed | Self::Skipped
        )
    }

    /// Terminal and successful; dependents may start
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Deleted)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Succeeded => "succeeded",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    Succeeded,
    /// At least one entry failed, was skipped, or never started
    Failed,
    Cancelled,
}

/// What to do with the rest of the change-set after a failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop starting new entries; in-flight entries finish
    #[default]
    Abort,
    /// Keep applying branches that do not depend on the failure
    Continue,
}

/// Final state of one change-set entry after a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOutcome {
    pub id: String,
    pub kind: String,
    pub operation: Operation,
    pub status: ResourceStatus,
    pub remote_id: Option<String>,
    pub error: Option<ResourceError>,
}

impl ResourceOutcome {
    pub fn new(id: &str, kind: &str, operation: Operation, status: ResourceStatus) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            operation,
            status,
            remote_id: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub modified: usize,
    pub replaced: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub no_change: usize,
    /// Started but left in progress (cancelled, timed out)
    pub incomplete: usize,
    /// Never started (aborted or cancelled before their turn)
    pub not_started: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.modified + self.replaced + self.removed
    }

    /// No failures, skips, or unfinished entries
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.incomplete == 0 && self.not_started == 0
    }

    /// Total number of entries processed
    pub fn total(&self) -> usize {
        self.total_changes()
            + self.skipped
            + self.failed
            + self.no_change
            + self.incomplete
            + self.not_started
    }

    /// Add an outcome to the summary
    pub fn add_outcome(&mut self, outcome: &ResourceOutcome) {
        match (outcome.status, outcome.operation) {
            (ResourceStatus::Failed, _) => self.failed += 1,
            (ResourceStatus::Skipped, _) => self.skipped += 1,
            (_, Operation::NoOp) => self.no_change += 1,
            (ResourceStatus::Succeeded, Operation::Create) => self.created += 1,
            (ResourceStatus::Succeeded, Operation::Update) => self.modified += 1,
            (ResourceStatus::Succeeded, Operation::Replace) => self.replaced += 1,
            (ResourceStatus::Deleted, _) => self.removed += 1,
            (ResourceStatus::Pending, _) => self.not_started += 1,
            _ => self.incomplete += 1,
        }
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum number of entries in flight at once
    pub concurrency: usize,
    /// Polling behaviour of the wait monitor
    pub wait: WaitConfig,
    pub failure_policy: FailurePolicy,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            wait: WaitConfig::default(),
            failure_policy: FailurePolicy::Abort,
        }
    }
}

/// Everything a run produced
#[derive(Debug, Clone)]
pub struct ExecuteReport {
    pub stack: String,
    pub status: StackStatus,
    /// One outcome per change-set entry, in change-set order
    pub outcomes: Vec<ResourceOutcome>,
    /// Stack outputs resolved after the run
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub summary: ExecuteSummary,
}

impl ExecuteReport {
    /// Every entry reached `Succeeded` or `Deleted`
    pub fn is_success(&self) -> bool {
        self.status == StackStatus::Succeeded
    }

    pub fn outcome(&self, id: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// Entries that failed on their own
    pub fn failed(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == ResourceStatus::Failed)
    }

    /// Entries that never reached a terminal state
    pub fn incomplete(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes.iter().filter(|o| !o.status.is_terminal())
    }

    /// Entries left mid-operation; their records need reconciling
    pub fn in_progress(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_in_progress())
    }

    /// Entries the run never got to
    pub fn not_started(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == ResourceStatus::Pending)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == ResourceStatus::Skipped)
    }
}
