//! # Declarative
//!
//! Declarative resource graphs converged through a remote provisioning API.
//!
//! A run goes through four stages:
//!
//! - **Graph**: a [`StackDecl`] is validated into a [`ResourceGraph`]. Every
//!   problem is reported at once and nothing touches the provider.
//! - **Diff**: the graph is compared with the recorded [`StateFile`] into a
//!   [`ChangeSet`] of create, update, replace, delete and no-op entries.
//! - **Execute**: entries run on a bounded worker pool once their
//!   prerequisites succeed. The [`wait`] monitor polls each remote object
//!   until it settles.
//! - **Record**: every transition lands in the [`StateStore`] before
//!   dependents start, so an interrupted run can resume.
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     CancelToken, ExecuteOptions, KindCatalog, KindSchema, NoProgress, Reference,
//!     ResourceDecl, ResourceGraph, StackDecl, StateStore, compute_change_set, execute,
//! };
//!
//! let catalog = KindCatalog::new()
//!     .with(KindSchema::new("network").mutable(["tags"]))
//!     .with(KindSchema::new("subnet").mutable(["tags"]));
//!
//! let decl = StackDecl::new("web", "us-east-1")
//!     .resource(ResourceDecl::new("vpc", "network").property("cidr_block", "10.0.0.0/16"))
//!     .resource(
//!         ResourceDecl::new("public", "subnet")
//!             .property("network_id", Reference::output("vpc", "id")),
//!     );
//!
//! let graph = ResourceGraph::build(decl, &catalog)?;
//! let store = StateStore::open("state/web.json", "web")?;
//! let change_set = compute_change_set(&graph, &store.snapshot(), &catalog)?;
//! let report = execute(
//!     &change_set,
//!     &provider,
//!     &store,
//!     &ExecuteOptions::default(),
//!     &CancelToken::new(),
//!     &mut NoProgress,
//! )?;
//! assert!(report.is_success());
//! ```
//!
//! ## Provider Traits
//!
//! - [`Provider`]: the remote create/describe/update/delete capability
//! - [`ProgressCallback`]: receives progress updates
//! - [`ConfirmCallback`]: handles operator confirmations
//!
//! Front-ends supply these, so the crate has no terminal or network
//! dependencies of its own.

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod schema;
pub mod state;
pub mod types;
pub mod value;
pub mod wait;

#[cfg(test)]
mod mock;

// Re-export main types at crate root
pub use context::{AutoConfirm, AutoDecline, CancelToken, ConfirmCallback, NoProgress, ProgressCallback};
pub use diff::{DiffSummary, compute_change_set, config_hash, plan_destroy};
pub use error::{Error, ResourceError, Result, ValidationError, ValidationErrors};
pub use executor::execute;
pub use graph::{
    OutputBinding, OutputDecl, ParameterDecl, Resource, ResourceDecl, ResourceGraph, StackDecl,
    StackInfo,
};
pub use planner::{ChangeEntry, ChangeSet, Desired};
pub use provider::{
    ErrorCategory, KindRouter, Observation, Provider, ProviderError, ProviderResult,
    RemoteStatus, ResolvedSpec,
};
pub use schema::{ID_ATTRIBUTE, KindCatalog, KindSchema};
pub use state::{STATE_FORMAT_VERSION, StateFile, StateRecord, StateStore};
pub use types::{
    ExecuteOptions, ExecuteReport, ExecuteSummary, FailurePolicy, Operation, ResourceOutcome,
    ResourceStatus, StackStatus,
};
pub use value::{Reference, Value};
pub use wait::{WaitConfig, WaitError, WaitTarget, wait_for};
