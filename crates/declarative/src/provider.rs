//! Remote provisioning capability
//!
//! The engine drives every resource kind through the same five calls. A
//! [`KindRouter`] lets different kinds be served by different adapters.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Configuration handed to the provider, every reference resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSpec {
    pub logical_id: String,
    pub kind: String,
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// Remote lifecycle state reported by `describe`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemoteStatus {
    InProgress,
    Ready,
    Failed { reason: String },
    Gone,
}

/// Result of one `describe` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub status: RemoteStatus,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Observation {
    pub fn new(status: RemoteStatus) -> Self {
        Self {
            status,
            attributes: BTreeMap::new(),
        }
    }

    pub fn gone() -> Self {
        Self::new(RemoteStatus::Gone)
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Error categories decide whether a call is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The request was refused and will be refused again
    Rejected,
    /// The remote object does not exist
    NotFound,
    /// Network trouble or server-side hiccup
    Transient,
    Other,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Errors returned by a provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{message}")]
    Rejected { message: String },

    #[error("invalid configuration: {}", .errors.join("; "))]
    Invalid { errors: Vec<String> },

    #[error("remote object '{remote_id}' not found")]
    NotFound { remote_id: String },

    #[error("transient error: {message}")]
    Transient { message: String },

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Rejected { .. } | Self::Invalid { .. } => ErrorCategory::Rejected,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A remote provisioning API
///
/// Calls may block; the engine invokes them from worker threads.
pub trait Provider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Check a configuration without creating anything
    fn validate(&self, spec: &ResolvedSpec) -> ProviderResult<()>;

    /// Submit a create request; returns the remote identifier
    fn create(&self, spec: &ResolvedSpec) -> ProviderResult<String>;

    /// Report the remote status and exported attributes
    fn describe(&self, kind: &str, remote_id: &str) -> ProviderResult<Observation>;

    /// Submit an in-place update
    fn update(&self, remote_id: &str, spec: &ResolvedSpec) -> ProviderResult<()>;

    /// Submit a delete request
    fn delete(&self, kind: &str, remote_id: &str) -> ProviderResult<()>;
}

/// Dispatches each kind to the provider registered for it
#[derive(Default, Clone)]
pub struct KindRouter {
    routes: HashMap<String, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl KindRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `kind` with `provider`
    pub fn route(mut self, kind: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.routes.insert(kind.into(), provider);
        self
    }

    /// Serve every unrouted kind with `provider`
    pub fn fallback(mut self, provider: Arc<dyn Provider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    fn provider_for(&self, kind: &str) -> ProviderResult<&dyn Provider> {
        self.routes
            .get(kind)
            .or(self.fallback.as_ref())
            .map(|p| &**p)
            .ok_or_else(|| ProviderError::rejected(format!("no provider handles kind '{kind}'")))
    }
}

impl Provider for KindRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn validate(&self, spec: &ResolvedSpec) -> ProviderResult<()> {
        self.provider_for(&spec.kind)?.validate(spec)
    }

    fn create(&self, spec: &ResolvedSpec) -> ProviderResult<String> {
        self.provider_for(&spec.kind)?.create(spec)
    }

    fn describe(&self, kind: &str, remote_id: &str) -> ProviderResult<Observation> {
        self.provider_for(kind)?.describe(kind, remote_id)
    }

    fn update(&self, remote_id: &str, spec: &ResolvedSpec) -> ProviderResult<()> {
        self.provider_for(&spec.kind)?.update(remote_id, spec)
    }

    fn delete(&self, kind: &str, remote_id: &str) -> ProviderResult<()> {
        self.provider_for(kind)?.delete(kind, remote_id)
    }
}
