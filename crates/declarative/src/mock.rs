//! Scripted in-memory provider for engine tests

use crate::provider::{Observation, Provider, ProviderError, ProviderResult, RemoteStatus, ResolvedSpec};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

struct Object {
    logical_id: String,
    kind: String,
    properties: BTreeMap<String, serde_json::Value>,
    polls: u32,
}

#[derive(Default)]
struct Inner {
    next_id: u32,
    objects: HashMap<String, Object>,
    calls: Vec<String>,
    /// Describe failures still to return, keyed by logical id
    transient: HashMap<String, u32>,
}

/// Provider whose behaviour is scripted per logical id
#[derive(Default)]
pub struct ScriptedProvider {
    inner: Mutex<Inner>,
    ready_after: u32,
    reject_create: HashSet<String>,
    reject_update: HashSet<String>,
    reject_delete: HashSet<String>,
    never_ready: HashSet<String>,
    remote_failure: HashSet<String>,
    panics: HashSet<String>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects report ready after this many describe calls
    pub fn ready_after(mut self, polls: u32) -> Self {
        self.ready_after = polls;
        self
    }

    pub fn reject_create(mut self, logical_id: &str) -> Self {
        self.reject_create.insert(logical_id.to_string());
        self
    }

    pub fn reject_update(mut self, logical_id: &str) -> Self {
        self.reject_update.insert(logical_id.to_string());
        self
    }

    pub fn reject_delete(mut self, logical_id: &str) -> Self {
        self.reject_delete.insert(logical_id.to_string());
        self
    }

    pub fn never_ready(mut self, logical_id: &str) -> Self {
        self.never_ready.insert(logical_id.to_string());
        self
    }

    pub fn remote_failure(mut self, logical_id: &str) -> Self {
        self.remote_failure.insert(logical_id.to_string());
        self
    }

    pub fn panic_on_create(mut self, logical_id: &str) -> Self {
        self.panics.insert(logical_id.to_string());
        self
    }

    pub fn transient_describes(self, logical_id: &str, count: u32) -> Self {
        self.lock().transient.insert(logical_id.to_string(), count);
        self
    }

    /// Calls made so far, as `"<op> <logical id>"`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of live remote objects
    pub fn live_objects(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn properties_of(&self, logical_id: &str) -> Option<BTreeMap<String, serde_json::Value>> {
        self.lock()
            .objects
            .values()
            .find(|o| o.logical_id == logical_id)
            .map(|o| o.properties.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn validate(&self, spec: &ResolvedSpec) -> ProviderResult<()> {
        if spec.properties.contains_key("invalid") {
            return Err(ProviderError::Invalid {
                errors: vec![format!("{}: property 'invalid' is not allowed", spec.logical_id)],
            });
        }
        Ok(())
    }

    fn create(&self, spec: &ResolvedSpec) -> ProviderResult<String> {
        if self.panics.contains(&spec.logical_id) {
            panic!("scripted panic for {}", spec.logical_id);
        }
        let mut inner = self.lock();
        inner.calls.push(format!("create {}", spec.logical_id));
        if self.reject_create.contains(&spec.logical_id) {
            return Err(ProviderError::rejected("LimitExceeded: quota reached"));
        }
        inner.next_id += 1;
        let remote_id = format!("{}-{:04}", spec.kind, inner.next_id);
        inner.objects.insert(
            remote_id.clone(),
            Object {
                logical_id: spec.logical_id.clone(),
                kind: spec.kind.clone(),
                properties: spec.properties.clone(),
                polls: 0,
            },
        );
        Ok(remote_id)
    }

    fn describe(&self, _kind: &str, remote_id: &str) -> ProviderResult<Observation> {
        let mut inner = self.lock();
        let Some(logical_id) = inner.objects.get(remote_id).map(|o| o.logical_id.clone()) else {
            return Err(ProviderError::NotFound {
                remote_id: remote_id.to_string(),
            });
        };
        if let Some(left) = inner.transient.get_mut(&logical_id)
            && *left > 0
        {
            *left -= 1;
            return Err(ProviderError::transient("service unavailable"));
        }
        let Some(object) = inner.objects.get_mut(remote_id) else {
            return Err(ProviderError::NotFound {
                remote_id: remote_id.to_string(),
            });
        };
        object.polls += 1;
        if self.remote_failure.contains(&object.logical_id) {
            return Ok(Observation::new(RemoteStatus::Failed {
                reason: "InsufficientCapacity".into(),
            }));
        }
        if self.never_ready.contains(&object.logical_id) || object.polls <= self.ready_after {
            return Ok(Observation::new(RemoteStatus::InProgress));
        }
        Ok(Observation::new(RemoteStatus::Ready)
            .with_attribute("arn", format!("arn:{}:{remote_id}", object.kind)))
    }

    fn update(&self, remote_id: &str, spec: &ResolvedSpec) -> ProviderResult<()> {
        let mut inner = self.lock();
        inner.calls.push(format!("update {}", spec.logical_id));
        if self.reject_update.contains(&spec.logical_id) {
            return Err(ProviderError::rejected("InvalidParameterValue"));
        }
        let object = inner
            .objects
            .get_mut(remote_id)
            .ok_or_else(|| ProviderError::NotFound {
                remote_id: remote_id.to_string(),
            })?;
        object.properties = spec.properties.clone();
        object.polls = 0;
        Ok(())
    }

    /// Rejects deleting an object another live object still refers to
    fn delete(&self, _kind: &str, remote_id: &str) -> ProviderResult<()> {
        let mut inner = self.lock();
        let logical_id = inner
            .objects
            .get(remote_id)
            .map_or_else(|| remote_id.to_string(), |o| o.logical_id.clone());
        inner.calls.push(format!("delete {logical_id}"));
        if self.reject_delete.contains(&logical_id) {
            return Err(ProviderError::rejected("OperationNotPermitted: delete protection"));
        }
        let in_use = inner
            .objects
            .values()
            .any(|o| o.properties.values().any(|v| v.as_str() == Some(remote_id)));
        if in_use {
            return Err(ProviderError::rejected(format!(
                "DependencyViolation: {remote_id} has dependent objects"
            )));
        }
        inner.objects.remove(remote_id);
        Ok(())
    }
}
