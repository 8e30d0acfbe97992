//! Execution engine - drives a change-set through the provider
//!
//! The scheduler runs on the calling thread. Entries whose prerequisites
//! have succeeded are handed to a bounded rayon pool; workers report
//! transitions back over a channel so only the scheduler touches the
//! progress callback. Every transition is persisted before it is reported.
//!
//! A replace is two jobs. The teardown removes the old object once the old
//! objects of its dependents are gone; the build creates the new object
//! once its prerequisites have succeeded. Teardowns therefore run leaf
//! first and builds root first.

use crate::context::{CancelToken, ProgressCallback};
use crate::error::{Error, ResourceError, Result};
use crate::planner::{ChangeEntry, ChangeSet, Desired};
use crate::provider::{Observation, Provider, ProviderError, ResolvedSpec};
use crate::schema::ID_ATTRIBUTE;
use crate::state::{StateRecord, StateStore};
use crate::types::{
    ExecuteOptions, ExecuteReport, ExecuteSummary, FailurePolicy, Operation, ResourceOutcome,
    ResourceStatus, StackStatus,
};
use crate::value::Reference;
use crate::wait::{WaitError, WaitTarget, wait_for};
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Sender};

enum Event {
    Transition {
        index: usize,
        status: ResourceStatus,
    },
    /// The old object of a replace is gone; its build may start
    TornDown { index: usize },
    Finished {
        index: usize,
        outcome: ResourceOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Delete the previous object of a replace
    Teardown,
    /// Everything else, including the create half of a replace
    Apply,
}

/// Execute a change-set
///
/// Resource failures end up in the report; only problems that make the
/// whole run meaningless (a worker pool that cannot start, state that
/// cannot be written for outputs) are returned as errors.
pub fn execute<P: ProgressCallback>(
    change_set: &ChangeSet,
    provider: &dyn Provider,
    store: &StateStore,
    options: &ExecuteOptions,
    cancel: &CancelToken,
    progress: &mut P,
) -> Result<ExecuteReport> {
    let entries = &change_set.entries;
    let index: HashMap<&str, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.as_str(), i))
        .collect();
    let prerequisites: Vec<Vec<usize>> = entries
        .iter()
        .map(|e| {
            e.prerequisites
                .iter()
                .filter_map(|p| index.get(p.as_str()).copied())
                .collect()
        })
        .collect();
    let teardown_after: Vec<Vec<usize>> = entries
        .iter()
        .map(|e| {
            e.teardown_after
                .iter()
                .filter_map(|p| index.get(p.as_str()).copied())
                .collect()
        })
        .collect();

    let mut status: Vec<ResourceStatus> = Vec::with_capacity(entries.len());
    let mut outcomes: Vec<Option<ResourceOutcome>> = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_change() {
            status.push(ResourceStatus::Pending);
            outcomes.push(None);
        } else {
            let mut outcome = ResourceOutcome::new(
                &entry.id,
                &entry.kind,
                Operation::NoOp,
                ResourceStatus::Succeeded,
            );
            outcome.remote_id = store.get(&entry.id).and_then(|r| r.remote_id);
            status.push(ResourceStatus::Succeeded);
            outcomes.push(Some(outcome));
        }
    }
    let mut started = vec![false; entries.len()];
    let needs_teardown: Vec<bool> = entries
        .iter()
        .map(|e| e.operation == Operation::Replace)
        .collect();
    let mut teardown_started = vec![false; entries.len()];
    let mut torn_down = vec![false; entries.len()];

    let limit = options.concurrency.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(limit)
        .thread_name(|i| format!("apply-worker-{i}"))
        .build()
        .map_err(|e| Error::WorkerPool(e.to_string()))?;

    progress.on_run_start(change_set.changes().count());
    log::info!(
        "Applying {} change(s) to stack '{}' with up to {limit} in flight",
        change_set.changes().count(),
        change_set.stack
    );

    let (tx, rx) = mpsc::channel::<Event>();
    let mut aborted = false;

    pool.in_place_scope(|scope| {
        let mut running = 0usize;
        loop {
            // Cascade: a prerequisite that finished without success skips
            // everything waiting on it.
            let mut cascaded = true;
            while cascaded {
                cascaded = false;
                for i in 0..entries.len() {
                    let in_flight = started[i] || (teardown_started[i] && !torn_down[i]);
                    if in_flight || outcomes[i].is_some() {
                        continue;
                    }
                    let failed_prerequisite = prerequisites[i]
                        .iter()
                        .copied()
                        .find(|&p| outcomes[p].is_some() && !status[p].is_success());
                    let blocker = failed_prerequisite.or_else(|| {
                        if teardown_started[i] {
                            return None;
                        }
                        teardown_after[i].iter().copied().find(|&p| {
                            outcomes[p].is_some() && !old_object_gone(p, &torn_down, &status)
                        })
                    });
                    if let Some(p) = blocker {
                        let entry = &entries[i];
                        let mut outcome = ResourceOutcome::new(
                            &entry.id,
                            &entry.kind,
                            entry.operation,
                            ResourceStatus::Skipped,
                        );
                        outcome.error = Some(ResourceError::PrerequisiteFailed {
                            prerequisite: entries[p].id.clone(),
                        });
                        log::warn!("Skipping {}: {} did not succeed", entry.id, entries[p].id);
                        status[i] = ResourceStatus::Skipped;
                        progress.on_resource_complete(&outcome);
                        outcomes[i] = Some(outcome);
                        cascaded = true;
                    }
                }
            }

            if !aborted && !cancel.is_cancelled() {
                for i in 0..entries.len() {
                    if running >= limit {
                        break;
                    }
                    if started[i] || outcomes[i].is_some() {
                        continue;
                    }
                    let entry = &entries[i];
                    let phase = if needs_teardown[i] && !torn_down[i] {
                        if teardown_started[i] {
                            continue;
                        }
                        Phase::Teardown
                    } else {
                        Phase::Apply
                    };
                    let blockers_gone = teardown_after[i]
                        .iter()
                        .all(|&p| old_object_gone(p, &torn_down, &status));
                    let ready = match phase {
                        Phase::Teardown => blockers_gone,
                        Phase::Apply => {
                            blockers_gone && prerequisites[i].iter().all(|&p| status[p].is_success())
                        }
                    };
                    if !ready {
                        continue;
                    }

                    if phase == Phase::Teardown {
                        teardown_started[i] = true;
                        progress.on_resource_start(&entry.id, entry.operation);
                    } else {
                        started[i] = true;
                        if !needs_teardown[i] {
                            progress.on_resource_start(&entry.id, entry.operation);
                        }
                    }
                    running += 1;

                    let mut worker = Worker {
                        index: i,
                        entry,
                        phase,
                        provider,
                        store,
                        options,
                        cancel,
                        events: tx.clone(),
                        old_removed: needs_teardown[i] && phase == Phase::Apply,
                    };
                    scope.spawn(move |_| {
                        let outcome = worker.run_guarded();
                        let event = if phase == Phase::Teardown && outcome.error.is_none() {
                            Event::TornDown { index: i }
                        } else {
                            Event::Finished { index: i, outcome }
                        };
                        // The scheduler outlives every worker
                        let _ = worker.events.send(event);
                    });
                }
            }

            if running == 0 {
                break;
            }

            match rx.recv() {
                Ok(Event::Transition { index, status: s }) => {
                    status[index] = s;
                    progress.on_transition(&entries[index].id, s);
                }
                Ok(Event::TornDown { index }) => {
                    running -= 1;
                    torn_down[index] = true;
                    log::debug!("{}: old object gone", entries[index].id);
                }
                Ok(Event::Finished { index, outcome }) => {
                    running -= 1;
                    status[index] = outcome.status;
                    if !outcome.is_success() {
                        if let Some(err) = &outcome.error {
                            log::error!("{} failed: {err}", outcome.id);
                        }
                        if options.failure_policy == FailurePolicy::Abort && !aborted {
                            log::warn!("Aborting: no new operations will start");
                            aborted = true;
                        }
                    }
                    progress.on_resource_complete(&outcome);
                    outcomes[index] = Some(outcome);
                }
                Err(_) => break,
            }
        }
    });

    // Never started stays `Pending`; a replace stopped between its halves
    // keeps its last reported status.
    let outcomes: Vec<ResourceOutcome> = outcomes
        .into_iter()
        .zip(entries)
        .zip(&status)
        .map(|((outcome, entry), last)| {
            outcome.unwrap_or_else(|| ResourceOutcome::new(&entry.id, &entry.kind, entry.operation, *last))
        })
        .collect();

    let mut summary = ExecuteSummary::default();
    for outcome in &outcomes {
        summary.add_outcome(outcome);
    }

    let outputs = resolve_outputs(change_set, store);
    store.set_outputs(outputs.clone())?;

    let status = if cancel.is_cancelled() {
        StackStatus::Cancelled
    } else if summary.is_success() {
        StackStatus::Succeeded
    } else {
        StackStatus::Failed
    };
    progress.on_run_complete(&summary);
    log::info!(
        "Stack '{}' finished: {status:?} ({} change(s) applied)",
        change_set.stack,
        summary.total_changes()
    );

    Ok(ExecuteReport {
        stack: change_set.stack.clone(),
        status,
        outcomes,
        outputs,
        summary,
    })
}

/// The old object of entry `j` no longer exists
fn old_object_gone(j: usize, torn_down: &[bool], status: &[ResourceStatus]) -> bool {
    torn_down[j] || status[j] == ResourceStatus::Deleted
}

/// Resolve stack outputs from succeeded records; others are left out
fn resolve_outputs(change_set: &ChangeSet, store: &StateStore) -> BTreeMap<String, serde_json::Value> {
    let mut outputs = BTreeMap::new();
    for binding in &change_set.outputs {
        let resolved = binding.value.to_json(&mut |r: &Reference| lookup_output(store, r));
        match resolved {
            Ok(value) => {
                outputs.insert(binding.name.clone(), value);
            }
            Err(e) => log::debug!("Output '{}' not available: {e}", binding.name),
        }
    }
    outputs
}

/// Look up an exported attribute in a succeeded record
fn lookup_output(store: &StateStore, reference: &Reference) -> std::result::Result<serde_json::Value, ResourceError> {
    let unresolved = |message: String| ResourceError::UnresolvedOutput {
        reference: reference.to_string(),
        message,
    };
    let Reference::Output {
        resource,
        attribute,
    } = reference
    else {
        return Err(unresolved("parameter was not substituted".into()));
    };
    let record = store
        .get(resource)
        .ok_or_else(|| unresolved(format!("'{resource}' has no recorded state")))?;
    if record.status != ResourceStatus::Succeeded {
        return Err(unresolved(format!("'{resource}' is {}", record.status)));
    }
    record
        .output(attribute)
        .cloned()
        .ok_or_else(|| unresolved(format!("'{resource}' does not export '{attribute}'")))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Applies one entry on a pool thread
struct Worker<'a> {
    index: usize,
    entry: &'a ChangeEntry,
    phase: Phase,
    provider: &'a dyn Provider,
    store: &'a StateStore,
    options: &'a ExecuteOptions,
    cancel: &'a CancelToken,
    events: Sender<Event>,
    /// The previous remote object of a replace is gone
    old_removed: bool,
}

type Step = std::result::Result<(), ResourceError>;

impl<'a> Worker<'a> {
    fn run_guarded(&mut self) -> ResourceOutcome {
        let mut outcome = ResourceOutcome::new(
            &self.entry.id,
            &self.entry.kind,
            self.entry.operation,
            ResourceStatus::Pending,
        );

        let result = match catch_unwind(AssertUnwindSafe(|| self.run(&mut outcome))) {
            Ok(result) => result,
            Err(payload) => Err(ResourceError::Panicked(panic_message(payload.as_ref()))),
        };

        if let Err(error) = result {
            if !error.leaves_in_progress() {
                self.record_failure(&error, outcome.remote_id.is_some());
                outcome.status = ResourceStatus::Failed;
            }
            outcome.error = Some(error);
        }
        outcome
    }

    fn run(&mut self, outcome: &mut ResourceOutcome) -> Step {
        let operation = self.entry.operation;
        if self.cancel.is_cancelled() {
            return Err(ResourceError::Cancelled { operation });
        }
        log::debug!("{} {}: {}", operation, self.entry.id, self.entry.reason);
        if self.phase == Phase::Teardown {
            return self.teardown(outcome);
        }

        match operation {
            Operation::Create => {
                let desired = self.desired()?;
                self.create(desired, outcome)
            }
            Operation::Update => {
                let desired = self.desired()?;
                self.update(desired, outcome)
            }
            Operation::Replace => {
                // The teardown already removed the previous object
                let desired = self.desired()?;
                self.create(desired, outcome)
            }
            Operation::Delete => self.delete(outcome),
            Operation::NoOp => {
                outcome.status = ResourceStatus::Succeeded;
                Ok(())
            }
        }
    }

    fn desired(&self) -> std::result::Result<&'a Desired, ResourceError> {
        self.entry.desired.as_ref().ok_or_else(|| {
            ResourceError::State(format!("{} entry carries no configuration", self.entry.operation))
        })
    }

    fn create(&mut self, desired: &Desired, outcome: &mut ResourceOutcome) -> Step {
        let operation = self.entry.operation;
        let spec = self.resolve(desired)?;
        self.provider
            .validate(&spec)
            .map_err(|e| submit_error(operation, e))?;
        let remote_id = self
            .provider
            .create(&spec)
            .map_err(|e| submit_error(operation, e))?;
        outcome.remote_id = Some(remote_id.clone());

        let kind = self.entry.kind.clone();
        let accepted = remote_id.clone();
        self.transition(outcome, ResourceStatus::Creating, |record| {
            record.kind = kind;
            record.remote_id = Some(accepted);
            record.config_hash.clone_from(&desired.config_hash);
            record.applied_config.clone_from(&desired.config);
            record.dependencies.clone_from(&desired.dependencies);
            record.outputs.clear();
        })?;

        let observation = self.wait(&remote_id, WaitTarget::Ready)?;
        self.succeed(desired, &remote_id, observation, outcome)
    }

    fn update(&mut self, desired: &Desired, outcome: &mut ResourceOutcome) -> Step {
        let operation = Operation::Update;
        let remote_id = self.recorded_remote_id()?;
        outcome.remote_id = Some(remote_id.clone());

        self.transition(outcome, ResourceStatus::Updating, |_| {})?;
        let spec = self.resolve(desired)?;
        self.provider
            .validate(&spec)
            .map_err(|e| submit_error(operation, e))?;
        self.provider
            .update(&remote_id, &spec)
            .map_err(|e| submit_error(operation, e))?;

        let observation = self.wait(&remote_id, WaitTarget::Ready)?;
        self.succeed(desired, &remote_id, observation, outcome)
    }

    /// Remove the previous object of a replace and drop its record
    fn teardown(&mut self, outcome: &mut ResourceOutcome) -> Step {
        if let Some(record) = self.store.get(&self.entry.id)
            && let Some(old_id) = record.remote_id
        {
            outcome.remote_id = Some(old_id.clone());
            self.transition(outcome, ResourceStatus::Deleting, |_| {})?;
            self.remove_remote(&record.kind, &old_id)?;
            log::info!("{}: previous object {old_id} removed", self.entry.id);
        }
        self.store
            .remove(&self.entry.id)
            .map_err(|e| ResourceError::State(e.to_string()))?;
        self.old_removed = true;
        Ok(())
    }

    fn delete(&mut self, outcome: &mut ResourceOutcome) -> Step {
        let record = self.store.get(&self.entry.id);
        if let Some(record) = &record
            && let Some(remote_id) = &record.remote_id
        {
            outcome.remote_id = Some(remote_id.clone());
            self.transition(outcome, ResourceStatus::Deleting, |_| {})?;
            self.remove_remote(&record.kind, remote_id)?;
        }
        self.store
            .remove(&self.entry.id)
            .map_err(|e| ResourceError::State(e.to_string()))?;
        self.report(outcome, ResourceStatus::Deleted);
        Ok(())
    }

    /// Submit a delete and wait until the object is gone
    fn remove_remote(&self, kind: &str, remote_id: &str) -> Step {
        let operation = self.entry.operation;
        match self.provider.delete(kind, remote_id) {
            Ok(()) | Err(ProviderError::NotFound { .. }) => {}
            Err(e) => return Err(submit_error(operation, e)),
        }
        self.wait_kind(kind, remote_id, WaitTarget::Gone).map(|_| ())
    }

    fn succeed(
        &self,
        desired: &Desired,
        remote_id: &str,
        observation: Observation,
        outcome: &mut ResourceOutcome,
    ) -> Step {
        let kind = self.entry.kind.clone();
        let mut outputs = observation.attributes;
        outputs.insert(
            ID_ATTRIBUTE.to_string(),
            serde_json::Value::String(remote_id.to_string()),
        );
        self.transition(outcome, ResourceStatus::Succeeded, |record| {
            record.kind = kind;
            record.remote_id = Some(remote_id.to_string());
            record.config_hash.clone_from(&desired.config_hash);
            record.applied_config.clone_from(&desired.config);
            record.dependencies.clone_from(&desired.dependencies);
            record.last_error = None;
            record.outputs = outputs;
        })
    }

    fn recorded_remote_id(&self) -> std::result::Result<String, ResourceError> {
        self.store
            .get(&self.entry.id)
            .and_then(|r| r.remote_id)
            .ok_or_else(|| ResourceError::State(format!("no remote id recorded for {}", self.entry.id)))
    }

    /// Resolve output references against prerequisite records
    fn resolve(&self, desired: &Desired) -> std::result::Result<ResolvedSpec, ResourceError> {
        let mut properties = BTreeMap::new();
        for (name, value) in &desired.config {
            let json = value.to_json(&mut |r: &Reference| lookup_output(self.store, r))?;
            properties.insert(name.clone(), json);
        }
        Ok(ResolvedSpec {
            logical_id: self.entry.id.clone(),
            kind: self.entry.kind.clone(),
            properties,
        })
    }

    fn wait(&self, remote_id: &str, target: WaitTarget) -> std::result::Result<Observation, ResourceError> {
        self.wait_kind(&self.entry.kind, remote_id, target)
    }

    fn wait_kind(
        &self,
        kind: &str,
        remote_id: &str,
        target: WaitTarget,
    ) -> std::result::Result<Observation, ResourceError> {
        let operation = self.entry.operation;
        wait_for(self.provider, kind, remote_id, target, &self.options.wait, self.cancel).map_err(|e| match e {
            WaitError::Timeout { elapsed } => ResourceError::Timeout { operation, elapsed },
            WaitError::Remote { message } => ResourceError::Remote { operation, message },
            WaitError::Cancelled => ResourceError::Cancelled { operation },
        })
    }

    /// Persist a status change, then report it
    fn transition<F>(&self, outcome: &mut ResourceOutcome, status: ResourceStatus, update: F) -> Step
    where
        F: FnOnce(&mut StateRecord),
    {
        let entry = self.entry;
        self.store
            .modify(&entry.id, |slot| {
                let record = slot.get_or_insert_with(|| StateRecord::new(&entry.kind, status));
                record.status = status;
                record.last_operation = Some(entry.operation);
                update(record);
            })
            .map_err(|e| ResourceError::State(e.to_string()))?;
        self.report(outcome, status);
        Ok(())
    }

    fn report(&self, outcome: &mut ResourceOutcome, status: ResourceStatus) {
        outcome.status = status;
        log::info!("{}: {status}", self.entry.id);
        let _ = self.events.send(Event::Transition {
            index: self.index,
            status,
        });
    }

    /// Record a terminal failure
    ///
    /// `accepted` tells whether a new remote object exists for this run.
    fn record_failure(&self, error: &ResourceError, accepted: bool) {
        let entry = self.entry;
        // The old object of a replace is gone and nothing replaced it
        let detached = self.old_removed && !accepted;
        let message = error.to_string();
        let result = self.store.modify(&entry.id, |slot| {
            let record =
                slot.get_or_insert_with(|| StateRecord::new(&entry.kind, ResourceStatus::Failed));
            record.status = ResourceStatus::Failed;
            record.last_operation = Some(entry.operation);
            record.last_error = Some(message);
            if detached {
                record.remote_id = None;
                record.outputs.clear();
            }
        });
        if let Err(e) = result {
            log::error!("Could not record failure of {}: {e}", entry.id);
        }
        let _ = self.events.send(Event::Transition {
            index: self.index,
            status: ResourceStatus::Failed,
        });
    }
}

/// Map an error from a submitted request
fn submit_error(operation: Operation, error: ProviderError) -> ResourceError {
    match error {
        ProviderError::Rejected { .. } | ProviderError::Invalid { .. } => ResourceError::RemoteRejection {
            operation,
            message: error.to_string(),
        },
        other => ResourceError::Remote {
            operation,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::diff::{compute_change_set, plan_destroy};
    use crate::graph::{ResourceDecl, ResourceGraph, StackDecl};
    use crate::mock::ScriptedProvider;
    use crate::schema::{KindCatalog, KindSchema};
    use crate::wait::WaitConfig;
    use crate::provider::ProviderResult;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn catalog() -> KindCatalog {
        KindCatalog::new()
            .with(KindSchema::new("network").mutable(["tags"]).outputs(["arn"]))
            .with(KindSchema::new("subnet").mutable(["tags"]).outputs(["arn"]))
            .with(KindSchema::new("compute_instance").mutable(["tags"]).outputs(["arn"]))
            .with(KindSchema::new("storage_bucket").mutable(["tags"]))
    }

    fn options() -> ExecuteOptions {
        ExecuteOptions {
            concurrency: 4,
            wait: WaitConfig {
                poll_interval: Duration::from_millis(1),
                max_poll_interval: Duration::from_millis(2),
                backoff_factor: 2.0,
                timeout: Duration::from_secs(5),
            },
            failure_policy: FailurePolicy::Abort,
        }
    }

    fn three_tier(with_instance: bool) -> StackDecl {
        three_tier_in("10.0.0.0/16", with_instance)
    }

    fn three_tier_in(cidr: &str, with_instance: bool) -> StackDecl {
        let mut decl = StackDecl::new("web", "us-east-1")
            .resource(ResourceDecl::new("network", "network").property("cidr_block", cidr))
            .resource(
                ResourceDecl::new("subnet", "subnet")
                    .property("network_id", Reference::output("network", "id"))
                    .property("cidr_block", "10.0.1.0/24"),
            )
            .output("network_id", Reference::output("network", "id"));
        if with_instance {
            decl = decl.resource(
                ResourceDecl::new("instance", "compute_instance")
                    .property("subnet_id", Reference::output("subnet", "id")),
            );
        }
        decl
    }

    fn apply(
        decl: StackDecl,
        store: &StateStore,
        provider: &ScriptedProvider,
        options: &ExecuteOptions,
    ) -> ExecuteReport {
        let graph = ResourceGraph::build(decl, &catalog()).unwrap();
        let change_set = compute_change_set(&graph, &store.snapshot(), &catalog()).unwrap();
        execute(
            &change_set,
            provider,
            store,
            options,
            &CancelToken::new(),
            &mut NoProgress,
        )
        .unwrap()
    }

    #[test]
    fn network_subnet_instance_scenario() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("web.json");
        let provider = ScriptedProvider::new().ready_after(1);

        // First apply creates everything in dependency order
        let store = StateStore::open(&path, "web").unwrap();
        let report = apply(three_tier(true), &store, &provider, &options());
        assert!(report.is_success());
        assert_eq!(report.summary.created, 3);
        assert_eq!(
            provider.calls(),
            vec!["create network", "create subnet", "create instance"]
        );

        // Second apply against reloaded state changes nothing
        let store = StateStore::open(&path, "web").unwrap();
        assert_eq!(store.len(), 3);
        let report = apply(three_tier(true), &store, &provider, &options());
        assert!(report.is_success());
        assert_eq!(report.summary.no_change, 3);
        assert_eq!(provider.calls().len(), 3);

        // Removing the instance deletes only the instance
        let report = apply(three_tier(false), &store, &provider, &options());
        assert!(report.is_success());
        assert_eq!(report.summary.removed, 1);
        assert_eq!(provider.calls().last().unwrap(), "delete instance");
        let store = StateStore::open(&path, "web").unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get("instance").is_none());
    }

    #[test]
    fn references_resolve_to_recorded_outputs() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new();
        let report = apply(three_tier(false), &store, &provider, &options());
        assert!(report.is_success());

        let network = store.get("network").unwrap();
        let network_id = network.remote_id.clone().unwrap();
        let subnet_props = provider.properties_of("subnet").unwrap();
        assert_eq!(subnet_props["network_id"], network_id.as_str());
        assert_eq!(network.output("id").and_then(|v| v.as_str()), Some(network_id.as_str()));
        assert!(network.output("arn").is_some());

        assert_eq!(report.outputs["network_id"], network_id.as_str());
        assert_eq!(store.outputs()["network_id"], network_id.as_str());
    }

    #[test]
    fn failure_cascades_to_dependents_only() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new().reject_create("subnet");
        let options = ExecuteOptions {
            failure_policy: FailurePolicy::Continue,
            ..options()
        };
        let decl = three_tier(true)
            .resource(ResourceDecl::new("assets", "storage_bucket").property("name", "assets"));
        let report = apply(decl, &store, &provider, &options);

        assert_eq!(report.status, StackStatus::Failed);
        assert_eq!(report.outcome("network").unwrap().status, ResourceStatus::Succeeded);
        assert_eq!(report.outcome("assets").unwrap().status, ResourceStatus::Succeeded);

        let subnet = report.outcome("subnet").unwrap();
        assert_eq!(subnet.status, ResourceStatus::Failed);
        assert!(matches!(
            subnet.error,
            Some(ResourceError::RemoteRejection { ref message, .. }) if message.contains("LimitExceeded")
        ));

        let instance = report.outcome("instance").unwrap();
        assert_eq!(instance.status, ResourceStatus::Skipped);
        assert_eq!(
            instance.error,
            Some(ResourceError::PrerequisiteFailed {
                prerequisite: "subnet".into()
            })
        );

        let record = store.get("subnet").unwrap();
        assert_eq!(record.status, ResourceStatus::Failed);
        assert!(record.remote_id.is_none());
        assert!(record.last_error.unwrap().contains("LimitExceeded"));
    }

    #[test]
    fn timeout_leaves_record_in_progress() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new().never_ready("instance");
        let mut options = options();
        options.wait.timeout = Duration::from_millis(50);
        let report = apply(three_tier(true), &store, &provider, &options);

        assert!(!report.is_success());
        let instance = report.outcome("instance").unwrap();
        assert_eq!(instance.status, ResourceStatus::Creating);
        assert!(matches!(
            instance.error,
            Some(ResourceError::Timeout {
                operation: Operation::Create,
                ..
            })
        ));
        assert_eq!(report.failed().count(), 0);
        assert_eq!(report.incomplete().count(), 1);
        assert_eq!(report.in_progress().count(), 1);
        assert_eq!(report.not_started().count(), 0);
        assert_eq!(report.outcome("network").unwrap().status, ResourceStatus::Succeeded);
        assert_eq!(report.outcome("subnet").unwrap().status, ResourceStatus::Succeeded);

        let record = store.get("instance").unwrap();
        assert_eq!(record.status, ResourceStatus::Creating);
        assert!(record.remote_id.is_some());
    }

    #[test]
    fn resume_skips_succeeded_and_continues() {
        let store = StateStore::in_memory("web");
        let failing = ScriptedProvider::new().reject_create("subnet");
        let report = apply(three_tier(true), &store, &failing, &options());
        assert!(!report.is_success());
        assert_eq!(store.get("network").unwrap().status, ResourceStatus::Succeeded);

        let healthy = ScriptedProvider::new();
        let report = apply(three_tier(true), &store, &healthy, &options());
        assert!(report.is_success());
        assert_eq!(report.outcome("network").unwrap().operation, Operation::NoOp);
        assert_eq!(healthy.calls(), vec!["create subnet", "create instance"]);
    }

    #[test]
    fn abort_policy_stops_new_work() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new().reject_create("first");
        let decl = StackDecl::new("web", "us-east-1")
            .resource(ResourceDecl::new("first", "storage_bucket"))
            .resource(ResourceDecl::new("second", "storage_bucket"));
        let options = ExecuteOptions {
            concurrency: 1,
            ..options()
        };
        let report = apply(decl, &store, &provider, &options);

        assert_eq!(report.status, StackStatus::Failed);
        assert_eq!(report.outcome("first").unwrap().status, ResourceStatus::Failed);
        assert_eq!(report.outcome("second").unwrap().status, ResourceStatus::Pending);
        assert_eq!(report.summary.not_started, 1);
        assert_eq!(report.in_progress().count(), 0);
        assert_eq!(provider.calls(), vec!["create first"]);
    }

    #[test]
    fn cancelled_run_starts_nothing() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new();
        let graph = ResourceGraph::build(three_tier(true), &catalog()).unwrap();
        let change_set = compute_change_set(&graph, &store.snapshot(), &catalog()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = execute(&change_set, &provider, &store, &options(), &cancel, &mut NoProgress).unwrap();
        assert_eq!(report.status, StackStatus::Cancelled);
        assert!(provider.calls().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn worker_panic_becomes_failure() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new().panic_on_create("network");
        let report = apply(three_tier(true), &store, &provider, &options());

        let network = report.outcome("network").unwrap();
        assert_eq!(network.status, ResourceStatus::Failed);
        assert!(matches!(network.error, Some(ResourceError::Panicked(_))));
        assert_eq!(report.outcome("subnet").unwrap().status, ResourceStatus::Skipped);
    }

    #[test]
    fn remote_failure_marks_record_failed() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new().remote_failure("network");
        let report = apply(three_tier(false), &store, &provider, &options());

        let network = report.outcome("network").unwrap();
        assert_eq!(network.status, ResourceStatus::Failed);
        assert_eq!(
            network.error,
            Some(ResourceError::Remote {
                operation: Operation::Create,
                message: "InsufficientCapacity".into()
            })
        );
        let record = store.get("network").unwrap();
        assert_eq!(record.status, ResourceStatus::Failed);
        assert!(record.remote_id.is_some());
    }

    #[test]
    fn immutable_change_replaces_the_object() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new();
        apply(three_tier(false), &store, &provider, &options());
        let old_id = store.get("network").unwrap().remote_id.unwrap();

        let decl = StackDecl::new("web", "us-east-1")
            .resource(ResourceDecl::new("network", "network").property("cidr_block", "10.9.0.0/16"))
            .resource(
                ResourceDecl::new("subnet", "subnet")
                    .property("network_id", Reference::output("network", "id"))
                    .property("cidr_block", "10.0.1.0/24"),
            );
        let report = apply(decl, &store, &provider, &options());
        assert!(report.is_success());
        assert_eq!(report.summary.replaced, 2);

        let new_id = store.get("network").unwrap().remote_id.unwrap();
        assert_ne!(old_id, new_id);
        let subnet_props = provider.properties_of("subnet").unwrap();
        assert_eq!(subnet_props["network_id"], new_id.as_str());
        assert_eq!(provider.live_objects(), 2);
    }

    #[test]
    fn replace_deletes_leaf_first_and_creates_root_first() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new();
        assert!(apply(three_tier(true), &store, &provider, &options()).is_success());

        let report = apply(three_tier_in("10.9.0.0/16", true), &store, &provider, &options());
        assert!(report.is_success(), "{:?}", report.outcomes);
        assert_eq!(report.summary.replaced, 3);
        assert_eq!(
            provider.calls()[3..],
            [
                "delete instance",
                "delete subnet",
                "delete network",
                "create network",
                "create subnet",
                "create instance",
            ]
        );
        assert_eq!(provider.live_objects(), 3);

        let network_id = store.get("network").unwrap().remote_id.unwrap();
        assert_eq!(provider.properties_of("subnet").unwrap()["network_id"], network_id.as_str());
    }

    #[test]
    fn failed_teardown_keeps_the_parent_in_place() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new().reject_delete("subnet");
        apply(three_tier(false), &store, &provider, &options());
        let old_network = store.get("network").unwrap();

        let options = ExecuteOptions {
            failure_policy: FailurePolicy::Continue,
            ..options()
        };
        let report = apply(three_tier_in("10.9.0.0/16", false), &store, &provider, &options);

        assert_eq!(report.outcome("subnet").unwrap().status, ResourceStatus::Failed);
        let network = report.outcome("network").unwrap();
        assert_eq!(network.status, ResourceStatus::Skipped);
        assert_eq!(
            network.error,
            Some(ResourceError::PrerequisiteFailed {
                prerequisite: "subnet".into()
            })
        );
        assert!(!provider.calls().iter().any(|c| c == "delete network"));

        // Both old objects are still tracked, so the next run retries
        assert_eq!(store.get("network").unwrap(), old_network);
        let subnet = store.get("subnet").unwrap();
        assert_eq!(subnet.status, ResourceStatus::Failed);
        assert!(subnet.remote_id.is_some());
    }

    #[test]
    fn replace_waits_for_removed_dependents() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new();
        apply(three_tier(false), &store, &provider, &options());

        let only_network = StackDecl::new("web", "us-east-1")
            .resource(ResourceDecl::new("network", "network").property("cidr_block", "10.9.0.0/16"));
        let report = apply(only_network, &store, &provider, &options());
        assert!(report.is_success(), "{:?}", report.outcomes);
        assert_eq!(
            provider.calls()[2..],
            ["delete subnet", "delete network", "create network"]
        );
        assert!(store.get("subnet").is_none());
    }

    /// Creates take a while; counts how many run at once
    struct SlowProvider {
        inner: ScriptedProvider,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Provider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        fn validate(&self, spec: &ResolvedSpec) -> ProviderResult<()> {
            self.inner.validate(spec)
        }

        fn create(&self, spec: &ResolvedSpec) -> ProviderResult<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let result = self.inner.create(spec);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn describe(&self, kind: &str, remote_id: &str) -> ProviderResult<Observation> {
            self.inner.describe(kind, remote_id)
        }

        fn update(&self, remote_id: &str, spec: &ResolvedSpec) -> ProviderResult<()> {
            self.inner.update(remote_id, spec)
        }

        fn delete(&self, kind: &str, remote_id: &str) -> ProviderResult<()> {
            self.inner.delete(kind, remote_id)
        }
    }

    #[test]
    fn independent_entries_run_concurrently_up_to_the_limit() {
        let store = StateStore::in_memory("web");
        let provider = SlowProvider {
            inner: ScriptedProvider::new(),
            delay: Duration::from_millis(50),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        let decl = (0..8).fold(StackDecl::new("web", "us-east-1"), |decl, i| {
            decl.resource(ResourceDecl::new(format!("bucket{i}"), "storage_bucket"))
        });
        let graph = ResourceGraph::build(decl, &catalog()).unwrap();
        let change_set = compute_change_set(&graph, &store.snapshot(), &catalog()).unwrap();
        let options = ExecuteOptions {
            concurrency: 3,
            ..options()
        };

        let report = execute(&change_set, &provider, &store, &options, &CancelToken::new(), &mut NoProgress).unwrap();
        assert!(report.is_success());
        assert_eq!(report.summary.created, 8);
        assert_eq!(provider.inner.calls().len(), 8);
        let peak = provider.peak.load(Ordering::SeqCst);
        assert!(peak > 1, "independent entries ran one at a time");
        assert!(peak <= 3, "{peak} creates in flight with a limit of 3");
    }

    #[test]
    fn destroy_removes_everything_dependents_first() {
        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new();
        apply(three_tier(true), &store, &provider, &options());

        let change_set = plan_destroy(&store.snapshot()).unwrap();
        let report = execute(
            &change_set,
            &provider,
            &store,
            &options(),
            &CancelToken::new(),
            &mut NoProgress,
        )
        .unwrap();

        assert!(report.is_success());
        assert_eq!(report.summary.removed, 3);
        let deletes: Vec<String> = provider
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("delete"))
            .collect();
        assert_eq!(deletes, vec!["delete instance", "delete subnet", "delete network"]);
        assert!(store.is_empty());
        assert_eq!(provider.live_objects(), 0);
    }

    #[test]
    fn progress_sees_every_transition() {
        #[derive(Default)]
        struct Recorder {
            events: Vec<String>,
        }

        impl ProgressCallback for Recorder {
            fn on_run_start(&mut self, changes: usize) {
                self.events.push(format!("start {changes}"));
            }
            fn on_resource_start(&mut self, id: &str, operation: Operation) {
                self.events.push(format!("{operation} {id}"));
            }
            fn on_transition(&mut self, id: &str, status: ResourceStatus) {
                self.events.push(format!("{id} {status}"));
            }
            fn on_resource_complete(&mut self, outcome: &ResourceOutcome) {
                self.events.push(format!("done {}", outcome.id));
            }
            fn on_run_complete(&mut self, summary: &ExecuteSummary) {
                self.events.push(format!("end {}", summary.total_changes()));
            }
        }

        let store = StateStore::in_memory("web");
        let provider = ScriptedProvider::new();
        let decl = StackDecl::new("web", "us-east-1").resource(ResourceDecl::new("network", "network"));
        let graph = ResourceGraph::build(decl, &catalog()).unwrap();
        let change_set = compute_change_set(&graph, &store.snapshot(), &catalog()).unwrap();
        let mut recorder = Recorder::default();
        execute(&change_set, &provider, &store, &options(), &CancelToken::new(), &mut recorder).unwrap();

        assert_eq!(
            recorder.events,
            vec![
                "start 1",
                "create network",
                "network creating",
                "network succeeded",
                "done network",
                "end 1",
            ]
        );
    }
}
