//! Diff engine: desired graph vs recorded state
//!
//! Pure computation. The result is a [`ChangeSet`] the executor can run
//! without consulting the graph again.

use crate::error::Result;
use crate::graph::{Resource, ResourceGraph};
use crate::planner::{ChangeEntry, ChangeSet, Desired};
use crate::schema::KindCatalog;
use crate::state::{StateFile, StateRecord};
use crate::types::{Operation, ResourceStatus};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Stable hash of a resource configuration
///
/// Maps are ordered, so the JSON encoding is canonical.
pub fn config_hash(kind: &str, config: &BTreeMap<String, Value>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_bytes());
    hasher.update(&[0]);
    hasher.update(&serde_json::to_vec(config).unwrap_or_default());
    hasher.finalize().to_hex().to_string()
}

/// Property names whose values differ, sorted
pub fn changed_properties(
    previous: &BTreeMap<String, Value>,
    desired: &BTreeMap<String, Value>,
) -> Vec<String> {
    previous
        .keys()
        .chain(desired.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|k| previous.get(*k) != desired.get(*k))
        .cloned()
        .collect()
}

/// Compute the change-set that converges `state` to `graph`
pub fn compute_change_set(
    graph: &ResourceGraph,
    state: &StateFile,
    catalog: &KindCatalog,
) -> Result<ChangeSet> {
    let removed: BTreeMap<&str, &StateRecord> = state
        .resources
        .iter()
        .filter(|(id, _)| !graph.contains(id))
        .map(|(id, r)| (id.as_str(), r))
        .collect();

    let mut change_set = ChangeSet::new(graph.stack.name.clone());
    let mut replaced: HashSet<&str> = HashSet::new();

    for resource in graph.resources() {
        let record = state.resources.get(&resource.id);
        let mut entry = plan_resource(resource, record, catalog);

        // A replaced resource gets new attributes, and the old object of
        // whatever refers to it cannot outlive the old referenced object.
        if entry.operation != Operation::Create && entry.operation != Operation::Replace {
            let stale: Vec<String> = resource
                .config
                .iter()
                .filter(|(_, v)| {
                    v.references()
                        .iter()
                        .filter_map(|r| r.resource())
                        .any(|r| replaced.contains(r))
                })
                .map(|(name, _)| name.clone())
                .collect();
            if !stale.is_empty() {
                let mut changed: BTreeSet<String> = entry.changed_properties.drain(..).collect();
                changed.extend(stale.iter().cloned());
                entry.changed_properties = changed.into_iter().collect();
                entry.operation = Operation::Replace;
                entry.reason = format!("references replaced resource via {}", stale.join(", "));
            }
        }

        if entry.operation == Operation::Replace {
            replaced.insert(resource.id.as_str());
            entry.teardown_after = former_dependents(&resource.id, &removed);
        }
        change_set.entries.push(entry);
    }

    let declared_ops: HashMap<String, Operation> = change_set
        .entries
        .iter()
        .map(|e| (e.id.clone(), e.operation))
        .collect();

    // Old objects of replaced dependents go before the old object they use
    for entry in &mut change_set.entries {
        if entry.operation == Operation::Replace {
            entry
                .teardown_after
                .extend(recorded_dependents(state, &entry.id, &declared_ops, |op| {
                    op == Operation::Replace
                }));
        }
    }

    let mut deletes = delete_entries(state, &removed, |id| {
        // Still-declared resources that recorded a dependency on `id` must
        // stop using it first.
        recorded_dependents(state, id, &declared_ops, |op| op.is_change())
    })?;
    for entry in &mut deletes {
        let (teardown, rest): (Vec<String>, Vec<String>) = entry
            .prerequisites
            .drain(..)
            .partition(|p| declared_ops.get(p.as_str()) == Some(&Operation::Replace));
        entry.prerequisites = rest;
        entry.teardown_after = teardown;
    }
    change_set.entries.extend(deletes);
    change_set.outputs = graph.outputs().to_vec();

    log::debug!(
        "Change-set for '{}': {} entries, {} changing",
        change_set.stack,
        change_set.entries.len(),
        change_set.changes().count()
    );
    Ok(change_set)
}

/// Delete-only change-set for every tracked record
pub fn plan_destroy(state: &StateFile) -> Result<ChangeSet> {
    let all: BTreeMap<&str, &StateRecord> = state
        .resources
        .iter()
        .map(|(id, r)| (id.as_str(), r))
        .collect();
    let mut change_set = ChangeSet::new(state.stack.clone());
    change_set.entries = delete_entries(state, &all, |_| Vec::new())?;
    Ok(change_set)
}

fn plan_resource(
    resource: &Resource,
    record: Option<&StateRecord>,
    catalog: &KindCatalog,
) -> ChangeEntry {
    let desired_hash = resource.config_hash();
    let previous = record.map(|r| r.applied_config.clone());
    let changed = record
        .map(|r| changed_properties(&r.applied_config, &resource.config))
        .unwrap_or_default();

    let (operation, reason) = match record {
        None => (Operation::Create, "not yet created".to_string()),
        Some(r) if r.remote_id.is_none() => (
            Operation::Create,
            "previous create was never accepted".to_string(),
        ),
        Some(r) if r.kind != resource.kind => (
            Operation::Replace,
            format!("kind changed from {} to {}", r.kind, resource.kind),
        ),
        Some(r) => match (r.status, r.last_operation) {
            (ResourceStatus::Succeeded, _) if r.config_hash == desired_hash => {
                (Operation::NoOp, "up to date".to_string())
            }
            (ResourceStatus::Failed, None | Some(Operation::Create | Operation::Replace)) => (
                Operation::Replace,
                "previous create failed; object is tainted".to_string(),
            ),
            (ResourceStatus::Deleting, _) => (
                Operation::Replace,
                "previous delete was interrupted".to_string(),
            ),
            (status, _) if r.config_hash == desired_hash => (
                Operation::Update,
                format!("re-applying after {status} was interrupted or failed"),
            ),
            _ => {
                let op = by_mutability(catalog, &resource.kind, &changed);
                let reason = if op == Operation::Replace {
                    let immutable: Vec<&str> = changed
                        .iter()
                        .map(String::as_str)
                        .filter(|p| !catalog.all_mutable(&resource.kind, [*p]))
                        .collect();
                    format!("immutable properties changed: {}", immutable.join(", "))
                } else {
                    format!("properties changed: {}", changed.join(", "))
                };
                (op, reason)
            }
        },
    };

    let desired = Some(Desired {
        config: resource.config.clone(),
        config_hash: desired_hash,
        dependencies: resource.dependencies.clone(),
    });

    ChangeEntry {
        id: resource.id.clone(),
        kind: resource.kind.clone(),
        operation,
        prerequisites: resource.dependencies.clone(),
        teardown_after: Vec::new(),
        changed_properties: if operation == Operation::NoOp {
            Vec::new()
        } else {
            changed
        },
        reason,
        desired,
        previous,
    }
}

fn by_mutability(catalog: &KindCatalog, kind: &str, changed: &[String]) -> Operation {
    if catalog.all_mutable(kind, changed.iter().map(String::as_str)) {
        Operation::Update
    } else {
        Operation::Replace
    }
}

/// Removed records that recorded a dependency on `id`
fn former_dependents(id: &str, removed: &BTreeMap<&str, &StateRecord>) -> Vec<String> {
    removed
        .iter()
        .filter(|(_, r)| r.dependencies.iter().any(|d| d == id))
        .map(|(other, _)| (*other).to_string())
        .collect()
}

/// Declared resources whose recorded state depends on `id` and whose
/// planned operation passes `filter`
fn recorded_dependents<F>(
    state: &StateFile,
    id: &str,
    declared_ops: &HashMap<String, Operation>,
    filter: F,
) -> Vec<String>
where
    F: Fn(Operation) -> bool,
{
    state
        .resources
        .iter()
        .filter(|(other, record)| {
            declared_ops.get(other.as_str()).is_some_and(|op| filter(*op))
                && record.dependencies.iter().any(|d| d == id)
        })
        .map(|(other, _)| other.clone())
        .collect()
}

/// Delete entries for `records`, dependents first
fn delete_entries<F>(
    state: &StateFile,
    records: &BTreeMap<&str, &StateRecord>,
    mut extra_prerequisites: F,
) -> Result<Vec<ChangeEntry>>
where
    F: FnMut(&str) -> Vec<String>,
{
    // Kahn over recorded dependencies restricted to `records`, then reversed
    let mut in_degree: BTreeMap<&str, usize> = records.keys().map(|id| (*id, 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (&id, record) in records {
        for dep in &record.dependencies {
            if let Some((&dep, _)) = records.get_key_value(dep.as_str()) {
                *in_degree.entry(id).or_default() += 1;
                dependents.entry(dep).or_default().push(id);
            }
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order: Vec<&str> = Vec::with_capacity(records.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }
    if order.len() < records.len() {
        let stuck: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        return Err(state.corruption(format!(
            "recorded dependencies form a cycle among: {}",
            stuck.join(", ")
        )));
    }
    order.reverse();

    Ok(order
        .into_iter()
        .filter_map(|id| records.get(id).map(|record| (id, record)))
        .map(|(id, record)| {
            let mut prerequisites = former_dependents(id, records);
            prerequisites.extend(extra_prerequisites(id));
            ChangeEntry {
                id: id.to_string(),
                kind: record.kind.clone(),
                operation: Operation::Delete,
                prerequisites,
                teardown_after: Vec::new(),
                changed_properties: Vec::new(),
                reason: "no longer declared".to_string(),
                desired: None,
                previous: Some(record.applied_config.clone()),
            }
        })
        .collect())
}

/// Counts by operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub additions: usize,
    pub updates: usize,
    pub replacements: usize,
    pub removals: usize,
    pub unchanged: usize,
}

impl DiffSummary {
    pub fn from_change_set(change_set: &ChangeSet) -> Self {
        let mut summary = Self::default();
        for entry in &change_set.entries {
            match entry.operation {
                Operation::Create => summary.additions += 1,
                Operation::Update => summary.updates += 1,
                Operation::Replace => summary.replacements += 1,
                Operation::Delete => summary.removals += 1,
                Operation::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.additions + self.updates + self.replacements + self.removals
    }

    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::graph::{ResourceDecl, StackDecl};
    use crate::schema::KindSchema;
    use crate::value::Reference;

    fn catalog() -> KindCatalog {
        KindCatalog::new()
            .with(KindSchema::new("network").mutable(["tags"]))
            .with(KindSchema::new("subnet").mutable(["tags"]))
            .with(KindSchema::new("compute_instance").mutable(["tags", "instance_type"]))
    }

    fn decl(cidr: &str, with_instance: bool) -> StackDecl {
        let mut decl = StackDecl::new("web", "us-east-1")
            .resource(ResourceDecl::new("network", "network").property("cidr_block", cidr))
            .resource(
                ResourceDecl::new("subnet", "subnet")
                    .property("network_id", Reference::output("network", "id"))
                    .property("cidr_block", "10.0.1.0/24"),
            );
        if with_instance {
            decl = decl.resource(
                ResourceDecl::new("instance", "compute_instance")
                    .property("subnet_id", Reference::output("subnet", "id"))
                    .property("instance_type", "t3.micro"),
            );
        }
        decl
    }

    fn graph(decl: StackDecl) -> ResourceGraph {
        ResourceGraph::build(decl, &catalog()).unwrap()
    }

    /// State as if every resource of `graph` had been applied
    fn applied(graph: &ResourceGraph) -> StateFile {
        let mut state = StateFile::new("web");
        for r in graph.resources() {
            let mut record = StateRecord::new(&r.kind, ResourceStatus::Succeeded);
            record.remote_id = Some(format!("{}-remote", r.id));
            record.config_hash = r.config_hash();
            record.applied_config = r.config.clone();
            record.dependencies = r.dependencies.clone();
            record.last_operation = Some(Operation::Create);
            state.resources.insert(r.id.clone(), record);
        }
        state
    }

    fn ops(change_set: &ChangeSet) -> Vec<(&str, Operation)> {
        change_set
            .entries
            .iter()
            .map(|e| (e.id.as_str(), e.operation))
            .collect()
    }

    #[test]
    fn hash_is_stable_and_kind_sensitive() {
        let g = graph(decl("10.0.0.0/16", false));
        let network = g.get("network").unwrap();
        assert_eq!(network.config_hash(), network.config_hash());
        assert_ne!(
            config_hash("network", &network.config),
            config_hash("subnet", &network.config)
        );
    }

    #[test]
    fn empty_state_creates_everything_in_order() {
        let g = graph(decl("10.0.0.0/16", true));
        let set = compute_change_set(&g, &StateFile::new("web"), &catalog()).unwrap();
        assert_eq!(
            ops(&set),
            vec![
                ("network", Operation::Create),
                ("subnet", Operation::Create),
                ("instance", Operation::Create),
            ]
        );
        assert_eq!(set.get("instance").unwrap().prerequisites, vec!["subnet"]);
        assert!(set.get("network").unwrap().desired.is_some());
    }

    #[test]
    fn unchanged_graph_is_all_no_ops() {
        let g = graph(decl("10.0.0.0/16", true));
        let set = compute_change_set(&g, &applied(&g), &catalog()).unwrap();
        assert!(set.is_empty());
        assert!(set.entries.iter().all(|e| e.operation == Operation::NoOp));
        assert!(!DiffSummary::from_change_set(&set).has_changes());
    }

    #[test]
    fn mutable_change_updates_in_place() {
        let g = graph(decl("10.0.0.0/16", true));
        let state = applied(&g);
        let mut changed = decl("10.0.0.0/16", false);
        changed = changed.resource(
            ResourceDecl::new("instance", "compute_instance")
                .property("subnet_id", Reference::output("subnet", "id"))
                .property("instance_type", "t3.large"),
        );
        let set = compute_change_set(&graph(changed), &state, &catalog()).unwrap();

        let entry = set.get("instance").unwrap();
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(entry.changed_properties, vec!["instance_type"]);
        assert_eq!(DiffSummary::from_change_set(&set).updates, 1);
    }

    #[test]
    fn immutable_change_replaces_and_propagates() {
        let g = graph(decl("10.0.0.0/16", true));
        let state = applied(&g);
        let set = compute_change_set(&graph(decl("10.1.0.0/16", true)), &state, &catalog()).unwrap();

        assert_eq!(set.get("network").unwrap().operation, Operation::Replace);
        assert!(set.get("network").unwrap().reason.contains("cidr_block"));
        // network_id and subnet_id are immutable, so the replacement cascades
        let subnet = set.get("subnet").unwrap();
        assert_eq!(subnet.operation, Operation::Replace);
        assert_eq!(subnet.changed_properties, vec!["network_id"]);
        assert_eq!(set.get("instance").unwrap().operation, Operation::Replace);

        // Old objects go leaf first; new ones are built root first
        let network = set.get("network").unwrap();
        assert!(network.prerequisites.is_empty());
        assert_eq!(network.teardown_after, vec!["subnet"]);
        assert_eq!(subnet.prerequisites, vec!["network"]);
        assert_eq!(subnet.teardown_after, vec!["instance"]);
        assert!(set.get("instance").unwrap().teardown_after.is_empty());
    }

    #[test]
    fn mutable_reference_to_replaced_resource_still_replaces() {
        let catalog = KindCatalog::new()
            .with(KindSchema::new("network"))
            .with(KindSchema::new("route").mutable(["network_id"]));
        let decl = |cidr: &str| {
            StackDecl::new("web", "us-east-1")
                .resource(ResourceDecl::new("network", "network").property("cidr_block", cidr))
                .resource(
                    ResourceDecl::new("route", "route")
                        .property("network_id", Reference::output("network", "id")),
                )
        };
        let g = ResourceGraph::build(decl("10.0.0.0/16"), &catalog).unwrap();
        let state = applied(&g);
        let g = ResourceGraph::build(decl("10.1.0.0/16"), &catalog).unwrap();
        let set = compute_change_set(&g, &state, &catalog).unwrap();

        let route = set.get("route").unwrap();
        assert_eq!(route.operation, Operation::Replace);
        assert!(route.reason.contains("network_id"));
        assert_eq!(set.get("network").unwrap().teardown_after, vec!["route"]);
    }

    #[test]
    fn replace_tears_down_after_removed_dependents() {
        let g = graph(decl("10.0.0.0/16", false));
        let state = applied(&g);
        let only_network = StackDecl::new("web", "us-east-1")
            .resource(ResourceDecl::new("network", "network").property("cidr_block", "10.1.0.0/16"));
        let set = compute_change_set(&graph(only_network), &state, &catalog()).unwrap();

        assert_eq!(
            ops(&set),
            vec![("network", Operation::Replace), ("subnet", Operation::Delete)]
        );
        let network = set.get("network").unwrap();
        assert!(network.prerequisites.is_empty());
        assert_eq!(network.teardown_after, vec!["subnet"]);
        assert!(set.get("subnet").unwrap().prerequisites.is_empty());
    }

    #[test]
    fn removed_parent_of_replaced_resource_waits_for_its_teardown() {
        let g = graph(decl("10.0.0.0/16", false));
        let state = applied(&g);
        // subnet moves off the network, which is no longer declared
        let moved = StackDecl::new("web", "us-east-1").resource(
            ResourceDecl::new("subnet", "subnet")
                .property("network_id", "net-external")
                .property("cidr_block", "10.0.1.0/24"),
        );
        let set = compute_change_set(&graph(moved), &state, &catalog()).unwrap();

        assert_eq!(set.get("subnet").unwrap().operation, Operation::Replace);
        let network = set.get("network").unwrap();
        assert_eq!(network.operation, Operation::Delete);
        assert!(network.prerequisites.is_empty());
        assert_eq!(network.teardown_after, vec!["subnet"]);
    }

    #[test]
    fn only_immutable_change_gives_replace() {
        let g = graph(decl("10.0.0.0/16", false));
        let state = applied(&g);
        let set = compute_change_set(&graph(decl("10.9.0.0/16", false)), &state, &catalog()).unwrap();
        assert_eq!(set.get("network").unwrap().operation, Operation::Replace);
        assert_eq!(
            set.get("network").unwrap().changed_properties,
            vec!["cidr_block"]
        );
    }

    #[test]
    fn removed_resource_is_deleted() {
        let g = graph(decl("10.0.0.0/16", true));
        let state = applied(&g);
        let set = compute_change_set(&graph(decl("10.0.0.0/16", false)), &state, &catalog()).unwrap();
        let changes: Vec<(&str, Operation)> = set
            .changes()
            .map(|e| (e.id.as_str(), e.operation))
            .collect();
        assert_eq!(changes, vec![("instance", Operation::Delete)]);
    }

    #[test]
    fn deletes_run_dependents_first() {
        let g = graph(decl("10.0.0.0/16", true));
        let state = applied(&g);
        let only_network =
            StackDecl::new("web", "us-east-1").resource(ResourceDecl::new("network", "network").property("cidr_block", "10.0.0.0/16"));
        let set = compute_change_set(&graph(only_network), &state, &catalog()).unwrap();

        let deletes: Vec<&ChangeEntry> = set.changes().collect();
        assert_eq!(deletes[0].id, "instance");
        assert!(deletes[0].prerequisites.is_empty());
        assert_eq!(deletes[1].id, "subnet");
        assert_eq!(deletes[1].prerequisites, vec!["instance"]);
    }

    #[test]
    fn failed_create_is_replaced_and_unaccepted_create_is_retried() {
        let g = graph(decl("10.0.0.0/16", false));
        let mut state = applied(&g);
        let network = state.resources.get_mut("network").unwrap();
        network.status = ResourceStatus::Failed;
        let subnet = state.resources.get_mut("subnet").unwrap();
        subnet.status = ResourceStatus::Failed;
        subnet.remote_id = None;

        let set = compute_change_set(&g, &state, &catalog()).unwrap();
        assert_eq!(set.get("network").unwrap().operation, Operation::Replace);
        assert_eq!(set.get("subnet").unwrap().operation, Operation::Create);
    }

    #[test]
    fn interrupted_operations_resume() {
        let g = graph(decl("10.0.0.0/16", false));
        let mut state = applied(&g);
        state.resources.get_mut("network").unwrap().status = ResourceStatus::Creating;
        state.resources.get_mut("subnet").unwrap().status = ResourceStatus::Deleting;

        let set = compute_change_set(&g, &state, &catalog()).unwrap();
        assert_eq!(set.get("network").unwrap().operation, Operation::Update);
        assert_eq!(set.get("subnet").unwrap().operation, Operation::Replace);
    }

    #[test]
    fn destroy_deletes_everything_in_reverse_order() {
        let g = graph(decl("10.0.0.0/16", true));
        let set = plan_destroy(&applied(&g)).unwrap();
        assert_eq!(
            ops(&set),
            vec![
                ("instance", Operation::Delete),
                ("subnet", Operation::Delete),
                ("network", Operation::Delete),
            ]
        );
        assert_eq!(set.get("network").unwrap().prerequisites, vec!["subnet"]);
    }

    #[test]
    fn cyclic_recorded_dependencies_are_corruption() {
        let g = graph(decl("10.0.0.0/16", false));
        let mut state = applied(&g);
        state
            .resources
            .get_mut("network")
            .unwrap()
            .dependencies
            .push("subnet".into());
        assert!(matches!(
            plan_destroy(&state),
            Err(Error::StateCorruption { .. })
        ));
    }
}
