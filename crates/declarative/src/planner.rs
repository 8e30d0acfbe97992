//! Change-sets: the ordered work a run performs

use crate::error::{Error, Result};
use crate::graph::OutputBinding;
use crate::types::Operation;
use crate::value::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Desired configuration carried by create, update and replace entries
#[derive(Debug, Clone, PartialEq)]
pub struct Desired {
    pub config: BTreeMap<String, Value>,
    pub config_hash: String,
    pub dependencies: Vec<String>,
}

/// One unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub id: String,
    pub kind: String,
    pub operation: Operation,
    /// Entries that must reach terminal success first
    pub prerequisites: Vec<String>,
    /// Replaces and deletes whose old objects must be gone before this
    /// entry's old object is deleted
    pub teardown_after: Vec<String>,
    /// Properties whose value differs from the last applied configuration
    pub changed_properties: Vec<String>,
    pub reason: String,
    /// `None` for deletes
    pub desired: Option<Desired>,
    /// Last applied configuration, when one is recorded
    pub previous: Option<BTreeMap<String, Value>>,
}

impl ChangeEntry {
    pub fn is_change(&self) -> bool {
        self.operation.is_change()
    }
}

/// Ordered entries for one stack
///
/// Creates, updates, replaces and no-ops come first in topological order,
/// followed by deletes in reverse dependency order. A replace runs in two
/// halves: its old object is deleted after the old objects listed in
/// `teardown_after`, and the new one is created after its prerequisites.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub stack: String,
    pub entries: Vec<ChangeEntry>,
    pub outputs: Vec<OutputBinding>,
}

impl ChangeSet {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            ..Self::default()
        }
    }

    /// Entries that change something
    pub fn changes(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter().filter(|e| e.is_change())
    }

    /// No entry changes anything
    pub fn is_empty(&self) -> bool {
        self.changes().next().is_none()
    }

    pub fn get(&self, id: &str) -> Option<&ChangeEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.entries
            .iter()
            .filter(|e| e.operation == operation)
            .count()
    }

    /// Group changing entries into levels that can run concurrently
    ///
    /// Each level only depends on earlier levels. No-op prerequisites are
    /// satisfied up front.
    pub fn batches(&self) -> Vec<Vec<&ChangeEntry>> {
        let changing: HashMap<&str, &ChangeEntry> =
            self.changes().map(|e| (e.id.as_str(), e)).collect();
        let mut level: HashMap<&str, usize> = HashMap::new();
        let mut batches: Vec<Vec<&ChangeEntry>> = Vec::new();

        // Entries appear after their prerequisites except across the
        // create/delete boundary, so iterate until every level is known.
        let mut pending: Vec<&ChangeEntry> = self.changes().collect();
        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|&entry| {
                let mut depth = 0;
                // A replace's teardown blockers depend on the replace itself
                let teardown: &[String] = if entry.operation == Operation::Delete {
                    &entry.teardown_after
                } else {
                    &[]
                };
                for prereq in entry.prerequisites.iter().chain(teardown) {
                    if !changing.contains_key(prereq.as_str()) {
                        continue;
                    }
                    match level.get(prereq.as_str()) {
                        Some(&l) => depth = depth.max(l + 1),
                        None => return true,
                    }
                }
                level.insert(entry.id.as_str(), depth);
                if batches.len() <= depth {
                    batches.resize_with(depth + 1, Vec::new);
                }
                batches[depth].push(entry);
                false
            });
            if pending.len() == before {
                // Unsatisfiable prerequisites; report them as a final level
                batches.push(pending);
                break;
            }
        }
        batches
    }

    /// Keep the targeted entries and everything they transitively need
    ///
    /// A target matches an entry id or every entry of a kind.
    pub fn filter_targets(self, targets: &[String]) -> Result<Self> {
        if targets.is_empty() {
            return Ok(self);
        }

        let mut keep: HashSet<String> = HashSet::new();
        let mut queue: Vec<String> = Vec::new();
        for target in targets {
            let matched: Vec<&ChangeEntry> = self
                .entries
                .iter()
                .filter(|e| &e.id == target || &e.kind == target)
                .collect();
            if matched.is_empty() {
                return Err(Error::UnknownTarget(target.clone()));
            }
            queue.extend(matched.into_iter().map(|e| e.id.clone()));
        }

        while let Some(id) = queue.pop() {
            if !keep.insert(id.clone()) {
                continue;
            }
            if let Some(entry) = self.get(&id) {
                queue.extend(entry.prerequisites.iter().cloned());
                queue.extend(entry.teardown_after.iter().cloned());
            }
        }

        let Self {
            stack,
            entries,
            outputs,
        } = self;
        let entries: Vec<ChangeEntry> = entries.into_iter().filter(|e| keep.contains(&e.id)).collect();
        let kept: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        let outputs = outputs
            .into_iter()
            .filter(|o| {
                o.value
                    .references()
                    .iter()
                    .filter_map(|r| r.resource())
                    .all(|r| kept.contains(r))
            })
            .collect();

        Ok(Self {
            stack,
            entries,
            outputs,
        })
    }
}
