//! State store
//!
//! One JSON document per stack records what the provider was asked to do
//! and what it reported back. Records are keyed by logical id and guarded
//! by a per-id lock; every change is persisted before the caller continues.

use crate::error::{Error, Result};
use crate::types::{Operation, ResourceStatus};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Version written to every state file
pub const STATE_FORMAT_VERSION: u32 = 1;

// ============================================================================
// State Structures
// ============================================================================

/// What is known about one logical resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub kind: String,

    /// Assigned once the provider accepts a create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,

    /// Hash of the last configuration the provider accepted
    #[serde(default)]
    pub config_hash: String,

    #[serde(default)]
    pub applied_config: BTreeMap<String, Value>,

    /// Dependencies at the time of the last apply; drives delete ordering
    #[serde(default)]
    pub dependencies: Vec<String>,

    pub status: ResourceStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<Operation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Exported attributes, always including `id` once succeeded
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,

    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(kind: impl Into<String>, status: ResourceStatus) -> Self {
        Self {
            kind: kind.into(),
            remote_id: None,
            config_hash: String::new(),
            applied_config: BTreeMap::new(),
            dependencies: Vec::new(),
            status,
            last_operation: None,
            last_error: None,
            outputs: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn output(&self, attribute: &str) -> Option<&serde_json::Value> {
        self.outputs.get(attribute)
    }
}

/// Persisted state of one stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    pub stack: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub resources: BTreeMap<String, StateRecord>,
    /// Stack outputs computed by the last run
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    origin: Option<PathBuf>,
}

impl StateFile {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            stack: stack.into(),
            last_updated: Utc::now(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            origin: None,
        }
    }

    pub fn with_record(mut self, id: impl Into<String>, record: StateRecord) -> Self {
        self.resources.insert(id.into(), record);
        self
    }

    /// Where this state came from, for error messages
    pub fn origin(&self) -> PathBuf {
        self.origin
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("<memory:{}>", self.stack)))
    }

    /// Build the corruption error for this state
    pub fn corruption(&self, message: impl Into<String>) -> Error {
        Error::StateCorruption {
            path: self.origin(),
            message: message.into(),
        }
    }

    fn check(&self, stack: &str) -> Result<()> {
        if self.version != STATE_FORMAT_VERSION {
            return Err(self.corruption(format!(
                "unsupported state format version {} (expected {STATE_FORMAT_VERSION})",
                self.version
            )));
        }
        if self.stack != stack {
            return Err(self.corruption(format!(
                "state belongs to stack '{}', not '{stack}'",
                self.stack
            )));
        }
        for (id, record) in &self.resources {
            match record.status {
                ResourceStatus::Pending | ResourceStatus::Deleted | ResourceStatus::Skipped => {
                    return Err(self.corruption(format!(
                        "record '{id}' has status '{}', which is never persisted",
                        record.status
                    )));
                }
                status if record.remote_id.is_none() && status != ResourceStatus::Failed => {
                    return Err(self.corruption(format!(
                        "record '{id}' is {status} without a remote id"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

type Slot = Arc<Mutex<Option<StateRecord>>>;

/// Concurrent access to a stack's state
pub struct StateStore {
    stack: String,
    path: Option<PathBuf>,
    slots: RwLock<HashMap<String, Slot>>,
    outputs: Mutex<BTreeMap<String, serde_json::Value>>,
    write_lock: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StateStore {
    /// Load the state file at `path`, or start empty if it does not exist
    ///
    /// Unreadable or inconsistent files are reported, never repaired.
    pub fn open(path: impl Into<PathBuf>, stack: &str) -> Result<Self> {
        let path = path.into();
        let mut file = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
            let mut file: StateFile =
                serde_json::from_str(&content).map_err(|e| Error::StateCorruption {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            file.origin = Some(path.clone());
            file.check(stack)?;
            log::debug!(
                "Loaded {} record(s) from {}",
                file.resources.len(),
                path.display()
            );
            file
        } else {
            log::debug!("State file {} does not exist, starting empty", path.display());
            StateFile::new(stack)
        };
        file.origin = Some(path.clone());
        Ok(Self::from_file(file, Some(path)))
    }

    /// A store that never touches the filesystem
    pub fn in_memory(stack: &str) -> Self {
        Self::from_file(StateFile::new(stack), None)
    }

    fn from_file(file: StateFile, path: Option<PathBuf>) -> Self {
        let slots = file
            .resources
            .into_iter()
            .map(|(id, record)| (id, Arc::new(Mutex::new(Some(record)))))
            .collect();
        Self {
            stack: file.stack,
            path,
            slots: RwLock::new(slots),
            outputs: Mutex::new(file.outputs),
            write_lock: Mutex::new(()),
        }
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Consistent copy of every record
    pub fn snapshot(&self) -> StateFile {
        let slots: Vec<(String, Slot)> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut file = StateFile::new(self.stack.clone());
        for (id, slot) in slots {
            if let Some(record) = lock(&slot).clone() {
                file.resources.insert(id, record);
            }
        }
        file.outputs = lock(&self.outputs).clone();
        file.origin.clone_from(&self.path);
        file
    }

    pub fn get(&self, id: &str) -> Option<StateRecord> {
        let slot = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()?;
        lock(&slot).clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: &str) -> Slot {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(id.to_string()).or_default())
    }

    /// Read-modify-write one record, then persist
    ///
    /// Setting the slot to `None` removes the record.
    pub fn modify<F, R>(&self, id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Option<StateRecord>) -> R,
    {
        let slot = self.slot(id);
        let result = {
            let mut record = lock(&slot);
            let result = f(&mut record);
            if let Some(record) = record.as_mut() {
                record.updated_at = Utc::now();
            }
            result
        };
        self.persist()?;
        Ok(result)
    }

    /// Replace a record
    pub fn put(&self, id: &str, record: StateRecord) -> Result<()> {
        self.modify(id, |slot| *slot = Some(record))
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.modify(id, |slot| *slot = None)
    }

    pub fn outputs(&self) -> BTreeMap<String, serde_json::Value> {
        lock(&self.outputs).clone()
    }

    pub fn set_outputs(&self, outputs: BTreeMap<String, serde_json::Value>) -> Result<()> {
        *lock(&self.outputs) = outputs;
        self.persist()
    }

    /// Write the current snapshot atomically
    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _writer = lock(&self.write_lock);
        let snapshot = self.snapshot();
        let content = serde_json::to_string_pretty(&snapshot)?;

        let io_err = |source| Error::Io {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|source| Error::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(io_err)?;
        log::trace!("Saved state to {}", path.display());
        Ok(())
    }
}
