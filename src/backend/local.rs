//! Local sandbox provisioning backend
//!
//! Behaves like an asynchronous provisioning API: accepted requests leave
//! the object in progress, and it settles after a fixed number of
//! `describe` polls. Objects are kept in a JSON file next to the stack
//! state so separate invocations see the same world.

use crate::kinds;
use chrono::{DateTime, Utc};
use declarative::{
    ID_ATTRIBUTE, Observation, Provider, ProviderError, ProviderResult, RemoteStatus,
    ResolvedSpec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

// ============================================================================
// Object Store
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
enum Phase {
    Provisioning { polls_left: u32 },
    Ready,
    Deleting { polls_left: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SandboxObject {
    kind: String,
    logical_id: String,
    properties: BTreeMap<String, Json>,
    attributes: BTreeMap<String, Json>,
    #[serde(flatten)]
    phase: Phase,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct World {
    serial: u64,
    objects: BTreeMap<String, SandboxObject>,
}

/// File-backed sandbox provider
pub struct SandboxProvider {
    path: Option<PathBuf>,
    ready_after: u32,
    world: Mutex<World>,
}

impl SandboxProvider {
    /// Open (or start) the sandbox stored at `path`
    pub fn open(path: &Path, ready_after: u32) -> anyhow::Result<Self> {
        let world = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            World::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            ready_after,
            world: Mutex::new(world),
        })
    }

    /// A sandbox that lives only as long as the value
    pub fn in_memory(ready_after: u32) -> Self {
        Self {
            path: None,
            ready_after,
            world: Mutex::new(World::default()),
        }
    }

    /// Number of live objects, including ones still being deleted
    #[cfg(test)]
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Properties of the object created for `logical_id`
    #[cfg(test)]
    pub fn properties_of(&self, logical_id: &str) -> Option<BTreeMap<String, Json>> {
        self.lock()
            .objects
            .values()
            .find(|o| o.logical_id == logical_id)
            .map(|o| o.properties.clone())
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, world: &World) -> ProviderResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(world)?;
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, content)?;
            fs::rename(&tmp, path)
        };
        write().map_err(|e| ProviderError::Other(format!("sandbox store: {e}")))
    }

    fn settle_phase(&self) -> Phase {
        if self.ready_after == 0 {
            Phase::Ready
        } else {
            Phase::Provisioning {
                polls_left: self.ready_after,
            }
        }
    }
}

// ============================================================================
// Validation and attributes
// ============================================================================

fn check_spec(spec: &ResolvedSpec) -> ProviderResult<()> {
    let Some(kind) = kinds::spec(&spec.kind) else {
        return Err(ProviderError::Invalid {
            errors: vec![format!("unsupported kind '{}'", spec.kind)],
        });
    };

    let mut errors: Vec<String> = kind
        .required
        .iter()
        .filter(|p| spec.properties.get(**p).is_none_or(Json::is_null))
        .map(|p| format!("{} requires property '{p}'", kind.name))
        .collect();

    if let Some(cidr) = spec.properties.get("cidr_block")
        && !cidr.as_str().is_some_and(is_cidr)
    {
        errors.push(format!("'{cidr}' is not a CIDR block"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProviderError::Invalid { errors })
    }
}

fn is_cidr(s: &str) -> bool {
    let Some((addr, prefix)) = s.split_once('/') else {
        return false;
    };
    let octets: Vec<&str> = addr.split('.').collect();
    octets.len() == 4
        && octets.iter().all(|o| o.parse::<u8>().is_ok())
        && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
}

/// Deterministic attributes derived from the remote id and properties
fn synthesize_attributes(remote_id: &str, spec: &ResolvedSpec) -> BTreeMap<String, Json> {
    let digest = blake3::hash(remote_id.as_bytes());
    let bytes = digest.as_bytes();
    let mut attrs = BTreeMap::new();
    attrs.insert(ID_ATTRIBUTE.to_string(), Json::from(remote_id));

    let prop = |name: &str| spec.properties.get(name).cloned();
    match spec.kind.as_str() {
        "network" => {
            attrs.extend(prop("cidr_block").map(|v| ("cidr_block".to_string(), v)));
        }
        "subnet" => {
            attrs.extend(prop("cidr_block").map(|v| ("cidr_block".to_string(), v)));
            let zone = prop("availability_zone").unwrap_or_else(|| Json::from("zone-a"));
            attrs.insert("availability_zone".to_string(), zone);
        }
        "nat_gateway" => {
            attrs.insert("public_ip".to_string(), Json::from(public_ip(bytes)));
        }
        "compute_instance" => {
            attrs.insert(
                "private_ip".to_string(),
                Json::from(format!("10.{}.{}.{}", bytes[0], bytes[1], bytes[2].max(4))),
            );
            if prop("associate_public_ip").and_then(|v| v.as_bool()) == Some(true) {
                attrs.insert("public_ip".to_string(), Json::from(public_ip(bytes)));
                attrs.insert(
                    "public_dns".to_string(),
                    Json::from(format!("{remote_id}.compute.sandbox.internal")),
                );
            }
        }
        "storage_bucket" => {
            let name = prop("bucket_name")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| remote_id.to_string());
            let domain = format!("{name}.storage.sandbox.internal");
            attrs.insert("url".to_string(), Json::from(format!("https://{domain}")));
            attrs.insert("domain_name".to_string(), Json::from(domain));
        }
        _ => {}
    }
    attrs
}

fn public_ip(bytes: &[u8; 32]) -> String {
    format!("203.0.113.{}", bytes[3].max(1))
}

// ============================================================================
// Provider
// ============================================================================

impl Provider for SandboxProvider {
    fn name(&self) -> &str {
        "sandbox"
    }

    fn validate(&self, spec: &ResolvedSpec) -> ProviderResult<()> {
        check_spec(spec)
    }

    fn create(&self, spec: &ResolvedSpec) -> ProviderResult<String> {
        check_spec(spec).map_err(|e| ProviderError::rejected(e.to_string()))?;
        let prefix = kinds::spec(&spec.kind).map_or("res", |k| k.id_prefix);

        let mut world = self.lock();
        world.serial += 1;
        let seed = format!("{}/{}/{}", spec.kind, spec.logical_id, world.serial);
        let hex = blake3::hash(seed.as_bytes()).to_hex();
        let remote_id = format!("{prefix}-{}", &hex.as_str()[..12]);

        let now = Utc::now();
        world.objects.insert(
            remote_id.clone(),
            SandboxObject {
                kind: spec.kind.clone(),
                logical_id: spec.logical_id.clone(),
                properties: spec.properties.clone(),
                attributes: synthesize_attributes(&remote_id, spec),
                phase: self.settle_phase(),
                created_at: now,
                updated_at: now,
            },
        );
        self.persist(&world)?;
        log::debug!("sandbox: created {remote_id} for {}", spec.logical_id);
        Ok(remote_id)
    }

    fn describe(&self, kind: &str, remote_id: &str) -> ProviderResult<Observation> {
        let mut world = self.lock();
        let Some(object) = world.objects.get_mut(remote_id) else {
            return Ok(Observation::gone());
        };
        if object.kind != kind {
            return Err(ProviderError::rejected(format!(
                "{remote_id} is a {}, not a {kind}",
                object.kind
            )));
        }

        let observation = match object.phase {
            Phase::Ready => Observation {
                status: RemoteStatus::Ready,
                attributes: object.attributes.clone(),
            },
            Phase::Provisioning { polls_left } => {
                object.phase = if polls_left <= 1 {
                    Phase::Ready
                } else {
                    Phase::Provisioning {
                        polls_left: polls_left - 1,
                    }
                };
                Observation::new(RemoteStatus::InProgress)
            }
            Phase::Deleting { polls_left } if polls_left <= 1 => {
                world.objects.remove(remote_id);
                self.persist(&world)?;
                return Ok(Observation::gone());
            }
            Phase::Deleting { polls_left } => {
                object.phase = Phase::Deleting {
                    polls_left: polls_left - 1,
                };
                Observation::new(RemoteStatus::InProgress)
            }
        };
        self.persist(&world)?;
        Ok(observation)
    }

    fn update(&self, remote_id: &str, spec: &ResolvedSpec) -> ProviderResult<()> {
        check_spec(spec).map_err(|e| ProviderError::rejected(e.to_string()))?;
        let phase = self.settle_phase();
        let mut world = self.lock();
        let object = world
            .objects
            .get_mut(remote_id)
            .ok_or_else(|| ProviderError::NotFound {
                remote_id: remote_id.to_string(),
            })?;
        if matches!(object.phase, Phase::Deleting { .. }) {
            return Err(ProviderError::rejected(format!("{remote_id} is being deleted")));
        }
        object.properties = spec.properties.clone();
        object.attributes = synthesize_attributes(remote_id, spec);
        object.phase = phase;
        object.updated_at = Utc::now();
        self.persist(&world)?;
        log::debug!("sandbox: updated {remote_id}");
        Ok(())
    }

    fn delete(&self, kind: &str, remote_id: &str) -> ProviderResult<()> {
        let mut world = self.lock();
        let Some(object) = world.objects.get_mut(remote_id) else {
            return Err(ProviderError::NotFound {
                remote_id: remote_id.to_string(),
            });
        };
        if object.kind != kind {
            return Err(ProviderError::rejected(format!(
                "{remote_id} is a {}, not a {kind}",
                object.kind
            )));
        }
        if self.ready_after == 0 {
            world.objects.remove(remote_id);
        } else {
            object.phase = Phase::Deleting {
                polls_left: self.ready_after,
            };
            object.updated_at = Utc::now();
        }
        self.persist(&world)?;
        log::debug!("sandbox: deleting {remote_id}");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
