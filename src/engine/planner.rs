//! Loading a stack and planning against its recorded state

use crate::backend;
use crate::config::{Overrides, Settings};
use crate::kinds;
use crate::paths;
use crate::schema::StackFile;
use anyhow::{Context, Result};
use declarative::{
    ChangeSet, KindCatalog, Provider, ResolvedSpec, ResourceGraph, StackDecl, StateStore, Value,
    compute_change_set, plan_destroy,
};
use std::convert::Infallible;
use std::path::{Path, PathBuf};

/// A stack file resolved against its settings
pub struct LoadedStack {
    pub settings: Settings,
    pub decl: StackDecl,
    pub catalog: KindCatalog,
}

/// Read the stack file and resolve its settings
pub fn load(file: &Path, params: &[(String, String)], overrides: &Overrides) -> Result<LoadedStack> {
    let stack_file = StackFile::load(file)?;
    let settings = Settings::resolve(&stack_file.stack, &stack_file.settings, overrides)?;
    let mut decl = stack_file.into_decl(params)?;
    decl.region = settings.region.clone();
    decl.endpoint = settings.endpoint.clone();
    log::debug!(
        "Loaded stack '{}' ({} resources) from {}",
        decl.name,
        decl.resources.len(),
        file.display()
    );
    Ok(LoadedStack {
        settings,
        decl,
        catalog: kinds::catalog(),
    })
}

impl LoadedStack {
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    pub fn state_path(&self) -> PathBuf {
        paths::state_file(&self.settings.state_dir, self.name())
    }

    /// Validate the declaration into a graph
    pub fn graph(&self) -> Result<ResourceGraph> {
        Ok(ResourceGraph::build(self.decl.clone(), &self.catalog)?)
    }

    /// Open the recorded state; corrupt state is fatal
    pub fn open_state(&self) -> Result<StateStore> {
        let path = self.state_path();
        Ok(StateStore::open(&path, self.name())?)
    }

    pub fn connect(&self) -> Result<Box<dyn Provider>> {
        backend::connect(&self.settings, self.name())
    }

    /// Change-set converging the recorded state to the declaration
    pub fn plan(&self, graph: &ResourceGraph, store: &StateStore, targets: &[String]) -> Result<ChangeSet> {
        let change_set = compute_change_set(graph, &store.snapshot(), &self.catalog)?;
        Ok(change_set.filter_targets(targets)?)
    }

    /// Change-set deleting everything recorded
    pub fn plan_destroy(&self, store: &StateStore) -> Result<ChangeSet> {
        plan_destroy(&store.snapshot()).context("Could not plan teardown")
    }
}

/// Ask the provider to check every resource's configuration
///
/// Output references are not known before apply, so they are sent as
/// `<resource.attribute>` placeholders. Returns `(id, message)` pairs.
pub fn preflight(graph: &ResourceGraph, provider: &dyn Provider) -> Vec<(String, String)> {
    let mut problems = Vec::new();
    for resource in graph.resources() {
        let properties = resource
            .config
            .iter()
            .map(|(name, value)| (name.clone(), placeholder_json(value)))
            .collect();
        let spec = ResolvedSpec {
            logical_id: resource.id.clone(),
            kind: resource.kind.clone(),
            properties,
        };
        if let Err(e) = provider.validate(&spec) {
            problems.push((resource.id.clone(), e.to_string()));
        }
    }
    problems
}

fn placeholder_json(value: &Value) -> serde_json::Value {
    let rendered: std::result::Result<_, Infallible> =
        value.to_json(&mut |r| Ok(serde_json::Value::String(format!("<{r}>"))));
    rendered.unwrap_or_else(|never| match never {})
}
