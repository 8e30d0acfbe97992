//! Stack file schema
//!
//! Stacks are written in TOML (or JSON, picked by extension):
//!
//! ```toml
//! [stack]
//! name = "web"
//! region = "us-east-1"
//!
//! [parameters.vpc_cidr]
//! default = "10.0.0.0/16"
//!
//! [[resources]]
//! id = "vpc"
//! kind = "network"
//! properties = { cidr_block = "${params.vpc_cidr}" }
//!
//! [outputs.vpc_id]
//! value = "${vpc.id}"
//! ```

use anyhow::{Context, Result, bail};
use declarative::{OutputDecl, ParameterDecl, ResourceDecl, StackDecl, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ============================================================================
// File Schema
// ============================================================================

/// A parsed stack file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackFile {
    pub stack: StackSection,

    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterEntry>,

    #[serde(default)]
    pub resources: Vec<ResourceEntry>,

    #[serde(default)]
    pub outputs: BTreeMap<String, OutputEntry>,

    /// Execution settings, overridable from the environment and CLI
    #[serde(default)]
    pub settings: SettingsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackSection {
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterEntry {
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceEntry {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Name of a boolean parameter, `!` negates
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputEntry {
    pub value: Value,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// `[settings]` table; durations are in seconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsSection {
    pub backend: Option<String>,
    pub state_dir: Option<String>,
    pub concurrency: Option<usize>,
    pub poll_interval: Option<f64>,
    pub max_poll_interval: Option<f64>,
    pub backoff_factor: Option<f64>,
    pub timeout: Option<f64>,
    /// `abort` or `continue`
    pub on_failure: Option<String>,
    /// Polls before a sandbox object settles
    pub sandbox_ready_after: Option<u32>,
}

/// Stack file encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl StackFile {
    /// Read and parse a stack file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read stack file: {}", path.display()))?;
        Self::parse(&content, Format::from_path(path))
            .with_context(|| format!("Invalid stack file: {}", path.display()))
    }

    pub fn parse(content: &str, format: Format) -> Result<Self> {
        let file: Self = match format {
            Format::Toml => toml::from_str(content).context("Invalid TOML format")?,
            Format::Json => serde_json::from_str(content).context("Invalid JSON format")?,
        };
        file.check_name()?;
        Ok(file)
    }

    /// The stack name doubles as the state file name
    fn check_name(&self) -> Result<()> {
        let name = &self.stack.name;
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!("Invalid stack name '{name}': use letters, digits, '-' and '_'");
        }
        Ok(())
    }

    /// Convert into a declaration, applying `KEY=VALUE` parameter overrides
    ///
    /// `${...}` strings become references here, so the graph builder sees
    /// typed edges.
    pub fn into_decl(self, overrides: &[(String, String)]) -> Result<StackDecl> {
        let mut overridden: BTreeMap<&str, Value> = BTreeMap::new();
        for (name, raw) in overrides {
            if !self.parameters.contains_key(name) {
                bail!("Unknown parameter '{name}'");
            }
            overridden.insert(name.as_str(), Value::parse_scalar(raw));
        }

        let parameters = self
            .parameters
            .iter()
            .map(|(name, entry)| {
                let value = overridden
                    .remove(name.as_str())
                    .or_else(|| entry.default.clone());
                (
                    name.clone(),
                    ParameterDecl {
                        value,
                        description: entry.description.clone(),
                    },
                )
            })
            .collect();

        let resources = self
            .resources
            .into_iter()
            .map(|entry| ResourceDecl {
                id: entry.id,
                kind: entry.kind,
                properties: entry
                    .properties
                    .into_iter()
                    .map(|(k, v)| (k, v.expand_references()))
                    .collect(),
                depends_on: entry.depends_on,
                condition: entry.condition,
            })
            .collect();

        let outputs = self
            .outputs
            .into_iter()
            .map(|(name, entry)| {
                (
                    name,
                    OutputDecl {
                        value: entry.value.expand_references(),
                        condition: entry.condition,
                        description: entry.description,
                    },
                )
            })
            .collect();

        Ok(StackDecl {
            name: self.stack.name,
            region: self.stack.region,
            endpoint: self.stack.endpoint,
            parameters,
            resources,
            outputs,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
