//! Resource graph construction and validation
//!
//! Building a graph is pure: it never talks to a provider. Every problem
//! found is collected so the operator sees them all at once.

use crate::diff::config_hash;
use crate::error::{Result, ValidationError, ValidationErrors};
use crate::schema::KindCatalog;
use crate::value::{PARAMS_PREFIX, Reference, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::convert::Infallible;

// ============================================================================
// Declarations
// ============================================================================

/// A stack as declared by the operator, before validation
#[derive(Debug, Clone, Default)]
pub struct StackDecl {
    pub name: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub parameters: BTreeMap<String, ParameterDecl>,
    pub resources: Vec<ResourceDecl>,
    pub outputs: BTreeMap<String, OutputDecl>,
}

impl StackDecl {
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            ..Self::default()
        }
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(
            name.into(),
            ParameterDecl {
                value: Some(value.into()),
                description: None,
            },
        );
        self
    }

    pub fn resource(mut self, resource: ResourceDecl) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(
            name.into(),
            OutputDecl {
                value: value.into(),
                condition: None,
                description: None,
            },
        );
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterDecl {
    /// Effective value (explicit value or default); `None` is an error
    pub value: Option<Value>,
    pub description: Option<String>,
}

/// A declared resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDecl {
    pub id: String,
    pub kind: String,
    pub properties: BTreeMap<String, Value>,
    pub depends_on: Vec<String>,
    /// Boolean parameter name, optionally prefixed with `!`
    pub condition: Option<String>,
}

impl ResourceDecl {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
            condition: None,
        }
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputDecl {
    pub value: Value,
    pub condition: Option<String>,
    pub description: Option<String>,
}

// ============================================================================
// Validated graph
// ============================================================================

/// Stack-level attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackInfo {
    pub name: String,
    pub region: String,
    pub endpoint: Option<String>,
}

/// A validated resource
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: String,
    pub kind: String,
    /// Configuration with parameters substituted; output references kept
    pub config: BTreeMap<String, Value>,
    /// Explicit and reference-implied edges, sorted
    pub dependencies: Vec<String>,
}

impl Resource {
    pub fn config_hash(&self) -> String {
        config_hash(&self.kind, &self.config)
    }
}

/// A named value exported by the stack
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBinding {
    pub name: String,
    pub value: Value,
    pub description: Option<String>,
}

/// A validated, acyclic resource graph in topological order
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    pub stack: StackInfo,
    parameters: BTreeMap<String, Value>,
    resources: Vec<Resource>,
    index: HashMap<String, usize>,
    outputs: Vec<OutputBinding>,
}

impl ResourceGraph {
    /// Validate a declaration into a graph
    pub fn build(decl: StackDecl, catalog: &KindCatalog) -> Result<Self> {
        let mut errors = Vec::new();

        let mut parameters = BTreeMap::new();
        for (name, param) in &decl.parameters {
            match &param.value {
                Some(value) => {
                    parameters.insert(name.clone(), value.clone());
                }
                None => errors.push(ValidationError::MissingParameter { name: name.clone() }),
            }
        }

        let mut seen = HashSet::new();
        for r in &decl.resources {
            if !is_valid_identifier(&r.id) {
                errors.push(ValidationError::InvalidIdentifier { id: r.id.clone() });
            }
            if !seen.insert(r.id.as_str()) {
                errors.push(ValidationError::DuplicateIdentifier { id: r.id.clone() });
            }
        }

        // Conditional resources that evaluate false are not part of the graph
        let mut included: Vec<&ResourceDecl> = Vec::new();
        let mut included_ids = HashSet::new();
        for r in &decl.resources {
            let keep = match &r.condition {
                None => true,
                Some(condition) => match evaluate_condition(condition, &parameters) {
                    Some(keep) => keep,
                    None => {
                        errors.push(ValidationError::InvalidCondition {
                            subject: r.id.clone(),
                            condition: condition.clone(),
                        });
                        false
                    }
                },
            };
            if keep && included_ids.insert(r.id.as_str()) {
                included.push(r);
            }
        }
        let kinds: HashMap<&str, &str> = included
            .iter()
            .map(|r| (r.id.as_str(), r.kind.as_str()))
            .collect();

        let mut resources = Vec::with_capacity(included.len());
        for r in &included {
            if !catalog.contains(&r.kind) {
                errors.push(ValidationError::UnknownKind {
                    resource: r.id.clone(),
                    kind: r.kind.clone(),
                });
            }

            let mut config = BTreeMap::new();
            let mut dependencies = BTreeSet::new();
            for (name, value) in &r.properties {
                let resolved = substitute_parameters(value, &parameters, &r.id, &mut errors);
                for reference in resolved.references() {
                    if let Some(target) =
                        check_output_reference(reference, &kinds, catalog, &r.id, &mut errors)
                    {
                        dependencies.insert(target.to_string());
                    }
                }
                config.insert(name.clone(), resolved);
            }
            for dep in &r.depends_on {
                if kinds.contains_key(dep.as_str()) {
                    dependencies.insert(dep.clone());
                } else {
                    errors.push(ValidationError::UnresolvedReference {
                        resource: r.id.clone(),
                        reference: dep.clone(),
                    });
                }
            }

            resources.push(Resource {
                id: r.id.clone(),
                kind: r.kind.clone(),
                config,
                dependencies: dependencies.into_iter().collect(),
            });
        }

        let mut outputs = Vec::new();
        for (name, output) in &decl.outputs {
            let subject = format!("outputs.{name}");
            if let Some(condition) = &output.condition {
                match evaluate_condition(condition, &parameters) {
                    Some(true) => {}
                    Some(false) => continue,
                    None => {
                        errors.push(ValidationError::InvalidCondition {
                            subject,
                            condition: condition.clone(),
                        });
                        continue;
                    }
                }
            }
            let value = substitute_parameters(&output.value, &parameters, &subject, &mut errors);
            for reference in value.references() {
                check_output_reference(reference, &kinds, catalog, &subject, &mut errors);
            }
            outputs.push(OutputBinding {
                name: name.clone(),
                value,
                description: output.description.clone(),
            });
        }

        let resources = match topological_sort(resources) {
            Ok(sorted) => sorted,
            Err(cycle) => {
                errors.push(ValidationError::CyclicDependency { cycle });
                Vec::new()
            }
        };

        if !errors.is_empty() {
            return Err(ValidationErrors(errors).into());
        }

        let index = resources
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();

        log::debug!(
            "Built graph for stack '{}' with {} resources",
            decl.name,
            resources.len()
        );

        Ok(Self {
            stack: StackInfo {
                name: decl.name,
                region: decl.region,
                endpoint: decl.endpoint,
            },
            parameters,
            resources,
            index,
            outputs,
        })
    }

    /// Resources in dependency order
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Logical ids in topological order
    pub fn order(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.id.as_str()).collect()
    }

    /// Position in the topological order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Resources that directly depend on `id`
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|r| r.dependencies.iter().any(|d| d == id))
            .map(|r| r.id.as_str())
            .collect()
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn outputs(&self) -> &[OutputBinding] {
        &self.outputs
    }
}

fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id != PARAMS_PREFIX
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `Some(include)` for a boolean parameter, `None` when the condition is invalid
fn evaluate_condition(condition: &str, parameters: &BTreeMap<String, Value>) -> Option<bool> {
    let (negate, name) = match condition.trim().strip_prefix('!') {
        Some(name) => (true, name.trim()),
        None => (false, condition.trim()),
    };
    parameters
        .get(name)
        .and_then(Value::as_bool)
        .map(|b| b != negate)
}

fn substitute_parameters(
    value: &Value,
    parameters: &BTreeMap<String, Value>,
    subject: &str,
    errors: &mut Vec<ValidationError>,
) -> Value {
    let substituted = value.replace_references(&mut |r: &Reference| -> std::result::Result<
        Option<Value>,
        Infallible,
    > {
        match r {
            Reference::Parameter { name } => match parameters.get(name) {
                Some(v) => Ok(Some(v.clone())),
                None => {
                    errors.push(ValidationError::UnresolvedReference {
                        resource: subject.to_string(),
                        reference: r.to_string(),
                    });
                    Ok(None)
                }
            },
            Reference::Output { .. } => Ok(None),
        }
    });
    match substituted {
        Ok(v) => v,
        Err(never) => match never {},
    }
}

/// Validate an output reference, returning the target resource when it exists
fn check_output_reference<'a>(
    reference: &'a Reference,
    kinds: &HashMap<&str, &str>,
    catalog: &KindCatalog,
    subject: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<&'a str> {
    let Reference::Output {
        resource,
        attribute,
    } = reference
    else {
        // Parameter references left here were already reported as unresolved
        return None;
    };
    let unresolved = || ValidationError::UnresolvedReference {
        resource: subject.to_string(),
        reference: reference.to_string(),
    };
    match kinds.get(resource.as_str()) {
        None => {
            errors.push(unresolved());
            None
        }
        Some(kind) => {
            if let Some(schema) = catalog.get(kind)
                && !schema.exports(attribute)
            {
                errors.push(unresolved());
            }
            Some(resource.as_str())
        }
    }
}

/// Kahn's algorithm with declaration order as tie-break
///
/// On failure returns one concrete cycle, first node repeated at the end.
fn topological_sort(resources: Vec<Resource>) -> std::result::Result<Vec<Resource>, Vec<String>> {
    let position: HashMap<&str, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id.as_str(), i))
        .collect();

    let n = resources.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, r) in resources.iter().enumerate() {
        for dep in &r.dependencies {
            if let Some(&d) = position.get(dep.as_str()) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < n {
        let remaining: HashSet<usize> = (0..n).filter(|&i| in_degree[i] > 0).collect();
        return Err(find_cycle(&resources, &position, &remaining));
    }

    let mut slots: Vec<Option<Resource>> = resources.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}

fn find_cycle(
    resources: &[Resource],
    position: &HashMap<&str, usize>,
    remaining: &HashSet<usize>,
) -> Vec<String> {
    // Every remaining node still has a remaining dependency, so following
    // dependencies from any of them must revisit a node.
    let Some(&start) = remaining.iter().min() else {
        return Vec::new();
    };
    let mut path: Vec<usize> = Vec::new();
    let mut on_path: HashMap<usize, usize> = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&at) = on_path.get(&current) {
            let mut cycle: Vec<String> = path[at..]
                .iter()
                .map(|&i| resources[i].id.clone())
                .collect();
            cycle.push(resources[current].id.clone());
            return cycle;
        }
        on_path.insert(current, path.len());
        path.push(current);
        let next = resources[current]
            .dependencies
            .iter()
            .filter_map(|d| position.get(d.as_str()).copied())
            .find(|i| remaining.contains(i));
        match next {
            Some(i) => current = i,
            None => return path.iter().map(|&i| resources[i].id.clone()).collect(),
        }
    }
}
