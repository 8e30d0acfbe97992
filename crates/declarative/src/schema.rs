//! Resource kind schemas
//!
//! A schema tells the graph builder which attributes a kind exports and
//! tells the diff engine which properties can change in place. Properties
//! not listed as mutable are immutable: changing them forces a replace.

use std::collections::{BTreeSet, HashMap};

/// Attribute every created resource exports
pub const ID_ATTRIBUTE: &str = "id";

/// Schema of one resource kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSchema {
    pub name: String,
    pub description: String,
    mutable: BTreeSet<String>,
    outputs: BTreeSet<String>,
}

impl KindSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            mutable: BTreeSet::new(),
            outputs: BTreeSet::from([ID_ATTRIBUTE.to_string()]),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn mutable<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mutable.extend(properties.into_iter().map(Into::into));
        self
    }

    pub fn outputs<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(attributes.into_iter().map(Into::into));
        self
    }

    pub fn is_mutable(&self, property: &str) -> bool {
        self.mutable.contains(property)
    }

    pub fn exports(&self, attribute: &str) -> bool {
        self.outputs.contains(attribute)
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(String::as_str)
    }

    pub fn mutable_properties(&self) -> impl Iterator<Item = &str> {
        self.mutable.iter().map(String::as_str)
    }
}

/// Registry of the kinds a provider understands
#[derive(Debug, Clone, Default)]
pub struct KindCatalog {
    kinds: HashMap<String, KindSchema>,
}

impl KindCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, replacing any previous one with the same name
    pub fn register(&mut self, schema: KindSchema) -> &mut Self {
        self.kinds.insert(schema.name.clone(), schema);
        self
    }

    pub fn with(mut self, schema: KindSchema) -> Self {
        self.register(schema);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&KindSchema> {
        self.kinds.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Kind names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether every listed property may change in place
    ///
    /// Unknown kinds are treated as fully immutable.
    pub fn all_mutable<'a, I>(&self, kind: &str, properties: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        match self.get(kind) {
            Some(schema) => properties.into_iter().all(|p| schema.is_mutable(p)),
            None => false,
        }
    }
}
