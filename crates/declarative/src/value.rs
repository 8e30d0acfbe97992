//! Configuration values and references between resources
//!
//! A whole-string `${vpc.id}` refers to the `id` output of resource `vpc`;
//! `${params.vpc_cidr}` refers to a stack parameter. Persisted references
//! serialize as `{"$ref": "vpc.id"}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved prefix for parameter references
pub const PARAMS_PREFIX: &str = "params";

/// A reference to a parameter or to another resource's exported attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Reference {
    Parameter { name: String },
    Output { resource: String, attribute: String },
}

impl Reference {
    pub fn output(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::Output {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        Self::Parameter { name: name.into() }
    }

    /// Parse `resource.attribute` or `params.name`
    pub fn parse(s: &str) -> Option<Self> {
        let (head, tail) = s.trim().split_once('.')?;
        if head.is_empty() || tail.is_empty() || tail.contains(char::is_whitespace) {
            return None;
        }
        if head == PARAMS_PREFIX {
            Some(Self::parameter(tail))
        } else {
            Some(Self::output(head, tail))
        }
    }

    /// Parse a whole-string template like `${vpc.id}`
    pub fn parse_template(s: &str) -> Option<Self> {
        let inner = s.strip_prefix("${")?.strip_suffix('}')?;
        if inner.contains(['{', '}', '$']) {
            return None;
        }
        Self::parse(inner)
    }

    /// The resource this reference points at, if any
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::Output { resource, .. } => Some(resource),
            Self::Parameter { .. } => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parameter { name } => write!(f, "{PARAMS_PREFIX}.{name}"),
            Self::Output {
                resource,
                attribute,
            } => write!(f, "{resource}.{attribute}"),
        }
    }
}

impl TryFrom<String> for Reference {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("invalid reference '{s}'"))
    }
}

impl From<Reference> for String {
    fn from(r: Reference) -> Self {
        r.to_string()
    }
}

/// A configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Repr", into = "Repr")]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Ref(Reference),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Ref(RefRepr),
    Map(BTreeMap<String, Value>),
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RefRepr {
    #[serde(rename = "$ref")]
    target: Reference,
}

impl From<Repr> for Value {
    fn from(repr: Repr) -> Self {
        match repr {
            Repr::Bool(b) => Self::Bool(b),
            Repr::Integer(i) => Self::Integer(i),
            Repr::Float(f) => Self::Float(f),
            Repr::String(s) => Self::String(s),
            Repr::List(l) => Self::List(l),
            Repr::Ref(r) => Self::Ref(r.target),
            Repr::Map(m) => Self::Map(m),
        }
    }
}

impl From<Value> for Repr {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => Self::Bool(b),
            Value::Integer(i) => Self::Integer(i),
            Value::Float(f) => Self::Float(f),
            Value::String(s) => Self::String(s),
            Value::List(l) => Self::List(l),
            Value::Map(m) => Self::Map(m),
            Value::Ref(target) => Self::Ref(RefRepr { target }),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Self::Ref(r)
    }
}

impl Value {
    /// Parse a scalar from the command line: bool, integer, float, else string
    pub fn parse_scalar(s: &str) -> Self {
        match s {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(i) = s.parse::<i64>() {
            return Self::Integer(i);
        }
        if let Ok(f) = s.parse::<f64>()
            && f.is_finite()
        {
            return Self::Float(f);
        }
        Self::String(s.to_string())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Turn whole-string `${...}` templates into references, recursively
    pub fn expand_references(self) -> Self {
        match self {
            Self::String(s) => match Reference::parse_template(&s) {
                Some(r) => Self::Ref(r),
                None => Self::String(s),
            },
            Self::List(items) => {
                Self::List(items.into_iter().map(Self::expand_references).collect())
            }
            Self::Map(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, v.expand_references()))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Every reference contained in this value, depth first
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Ref(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(out)),
            _ => {}
        }
    }

    /// Rebuild the value, replacing references for which `f` returns a value
    pub fn replace_references<F, E>(&self, f: &mut F) -> Result<Self, E>
    where
        F: FnMut(&Reference) -> Result<Option<Self>, E>,
    {
        Ok(match self {
            Self::Ref(r) => match f(r)? {
                Some(v) => v,
                None => self.clone(),
            },
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(|v| v.replace_references(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.replace_references(f)?)))
                    .collect::<Result<_, _>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Convert to JSON, resolving every remaining reference through `f`
    pub fn to_json<F, E>(&self, f: &mut F) -> Result<serde_json::Value, E>
    where
        F: FnMut(&Reference) -> Result<serde_json::Value, E>,
    {
        use serde_json::Value as Json;

        Ok(match self {
            Self::Bool(b) => Json::Bool(*b),
            Self::Integer(i) => Json::from(*i),
            Self::Float(x) => serde_json::Number::from_f64(*x).map_or(Json::Null, Json::Number),
            Self::String(s) => Json::String(s.clone()),
            Self::List(items) => Json::Array(
                items
                    .iter()
                    .map(|v| v.to_json(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json(f)?)))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Ref(r) => f(r)?,
        })
    }

    /// Convert a JSON value; `null` becomes an empty string
    pub fn from_json(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Self::String(String::new()),
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .unwrap_or_else(|| Self::Float(n.as_f64().unwrap_or_default())),
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::List(items.into_iter().map(Self::from_json).collect()),
            Json::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Ref(r) => write!(f, "${{{r}}}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Self::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k} = {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}
