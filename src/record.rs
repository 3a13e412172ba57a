//! Record model shared by plugins, the cache, and the conflict ledger.
//!
//! Both the target and the context of a run are JSON objects. Fields are
//! addressed by a [`FieldKey`]: the scope they live in plus a dot-separated
//! path (`company.crunchbase`). Plugins never mutate the record directly;
//! they return a [`Patch`] that the scheduler merges.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which of the two run objects a field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The record being enriched
    Target,
    /// Side data shared between plugins
    Context,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Target => "target",
            Scope::Context => "context",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Address of a single field within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    pub scope: Scope,
    pub path: String,
}

impl FieldKey {
    pub fn target(path: impl Into<String>) -> Self {
        Self {
            scope: Scope::Target,
            path: path.into(),
        }
    }

    pub fn context(path: impl Into<String>) -> Self {
        Self {
            scope: Scope::Context,
            path: path.into(),
        }
    }

    /// Key of the field `segment` nested under this one.
    pub fn child(&self, segment: &str) -> Self {
        let path = if self.path.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", self.path, segment)
        };
        Self {
            scope: self.scope,
            path,
        }
    }

    /// Whether writing one key can replace the value at the other: same
    /// field, or one is an ancestor of the other.
    pub fn overlaps(&self, other: &FieldKey) -> bool {
        if self.scope != other.scope {
            return false;
        }
        self.segments()
            .zip(other.segments())
            .all(|(a, b)| a == b)
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('.').filter(|s| !s.is_empty())
    }
}

impl std::fmt::Display for FieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.scope, self.path)
    }
}

impl std::str::FromStr for FieldKey {
    type Err = String;

    /// Parses `target.a.b` / `context.a.b`; a bare path is a target field.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = match s.split_once('.') {
            Some(("target", rest)) => FieldKey::target(rest),
            Some(("context", rest)) => FieldKey::context(rest),
            _ => FieldKey::target(s),
        };
        if key.segments().next().is_none() {
            return Err(format!("Invalid field key '{}'", s));
        }
        Ok(key)
    }
}

/// A value proposed for a field together with the plugin that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub producer: String,
    pub value: Value,
}

impl FieldWrite {
    pub fn new(producer: impl Into<String>, value: Value) -> Self {
        Self {
            producer: producer.into(),
            value,
        }
    }
}

/// An ordered set of proposed field writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    writes: Vec<(FieldKey, Value)>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Propose a value for a target field.
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.writes.push((FieldKey::target(path), value.into()));
        self
    }

    /// Propose a value for a context field.
    pub fn set_context(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.writes.push((FieldKey::context(path), value.into()));
        self
    }

    pub fn push(&mut self, key: FieldKey, value: Value) {
        self.writes.push((key, value));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(FieldKey, Value)> {
        self.writes.iter()
    }
}

impl IntoIterator for Patch {
    type Item = (FieldKey, Value);
    type IntoIter = std::vec::IntoIter<(FieldKey, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

/// Read-only view of the run objects handed to predicates and actions.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub target: &'a Value,
    pub context: &'a Value,
}

impl<'a> RecordView<'a> {
    pub fn new(target: &'a Value, context: &'a Value) -> Self {
        Self { target, context }
    }

    pub fn get(&self, key: &FieldKey) -> Option<&'a Value> {
        match key.scope {
            Scope::Target => get_path(self.target, &key.path),
            Scope::Context => get_path(self.context, &key.path),
        }
    }

    /// Target field at `path`, if present and not null.
    pub fn field(&self, path: &str) -> Option<&'a Value> {
        get_path(self.target, path).filter(|v| !v.is_null())
    }

    /// Target string field at `path`.
    pub fn str_field(&self, path: &str) -> Option<&'a str> {
        self.field(path).and_then(Value::as_str)
    }

    pub fn has(&self, path: &str) -> bool {
        self.field(path).is_some()
    }
}

/// Look up a dot-separated path inside a JSON value.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

/// Write `value` at a dot-separated path, creating intermediate objects.
///
/// A non-object value sitting on the path is replaced by an object.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut node = root;
    for segment in parents {
        let map = ensure_object(node);
        node = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node).insert((*last).to_string(), value);
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced by an object"),
    }
}

/// Expand a write into one write per leaf path.
///
/// Non-empty objects are descended into; every other value, including an
/// empty object, is a leaf.
pub fn flatten_write(key: FieldKey, value: Value) -> Vec<(FieldKey, Value)> {
    let mut leaves = Vec::new();
    flatten_into(key, value, &mut leaves);
    leaves
}

fn flatten_into(key: FieldKey, value: Value, leaves: &mut Vec<(FieldKey, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (field, child) in map {
                flatten_into(key.child(&field), child, leaves);
            }
        }
        other => leaves.push((key, other)),
    }
}

/// Human-readable JSON kind, used in error messages.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
