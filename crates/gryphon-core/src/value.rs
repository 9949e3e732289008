use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned to graph elements by the backend.
pub type ElementId = u64;

/// A detached snapshot of a vertex, safe to ship over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexRef {
    pub id: ElementId,
    pub label: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

/// A detached snapshot of an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRef {
    pub id: ElementId,
    pub label: String,
    pub out_v: ElementId,
    pub in_v: ElementId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

/// The domain value model shared by the script engine, the serializers, and
/// both sides of the wire protocol.
///
/// The self-describing wire form tags every node with `@type`/`@value`, so a
/// reader needs no out-of-band schema to decode it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type", content = "@value", rename_all = "camelCase")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Uuid(Uuid),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Vertex(VertexRef),
    Edge(EdgeRef),
    /// A backend-defined type. The compact serializer refuses these unless
    /// the type name is registered.
    Custom {
        type_name: String,
        fields: BTreeMap<String, Value>,
    },
}

impl Value {
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Uuid(_) => "uuid",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Vertex(_) => "vertex",
            Value::Edge(_) => "edge",
            Value::Custom { type_name, .. } => type_name,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Walks the value tree and returns the path of the first node nested
    /// deeper than `limit`. Used by both serializers to reject cyclic or
    /// pathologically nested structures before any bytes are written.
    pub fn deepest_violation(&self, limit: usize) -> Option<String> {
        fn walk(value: &Value, depth: usize, limit: usize, path: &mut Vec<String>) -> bool {
            if depth > limit {
                return true;
            }
            match value {
                Value::List(items) => {
                    for (i, item) in items.iter().enumerate() {
                        path.push(format!("[{i}]"));
                        if walk(item, depth + 1, limit, path) {
                            return true;
                        }
                        path.pop();
                    }
                }
                Value::Map(entries) | Value::Custom {
                    fields: entries, ..
                } => {
                    for (key, item) in entries {
                        path.push(key.clone());
                        if walk(item, depth + 1, limit, path) {
                            return true;
                        }
                        path.pop();
                    }
                }
                Value::Vertex(v) => {
                    for (key, item) in &v.properties {
                        path.push(key.clone());
                        if walk(item, depth + 1, limit, path) {
                            return true;
                        }
                        path.pop();
                    }
                }
                Value::Edge(e) => {
                    for (key, item) in &e.properties {
                        path.push(key.clone());
                        if walk(item, depth + 1, limit, path) {
                            return true;
                        }
                        path.pop();
                    }
                }
                _ => {}
            }
            false
        }

        let mut path = Vec::new();
        if walk(self, 0, limit, &mut path) {
            Some(path.join("."))
        } else {
            None
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Uuid(u) => write!(f, "{u}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                write!(f, "}}")
            }
            Value::Vertex(v) => write!(f, "v[{}]", v.id),
            Value::Edge(e) => write!(f, "e[{}][{}->{}]", e.id, e.out_v, e.in_v),
            Value::Custom { type_name, .. } => write!(f, "{type_name}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_values_pass_the_depth_check() {
        let v = Value::List(vec![Value::Int(1), Value::Str("a".into())]);
        assert_eq!(v.deepest_violation(8), None);
    }

    #[test]
    fn deep_nesting_reports_the_offending_path() {
        let mut v = Value::Int(0);
        for _ in 0..10 {
            v = Value::List(vec![v]);
        }
        let path = v.deepest_violation(4).unwrap();
        assert!(path.starts_with("[0].[0]"));
    }
}
