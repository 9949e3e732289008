//! The graph capability surface consumed by the script engine.
//!
//! The storage engine itself is an external collaborator; the engine only
//! needs the mutation and iteration operations below. [`MemoryGraph`] is the
//! in-process implementation used by tests and as a default backend, and
//! [`event::EventedGraph`] decorates any backend with mutation listeners.

pub mod event;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::value::{EdgeRef, ElementId, Value, VertexRef};

/// A single vertex property: its value plus nested meta-properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyRecord {
    pub value: Value,
    pub meta: BTreeMap<String, Value>,
}

/// Graph operations available to scripts. Calls are synchronous because they
/// run inside the blocking evaluation worker.
pub trait GraphBackend: Send + Sync {
    fn add_vertex(&self, label: &str) -> Result<VertexRef>;
    fn remove_vertex(&self, id: ElementId) -> Result<VertexRef>;
    fn add_edge(&self, label: &str, out_v: ElementId, in_v: ElementId) -> Result<EdgeRef>;
    fn remove_edge(&self, id: ElementId) -> Result<EdgeRef>;

    /// Sets a vertex property, returning the previous value if the key
    /// already existed.
    fn set_vertex_property(&self, id: ElementId, key: &str, value: Value)
    -> Result<Option<Value>>;
    fn remove_vertex_property(&self, id: ElementId, key: &str) -> Result<Option<Value>>;
    fn set_edge_property(&self, id: ElementId, key: &str, value: Value) -> Result<Option<Value>>;
    fn remove_edge_property(&self, id: ElementId, key: &str) -> Result<Option<Value>>;

    /// Sets a meta-property on an existing vertex property.
    fn set_meta_property(
        &self,
        id: ElementId,
        key: &str,
        meta_key: &str,
        value: Value,
    ) -> Result<Option<Value>>;
    fn remove_meta_property(&self, id: ElementId, key: &str, meta_key: &str)
    -> Result<Option<Value>>;

    fn vertex(&self, id: ElementId) -> Result<Option<VertexRef>>;
    fn edge(&self, id: ElementId) -> Result<Option<EdgeRef>>;
    fn vertices(&self) -> Result<Vec<VertexRef>>;
    fn edges(&self) -> Result<Vec<EdgeRef>>;

    /// Transaction hooks used by managed sessions. Backends without
    /// transactional semantics may leave these as no-ops.
    fn tx_begin(&self) {}
    fn tx_commit(&self) {}
    fn tx_rollback(&self) {}
}

#[derive(Debug, Clone, Default)]
struct VertexRecord {
    label: String,
    properties: BTreeMap<String, PropertyRecord>,
}

#[derive(Debug, Clone)]
struct EdgeRecord {
    label: String,
    out_v: ElementId,
    in_v: ElementId,
    properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
struct GraphState {
    vertices: BTreeMap<ElementId, VertexRecord>,
    edges: BTreeMap<ElementId, EdgeRecord>,
}

/// In-memory graph with snapshot-based transactions: `tx_begin` clones the
/// state, `tx_rollback` restores it.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: Mutex<GraphState>,
    snapshot: Mutex<Option<GraphState>>,
    next_id: AtomicU64,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GraphState::default()),
            snapshot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> ElementId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GraphState> {
        // A poisoned lock means a panic mid-mutation; propagate the inner
        // guard anyway since GraphState has no invariants spanning fields.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn detach_vertex(id: ElementId, record: &VertexRecord) -> VertexRef {
        VertexRef {
            id,
            label: record.label.clone(),
            properties: record
                .properties
                .iter()
                .map(|(k, p)| (k.clone(), p.value.clone()))
                .collect(),
        }
    }

    fn detach_edge(id: ElementId, record: &EdgeRecord) -> EdgeRef {
        EdgeRef {
            id,
            label: record.label.clone(),
            out_v: record.out_v,
            in_v: record.in_v,
            properties: record.properties.clone(),
        }
    }

    fn missing_vertex(id: ElementId) -> Error {
        Error::Graph(format!("vertex {id} does not exist"))
    }

    fn missing_edge(id: ElementId) -> Error {
        Error::Graph(format!("edge {id} does not exist"))
    }
}

impl GraphBackend for MemoryGraph {
    fn add_vertex(&self, label: &str) -> Result<VertexRef> {
        let id = self.allocate_id();
        let mut state = self.lock();
        state.vertices.insert(
            id,
            VertexRecord {
                label: label.to_string(),
                properties: BTreeMap::new(),
            },
        );
        Ok(VertexRef {
            id,
            label: label.to_string(),
            properties: BTreeMap::new(),
        })
    }

    fn remove_vertex(&self, id: ElementId) -> Result<VertexRef> {
        let mut state = self.lock();
        let record = state
            .vertices
            .remove(&id)
            .ok_or_else(|| Self::missing_vertex(id))?;
        // Incident edges go with the vertex.
        state
            .edges
            .retain(|_, edge| edge.out_v != id && edge.in_v != id);
        Ok(Self::detach_vertex(id, &record))
    }

    fn add_edge(&self, label: &str, out_v: ElementId, in_v: ElementId) -> Result<EdgeRef> {
        let id = self.allocate_id();
        let mut state = self.lock();
        if !state.vertices.contains_key(&out_v) {
            return Err(Self::missing_vertex(out_v));
        }
        if !state.vertices.contains_key(&in_v) {
            return Err(Self::missing_vertex(in_v));
        }
        let record = EdgeRecord {
            label: label.to_string(),
            out_v,
            in_v,
            properties: BTreeMap::new(),
        };
        let detached = Self::detach_edge(id, &record);
        state.edges.insert(id, record);
        Ok(detached)
    }

    fn remove_edge(&self, id: ElementId) -> Result<EdgeRef> {
        let mut state = self.lock();
        let record = state
            .edges
            .remove(&id)
            .ok_or_else(|| Self::missing_edge(id))?;
        Ok(Self::detach_edge(id, &record))
    }

    fn set_vertex_property(
        &self,
        id: ElementId,
        key: &str,
        value: Value,
    ) -> Result<Option<Value>> {
        let mut state = self.lock();
        let record = state
            .vertices
            .get_mut(&id)
            .ok_or_else(|| Self::missing_vertex(id))?;
        match record.properties.get_mut(key) {
            Some(existing) => {
                let old = std::mem::replace(&mut existing.value, value);
                Ok(Some(old))
            }
            None => {
                record.properties.insert(
                    key.to_string(),
                    PropertyRecord {
                        value,
                        meta: BTreeMap::new(),
                    },
                );
                Ok(None)
            }
        }
    }

    fn remove_vertex_property(&self, id: ElementId, key: &str) -> Result<Option<Value>> {
        let mut state = self.lock();
        let record = state
            .vertices
            .get_mut(&id)
            .ok_or_else(|| Self::missing_vertex(id))?;
        Ok(record.properties.remove(key).map(|p| p.value))
    }

    fn set_edge_property(&self, id: ElementId, key: &str, value: Value) -> Result<Option<Value>> {
        let mut state = self.lock();
        let record = state
            .edges
            .get_mut(&id)
            .ok_or_else(|| Self::missing_edge(id))?;
        Ok(record.properties.insert(key.to_string(), value))
    }

    fn remove_edge_property(&self, id: ElementId, key: &str) -> Result<Option<Value>> {
        let mut state = self.lock();
        let record = state
            .edges
            .get_mut(&id)
            .ok_or_else(|| Self::missing_edge(id))?;
        Ok(record.properties.remove(key))
    }

    fn set_meta_property(
        &self,
        id: ElementId,
        key: &str,
        meta_key: &str,
        value: Value,
    ) -> Result<Option<Value>> {
        let mut state = self.lock();
        let record = state
            .vertices
            .get_mut(&id)
            .ok_or_else(|| Self::missing_vertex(id))?;
        let property = record
            .properties
            .get_mut(key)
            .ok_or_else(|| Error::Graph(format!("vertex {id} has no property '{key}'")))?;
        Ok(property.meta.insert(meta_key.to_string(), value))
    }

    fn remove_meta_property(
        &self,
        id: ElementId,
        key: &str,
        meta_key: &str,
    ) -> Result<Option<Value>> {
        let mut state = self.lock();
        let record = state
            .vertices
            .get_mut(&id)
            .ok_or_else(|| Self::missing_vertex(id))?;
        let property = record
            .properties
            .get_mut(key)
            .ok_or_else(|| Error::Graph(format!("vertex {id} has no property '{key}'")))?;
        Ok(property.meta.remove(meta_key))
    }

    fn vertex(&self, id: ElementId) -> Result<Option<VertexRef>> {
        let state = self.lock();
        Ok(state
            .vertices
            .get(&id)
            .map(|record| Self::detach_vertex(id, record)))
    }

    fn edge(&self, id: ElementId) -> Result<Option<EdgeRef>> {
        let state = self.lock();
        Ok(state
            .edges
            .get(&id)
            .map(|record| Self::detach_edge(id, record)))
    }

    fn vertices(&self) -> Result<Vec<VertexRef>> {
        let state = self.lock();
        Ok(state
            .vertices
            .iter()
            .map(|(id, record)| Self::detach_vertex(*id, record))
            .collect())
    }

    fn edges(&self) -> Result<Vec<EdgeRef>> {
        let state = self.lock();
        Ok(state
            .edges
            .iter()
            .map(|(id, record)| Self::detach_edge(*id, record))
            .collect())
    }

    fn tx_begin(&self) {
        let snapshot = self.lock().clone();
        if let Ok(mut slot) = self.snapshot.lock() {
            *slot = Some(snapshot);
        }
    }

    fn tx_commit(&self) {
        if let Ok(mut slot) = self.snapshot.lock() {
            *slot = None;
        }
    }

    fn tx_rollback(&self) {
        let restored = match self.snapshot.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(snapshot) = restored {
            *self.lock() = snapshot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_look_up_vertex() {
        let graph = MemoryGraph::new();
        let v = graph.add_vertex("person").unwrap();
        let found = graph.vertex(v.id).unwrap().unwrap();
        assert_eq!(found.label, "person");
    }

    #[test]
    fn set_property_reports_prior_value() {
        let graph = MemoryGraph::new();
        let v = graph.add_vertex("person").unwrap();
        assert_eq!(
            graph
                .set_vertex_property(v.id, "name", Value::from("marko"))
                .unwrap(),
            None
        );
        assert_eq!(
            graph
                .set_vertex_property(v.id, "name", Value::from("josh"))
                .unwrap(),
            Some(Value::from("marko"))
        );
    }

    #[test]
    fn removing_vertex_drops_incident_edges() {
        let graph = MemoryGraph::new();
        let a = graph.add_vertex("person").unwrap();
        let b = graph.add_vertex("person").unwrap();
        graph.add_edge("knows", a.id, b.id).unwrap();
        graph.remove_vertex(a.id).unwrap();
        assert!(graph.edges().unwrap().is_empty());
    }

    #[test]
    fn edge_to_missing_vertex_is_an_error() {
        let graph = MemoryGraph::new();
        let a = graph.add_vertex("person").unwrap();
        assert!(graph.add_edge("knows", a.id, 999).is_err());
    }

    #[test]
    fn rollback_restores_the_snapshot() {
        let graph = MemoryGraph::new();
        let keep = graph.add_vertex("person").unwrap();
        graph.tx_begin();
        graph.add_vertex("software").unwrap();
        graph
            .set_vertex_property(keep.id, "name", Value::from("marko"))
            .unwrap();
        graph.tx_rollback();
        assert_eq!(graph.vertices().unwrap().len(), 1);
        assert!(graph.vertex(keep.id).unwrap().unwrap().properties.is_empty());
    }

    #[test]
    fn commit_discards_the_snapshot() {
        let graph = MemoryGraph::new();
        graph.tx_begin();
        graph.add_vertex("person").unwrap();
        graph.tx_commit();
        graph.tx_rollback();
        assert_eq!(graph.vertices().unwrap().len(), 1);
    }

    #[test]
    fn meta_property_requires_the_owning_property() {
        let graph = MemoryGraph::new();
        let v = graph.add_vertex("person").unwrap();
        assert!(
            graph
                .set_meta_property(v.id, "name", "acl", Value::from("public"))
                .is_err()
        );
        graph
            .set_vertex_property(v.id, "name", Value::from("marko"))
            .unwrap();
        assert_eq!(
            graph
                .set_meta_property(v.id, "name", "acl", Value::from("public"))
                .unwrap(),
            None
        );
    }
}
