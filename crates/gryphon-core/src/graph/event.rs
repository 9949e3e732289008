//! Mutation-event notification.
//!
//! [`EventedGraph`] decorates a [`GraphBackend`] so that every successful
//! mutation invokes registered listeners synchronously, in registration
//! order, exactly once per logical mutation, after the change is applied and
//! before control returns to the caller. A misbehaving listener is isolated:
//! its panic is caught and logged, later listeners still run, and the
//! mutation is never rolled back.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::error;

use super::GraphBackend;
use crate::error::Result;
use crate::value::{EdgeRef, ElementId, Value, VertexRef};

/// Callbacks fired by [`EventedGraph`]. All methods default to no-ops so
/// listeners implement only what they care about.
///
/// The first assignment of a property key fires the `*_property_added`
/// variant; only a reassignment of an existing key fires `*_property_changed`,
/// which carries the prior value.
pub trait GraphChangedListener: Send + Sync {
    fn vertex_added(&self, _vertex: &VertexRef) {}
    fn vertex_removed(&self, _vertex: &VertexRef) {}
    fn edge_added(&self, _edge: &EdgeRef) {}
    fn edge_removed(&self, _edge: &EdgeRef) {}

    fn vertex_property_added(&self, _vertex: &VertexRef, _key: &str, _value: &Value) {}
    fn vertex_property_changed(&self, _vertex: &VertexRef, _key: &str, _old: &Value, _new: &Value) {
    }
    fn vertex_property_removed(&self, _vertex: &VertexRef, _key: &str, _old: &Value) {}

    fn edge_property_added(&self, _edge: &EdgeRef, _key: &str, _value: &Value) {}
    fn edge_property_changed(&self, _edge: &EdgeRef, _key: &str, _old: &Value, _new: &Value) {}
    fn edge_property_removed(&self, _edge: &EdgeRef, _key: &str, _old: &Value) {}

    fn meta_property_changed(
        &self,
        _vertex: &VertexRef,
        _key: &str,
        _meta_key: &str,
        _old: Option<&Value>,
        _new: &Value,
    ) {
    }
    fn meta_property_removed(&self, _vertex: &VertexRef, _key: &str, _meta_key: &str, _old: &Value) {
    }
}

/// Decorates a backend with an explicit, ordered list of listener handles.
pub struct EventedGraph {
    inner: Arc<dyn GraphBackend>,
    listeners: Vec<Arc<dyn GraphChangedListener>>,
}

impl EventedGraph {
    pub fn new(inner: Arc<dyn GraphBackend>) -> Self {
        Self {
            inner,
            listeners: Vec::new(),
        }
    }

    /// Listeners fire in the order they were added.
    pub fn add_listener(mut self, listener: Arc<dyn GraphChangedListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    fn notify(&self, fire: impl Fn(&dyn GraphChangedListener)) {
        for listener in &self.listeners {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| fire(listener.as_ref())));
            if outcome.is_err() {
                error!("graph listener panicked; continuing with remaining listeners");
            }
        }
    }

    fn resolve_vertex(&self, id: ElementId) -> Result<VertexRef> {
        Ok(self.inner.vertex(id)?.unwrap_or(VertexRef {
            id,
            label: String::new(),
            properties: Default::default(),
        }))
    }

    fn resolve_edge(&self, id: ElementId) -> Result<EdgeRef> {
        Ok(self.inner.edge(id)?.unwrap_or(EdgeRef {
            id,
            label: String::new(),
            out_v: 0,
            in_v: 0,
            properties: Default::default(),
        }))
    }
}

impl GraphBackend for EventedGraph {
    fn add_vertex(&self, label: &str) -> Result<VertexRef> {
        let vertex = self.inner.add_vertex(label)?;
        self.notify(|l| l.vertex_added(&vertex));
        Ok(vertex)
    }

    fn remove_vertex(&self, id: ElementId) -> Result<VertexRef> {
        let vertex = self.inner.remove_vertex(id)?;
        self.notify(|l| l.vertex_removed(&vertex));
        Ok(vertex)
    }

    fn add_edge(&self, label: &str, out_v: ElementId, in_v: ElementId) -> Result<EdgeRef> {
        let edge = self.inner.add_edge(label, out_v, in_v)?;
        self.notify(|l| l.edge_added(&edge));
        Ok(edge)
    }

    fn remove_edge(&self, id: ElementId) -> Result<EdgeRef> {
        let edge = self.inner.remove_edge(id)?;
        self.notify(|l| l.edge_removed(&edge));
        Ok(edge)
    }

    fn set_vertex_property(
        &self,
        id: ElementId,
        key: &str,
        value: Value,
    ) -> Result<Option<Value>> {
        let old = self.inner.set_vertex_property(id, key, value.clone())?;
        let vertex = self.resolve_vertex(id)?;
        match &old {
            Some(prior) => self.notify(|l| l.vertex_property_changed(&vertex, key, prior, &value)),
            None => self.notify(|l| l.vertex_property_added(&vertex, key, &value)),
        }
        Ok(old)
    }

    fn remove_vertex_property(&self, id: ElementId, key: &str) -> Result<Option<Value>> {
        let old = self.inner.remove_vertex_property(id, key)?;
        if let Some(prior) = &old {
            let vertex = self.resolve_vertex(id)?;
            self.notify(|l| l.vertex_property_removed(&vertex, key, prior));
        }
        Ok(old)
    }

    fn set_edge_property(&self, id: ElementId, key: &str, value: Value) -> Result<Option<Value>> {
        let old = self.inner.set_edge_property(id, key, value.clone())?;
        let edge = self.resolve_edge(id)?;
        match &old {
            Some(prior) => self.notify(|l| l.edge_property_changed(&edge, key, prior, &value)),
            None => self.notify(|l| l.edge_property_added(&edge, key, &value)),
        }
        Ok(old)
    }

    fn remove_edge_property(&self, id: ElementId, key: &str) -> Result<Option<Value>> {
        let old = self.inner.remove_edge_property(id, key)?;
        if let Some(prior) = &old {
            let edge = self.resolve_edge(id)?;
            self.notify(|l| l.edge_property_removed(&edge, key, prior));
        }
        Ok(old)
    }

    fn set_meta_property(
        &self,
        id: ElementId,
        key: &str,
        meta_key: &str,
        value: Value,
    ) -> Result<Option<Value>> {
        let old = self.inner.set_meta_property(id, key, meta_key, value.clone())?;
        let vertex = self.resolve_vertex(id)?;
        self.notify(|l| l.meta_property_changed(&vertex, key, meta_key, old.as_ref(), &value));
        Ok(old)
    }

    fn remove_meta_property(
        &self,
        id: ElementId,
        key: &str,
        meta_key: &str,
    ) -> Result<Option<Value>> {
        let old = self.inner.remove_meta_property(id, key, meta_key)?;
        if let Some(prior) = &old {
            let vertex = self.resolve_vertex(id)?;
            self.notify(|l| l.meta_property_removed(&vertex, key, meta_key, prior));
        }
        Ok(old)
    }

    fn vertex(&self, id: ElementId) -> Result<Option<VertexRef>> {
        self.inner.vertex(id)
    }

    fn edge(&self, id: ElementId) -> Result<Option<EdgeRef>> {
        self.inner.edge(id)
    }

    fn vertices(&self) -> Result<Vec<VertexRef>> {
        self.inner.vertices()
    }

    fn edges(&self) -> Result<Vec<EdgeRef>> {
        self.inner.edges()
    }

    fn tx_begin(&self) {
        self.inner.tx_begin();
    }

    fn tx_commit(&self) {
        self.inner.tx_commit();
    }

    fn tx_rollback(&self) {
        self.inner.tx_rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use std::sync::Mutex;

    /// Records every callback it receives, tagged with its own name.
    struct StubListener {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl StubListener {
        fn new(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self { name, log })
        }

        fn record(&self, event: impl std::fmt::Display) {
            self.log.lock().unwrap().push(format!("{}:{event}", self.name));
        }
    }

    impl GraphChangedListener for StubListener {
        fn vertex_added(&self, vertex: &VertexRef) {
            self.record(format!("vertex_added:{}", vertex.id));
        }
        fn vertex_removed(&self, vertex: &VertexRef) {
            self.record(format!("vertex_removed:{}", vertex.id));
        }
        fn edge_added(&self, edge: &EdgeRef) {
            self.record(format!("edge_added:{}", edge.id));
        }
        fn vertex_property_added(&self, _vertex: &VertexRef, key: &str, value: &Value) {
            self.record(format!("vp_added:{key}={value}"));
        }
        fn vertex_property_changed(
            &self,
            _vertex: &VertexRef,
            key: &str,
            old: &Value,
            new: &Value,
        ) {
            self.record(format!("vp_changed:{key}:{old}->{new}"));
        }
        fn vertex_property_removed(&self, _vertex: &VertexRef, key: &str, old: &Value) {
            self.record(format!("vp_removed:{key}={old}"));
        }
    }

    fn evented(log: &Arc<Mutex<Vec<String>>>) -> EventedGraph {
        EventedGraph::new(Arc::new(MemoryGraph::new()))
            .add_listener(StubListener::new("l1", log.clone()))
            .add_listener(StubListener::new("l2", log.clone()))
    }

    #[test]
    fn add_vertex_fires_once_per_listener_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = evented(&log);
        let v = graph.add_vertex("person").unwrap();
        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                format!("l1:vertex_added:{}", v.id),
                format!("l2:vertex_added:{}", v.id)
            ]
        );
    }

    #[test]
    fn first_assignment_fires_added_then_changed_then_removed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = evented(&log);
        let v = graph.add_vertex("person").unwrap();
        graph
            .set_vertex_property(v.id, "name", Value::from("marko"))
            .unwrap();
        graph
            .set_vertex_property(v.id, "name", Value::from("josh"))
            .unwrap();
        graph.remove_vertex_property(v.id, "name").unwrap();

        let events = log.lock().unwrap().clone();
        let l1: Vec<_> = events.iter().filter(|e| e.starts_with("l1:")).collect();
        assert_eq!(
            l1,
            vec![
                &format!("l1:vertex_added:{}", v.id),
                &"l1:vp_added:name=marko".to_string(),
                &"l1:vp_changed:name:marko->josh".to_string(),
                &"l1:vp_removed:name=josh".to_string(),
            ]
        );
    }

    #[test]
    fn removing_a_missing_property_fires_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = evented(&log);
        let v = graph.add_vertex("person").unwrap();
        log.lock().unwrap().clear();
        graph.remove_vertex_property(v.id, "name").unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_listener_does_not_block_later_listeners_or_the_mutation() {
        struct Exploding;
        impl GraphChangedListener for Exploding {
            fn vertex_added(&self, _vertex: &VertexRef) {
                panic!("listener bug");
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = EventedGraph::new(Arc::new(MemoryGraph::new()))
            .add_listener(Arc::new(Exploding))
            .add_listener(StubListener::new("l2", log.clone()));

        let v = graph.add_vertex("person").unwrap();
        assert!(graph.vertex(v.id).unwrap().is_some());
        assert_eq!(
            log.lock().unwrap().clone(),
            vec![format!("l2:vertex_added:{}", v.id)]
        );
    }

    #[test]
    fn failed_mutation_fires_no_events() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = evented(&log);
        log.lock().unwrap().clear();
        assert!(graph.remove_vertex(42).is_err());
        assert!(log.lock().unwrap().is_empty());
    }
}
