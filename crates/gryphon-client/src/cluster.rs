//! Cluster construction and host selection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gryphon_core::serializer::{SerializerFormat, TypeRegistry};

use crate::client::Client;
use crate::error::{ClientError, Result};
use crate::host::{Host, HostState};

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// A set of interchangeable server endpoints. Requests rotate round-robin
/// across the hosts currently marked available.
pub struct Cluster {
    hosts: Vec<Arc<Host>>,
    next: AtomicUsize,
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder {
            addrs: Vec::new(),
            format: SerializerFormat::GraphJson,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            registry: TypeRegistry::with_graph_types(),
        }
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn available_hosts(&self) -> usize {
        self.hosts.iter().filter(|h| h.is_available()).count()
    }

    /// Picks the next available host, failing fast when every host is dead.
    pub(crate) fn pick(&self) -> Result<Arc<Host>> {
        let n = self.hosts.len();
        if n == 0 {
            return Err(ClientError::NoHostAvailable);
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for offset in 0..n {
            let host = &self.hosts[(start + offset) % n];
            if host.state() == HostState::Available {
                return Ok(Arc::clone(host));
            }
        }
        Err(ClientError::NoHostAvailable)
    }
}

pub struct ClusterBuilder {
    addrs: Vec<String>,
    format: SerializerFormat,
    reconnect_interval: Duration,
    registry: TypeRegistry,
}

impl ClusterBuilder {
    pub fn address(mut self, addr: impl Into<String>) -> Self {
        self.addrs.push(addr.into());
        self
    }

    pub fn serializer(mut self, format: SerializerFormat) -> Self {
        self.format = format;
        self
    }

    /// How often a dead host is probed for recovery.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Registers an additional type name with the compact serializer.
    pub fn register_type(mut self, type_name: impl Into<String>) -> Self {
        self.registry.register(type_name);
        self
    }

    /// Connects to every host. Unreachable hosts start dead and are probed;
    /// the client is usable as long as at least one host comes up.
    pub async fn connect(self) -> Result<Client> {
        if self.addrs.is_empty() {
            return Err(ClientError::NoHostAvailable);
        }
        let registry = Arc::new(self.registry);
        let mut hosts = Vec::with_capacity(self.addrs.len());
        for addr in self.addrs {
            let host = Host::new(
                addr,
                self.format,
                Arc::clone(&registry),
                self.reconnect_interval,
            );
            host.connect_or_probe().await;
            hosts.push(host);
        }
        Ok(Client::new(Arc::new(Cluster {
            hosts,
            next: AtomicUsize::new(0),
        })))
    }
}
